//! `change-log-maint`: maintenance entrypoint for change log storage.
//!
//! Exactly one operation flag is accepted per run. Results go to stdout as
//! text or JSON (and optionally to `--output-file`); logs go to stderr.
//! [`run_cli`] returns `Ok(false)` when the operation reported a failure, which
//! the binary maps to exit code 1.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use change_log_core::{ChangeLogConfig, CharacterId};
use change_log_store_fs::{
    CharacterStatistics, ChangeLogStore, HealthStatus, MaintenanceRun, MaintenanceService,
    StorageHealth, SweepResult, WrittenReport,
};
use clap::{ArgGroup, Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "change-log-maint")]
#[command(about = "Character change log maintenance")]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .multiple(false)
        .args([
            "health_check",
            "rotate",
            "cleanup",
            "validate",
            "optimize",
            "full_maintenance",
            "report",
            "character_stats",
        ])
))]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Check storage health.
    #[arg(long)]
    health_check: bool,
    /// Rotate log files above the size threshold.
    #[arg(long)]
    rotate: bool,
    /// Archive or delete logs past the retention period.
    #[arg(long)]
    cleanup: bool,
    /// Validate every log file, repairing counter drift.
    #[arg(long)]
    validate: bool,
    /// Normalize the storage layout and remove stale temp files.
    #[arg(long)]
    optimize: bool,
    /// Run every maintenance step in order.
    #[arg(long)]
    full_maintenance: bool,
    /// Write a maintenance report.
    #[arg(long)]
    report: bool,
    /// Show statistics for one character.
    #[arg(long, value_name = "ID")]
    character_stats: Option<u64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
    #[arg(long, value_name = "PATH")]
    output_file: Option<PathBuf>,
    /// Overrides `storage_dir` from the configuration.
    #[arg(long, value_name = "PATH")]
    storage_dir: Option<PathBuf>,
    /// JSON configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    fn operation(&self) -> Operation {
        if let Some(id) = self.character_stats {
            Operation::CharacterStats(CharacterId(id))
        } else if self.health_check {
            Operation::HealthCheck
        } else if self.rotate {
            Operation::Rotate
        } else if self.cleanup {
            Operation::Cleanup
        } else if self.validate {
            Operation::Validate
        } else if self.optimize {
            Operation::Optimize
        } else if self.full_maintenance {
            Operation::FullMaintenance
        } else {
            Operation::Report
        }
    }

    fn load_config(&self) -> Result<ChangeLogConfig> {
        let mut config = match &self.config {
            Some(path) => ChangeLogConfig::from_json_file(path)?,
            None => ChangeLogConfig::default(),
        };
        if let Some(storage_dir) = &self.storage_dir {
            config.storage_dir.clone_from(storage_dir);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    HealthCheck,
    Rotate,
    Cleanup,
    Validate,
    Optimize,
    FullMaintenance,
    Report,
    CharacterStats(CharacterId),
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::Rotate => "rotate",
            Self::Cleanup => "cleanup",
            Self::Validate => "validate",
            Self::Optimize => "optimize",
            Self::FullMaintenance => "full_maintenance",
            Self::Report => "report",
            Self::CharacterStats(_) => "character_stats",
        }
    }
}

/// What an operation produced, before rendering.
enum Outcome {
    Health(StorageHealth),
    Sweep(SweepResult),
    Run(MaintenanceRun),
    Report(WrittenReport),
    Stats(CharacterStatistics),
}

impl Outcome {
    fn success(&self) -> bool {
        match self {
            Self::Health(health) => health.status <= HealthStatus::Warning,
            Self::Sweep(result) => result.success,
            Self::Run(run) => run.success(),
            Self::Report(_) | Self::Stats(_) => true,
        }
    }

    fn payload(&self) -> Result<Value> {
        let value = match self {
            Self::Health(health) => serde_json::to_value(health),
            Self::Sweep(result) => serde_json::to_value(result),
            Self::Run(run) => serde_json::to_value(run),
            Self::Report(written) => serde_json::to_value(written),
            Self::Stats(stats) => serde_json::to_value(stats),
        };
        value.context("failed to encode operation result")
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    operation: &'a str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Installs a stderr `fmt` subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed command. Returns whether the operation succeeded.
///
/// # Errors
/// Returns an error when the configuration is invalid, the store cannot be
/// opened, or output cannot be written.
pub fn run_cli(cli: Cli) -> Result<bool> {
    let config = cli.load_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run_operation(&cli, config))
}

async fn run_operation(cli: &Cli, config: ChangeLogConfig) -> Result<bool> {
    let operation = cli.operation();
    debug!(operation = operation.as_str(), storage_dir = %config.storage_dir.display(), "running maintenance operation");

    let store = Arc::new(ChangeLogStore::open(config).await?);
    let service = MaintenanceService::new(Arc::clone(&store));

    let outcome = match operation {
        Operation::HealthCheck => Ok(Outcome::Health(service.check_storage_health().await)),
        Operation::Rotate => Ok(Outcome::Sweep(service.rotate_oversized_logs().await)),
        Operation::Cleanup => Ok(Outcome::Sweep(service.cleanup_expired_logs().await)),
        Operation::Validate => Ok(Outcome::Sweep(service.validate_all_logs().await)),
        Operation::Optimize => Ok(Outcome::Sweep(service.optimize_storage().await)),
        Operation::FullMaintenance => Ok(Outcome::Run(service.run_scheduled_maintenance().await)),
        Operation::Report => service
            .generate_maintenance_report(cli.output_file.as_deref())
            .await
            .map(Outcome::Report),
        Operation::CharacterStats(character_id) => {
            store.statistics(character_id).await.map(Outcome::Stats)
        }
    };

    let (success, rendered) = match outcome {
        Ok(outcome) => {
            let success = outcome.success();
            let rendered = match cli.output {
                OutputFormat::Json => render_json(&Envelope {
                    operation: operation.as_str(),
                    success,
                    result: Some(outcome.payload()?),
                    error: None,
                })?,
                OutputFormat::Text => render_text(operation, &outcome),
            };
            (success, rendered)
        }
        Err(err) => {
            let message = format!("{err:#}");
            let rendered = match cli.output {
                OutputFormat::Json => render_json(&Envelope {
                    operation: operation.as_str(),
                    success: false,
                    result: None,
                    error: Some(message),
                })?,
                OutputFormat::Text => format!("{} failed: {message}", operation.as_str()),
            };
            (false, rendered)
        }
    };

    println!("{rendered}");
    if operation != Operation::Report {
        if let Some(path) = &cli.output_file {
            write_output(path, &rendered)?;
        }
    }
    Ok(success)
}

fn render_json(envelope: &Envelope<'_>) -> Result<String> {
    serde_json::to_string_pretty(envelope).context("failed to encode JSON output")
}

fn write_output(path: &Path, rendered: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{rendered}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
}

fn render_text(operation: Operation, outcome: &Outcome) -> String {
    let mut lines = Vec::new();
    match outcome {
        Outcome::Health(health) => health_lines(health, &mut lines),
        Outcome::Sweep(result) => sweep_lines(result, &mut lines),
        Outcome::Run(run) => {
            lines.push(format!(
                "maintenance: total={} successful={} failed={} warnings={}",
                run.summary.total, run.summary.successful, run.summary.failed, run.summary.warnings
            ));
            for result in &run.operations {
                sweep_lines(result, &mut lines);
            }
        }
        Outcome::Report(written) => {
            lines.push(format!("report written to {}", written.path.display()));
            lines.push(format!(
                "status={} files={} size={} characters={}",
                written.report.health.status.as_str(),
                written.report.files.total_files,
                written.report.files.total_size,
                written.report.characters.len()
            ));
        }
        Outcome::Stats(stats) => stats_lines(stats, &mut lines),
    }
    if lines.is_empty() {
        lines.push(format!("{}: nothing to report", operation.as_str()));
    }
    lines.join("\n")
}

fn health_lines(health: &StorageHealth, lines: &mut Vec<String>) {
    lines.push(format!(
        "storage health: {} ({})",
        health.status.as_str(),
        health.storage_dir.display()
    ));
    for check in &health.checks {
        lines.push(format!(
            "  {:<18} {:<8} {}",
            check.name,
            check.status.as_str(),
            check.message
        ));
    }
}

fn sweep_lines(result: &SweepResult, lines: &mut Vec<String>) {
    lines.push(format!(
        "{}: {} processed={}",
        result.operation,
        if result.success { "ok" } else { "failed" },
        result.processed
    ));
    for warning in &result.warnings {
        lines.push(format!("  warning: {warning}"));
    }
    for error in &result.errors {
        lines.push(format!("  error: {error}"));
    }
}

fn stats_lines(stats: &CharacterStatistics, lines: &mut Vec<String>) {
    let stamp = |value: Option<time::OffsetDateTime>| {
        value
            .and_then(|value| change_log_core::format_rfc3339(value).ok())
            .unwrap_or_else(|| "n/a".to_string())
    };
    lines.push(format!(
        "character={} entries={} files={} size={}",
        stats.character_id, stats.total_entries, stats.total_files, stats.total_size
    ));
    lines.push(format!("oldest={} newest={}", stamp(stats.oldest), stamp(stats.newest)));
    for (category, count) in &stats.category_counts {
        lines.push(format!("  {category:<14} {count}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("change-log-maint").chain(args.iter().copied()))
    }

    #[test]
    fn exactly_one_operation_is_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--rotate", "--cleanup"]).is_err());
        assert!(parse(&["--health-check", "--character-stats", "3"]).is_err());

        let cli = match parse(&["--character-stats", "42", "--output", "json"]) {
            Ok(cli) => cli,
            Err(err) => panic!("expected valid arguments: {err}"),
        };
        assert_eq!(cli.operation(), Operation::CharacterStats(CharacterId(42)));
        assert_eq!(cli.output, OutputFormat::Json);
    }

    #[test]
    fn storage_dir_flag_overrides_config() {
        let cli = match parse(&["--validate", "--storage-dir", "/tmp/elsewhere"]) {
            Ok(cli) => cli,
            Err(err) => panic!("expected valid arguments: {err}"),
        };
        let config = match cli.load_config() {
            Ok(config) => config,
            Err(err) => panic!("expected default config: {err:#}"),
        };
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.retention_days, 365);
    }

    #[test]
    fn text_rendering_lists_sweep_problems() {
        let result = SweepResult {
            operation: "validate_all_logs".to_string(),
            success: false,
            processed: 2,
            errors: vec!["a.json: corrupted".to_string()],
            warnings: vec!["b.json: repaired".to_string()],
            details: serde_json::Map::new(),
        };
        let text = render_text(Operation::Validate, &Outcome::Sweep(result));
        assert_eq!(
            text,
            "validate_all_logs: failed processed=2\n  warning: b.json: repaired\n  error: a.json: corrupted"
        );
    }
}
