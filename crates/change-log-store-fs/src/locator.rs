//! Maps character ids to log files on disk.
//!
//! Three naming schemes exist in the wild:
//! - `{sanitized_name}_{id}_changes.json` (current)
//! - `character_{id}_changes.json` (legacy, also matches the current pattern)
//! - `character_{id}.json` (legacy)
//!
//! Rotated snapshots live in `{sanitized_name}_{id}/rotated/`. Expired files
//! move under `archive/` at the same relative path, with a `__{stamp}` marker
//! when an earlier archive already holds that name. Everything that needs to
//! find, name or classify a log file goes through [`LogLocator`].

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use change_log_core::CharacterId;
use serde::Serialize;

use crate::atomic::TMP_EXTENSION;

pub const MAX_FILE_NAME_LEN: usize = 200;
pub const ARCHIVE_DIR: &str = "archive";
pub const ROTATED_DIR: &str = "rotated";
pub const REPORTS_DIR: &str = "maintenance_reports";
pub const HEALTH_JOURNAL_FILE: &str = "storage_health.json";
const CURRENT_SUFFIX: &str = "_changes.json";
const FALLBACK_NAME: &str = "character";
const ARCHIVE_SEPARATOR: &str = "__";
const MAX_ARCHIVE_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum LogFileKind {
    Current,
    Legacy,
    Rotated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub character_id: Option<CharacterId>,
    pub kind: LogFileKind,
    pub size: u64,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

/// Every known file for one character.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFileSet {
    /// Current-scheme files, most recently modified first.
    pub current: Vec<PathBuf>,
    pub legacy: Vec<PathBuf>,
    /// Rotated snapshots, sorted by file name (oldest first).
    pub rotated: Vec<PathBuf>,
}

impl LogFileSet {
    #[must_use]
    pub fn all(&self) -> Vec<PathBuf> {
        self.rotated
            .iter()
            .chain(self.legacy.iter())
            .chain(self.current.iter())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.legacy.is_empty() && self.rotated.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LogLocator {
    storage_dir: PathBuf,
}

impl LogLocator {
    #[must_use]
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.storage_dir.join(ARCHIVE_DIR)
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.storage_dir.join(REPORTS_DIR)
    }

    #[must_use]
    pub fn health_journal_path(&self) -> PathBuf {
        self.storage_dir.join(HEALTH_JOURNAL_FILE)
    }

    /// Preferred path of the live log file for a character.
    #[must_use]
    pub fn current_path(&self, character_id: CharacterId, character_name: &str) -> PathBuf {
        let suffix = format!("_{character_id}{CURRENT_SUFFIX}");
        let name = bounded_name(character_name, suffix.len());
        self.storage_dir.join(format!("{name}{suffix}"))
    }

    #[must_use]
    pub fn character_dir(&self, character_id: CharacterId, character_name: &str) -> PathBuf {
        let suffix = format!("_{character_id}");
        let name = bounded_name(character_name, suffix.len());
        self.storage_dir.join(format!("{name}{suffix}"))
    }

    #[must_use]
    pub fn rotated_dir(&self, character_id: CharacterId, character_name: &str) -> PathBuf {
        self.character_dir(character_id, character_name)
            .join(ROTATED_DIR)
    }

    /// Finds every file belonging to `character_id` across all naming
    /// schemes. A missing storage directory yields an empty set.
    pub async fn discover(&self, character_id: CharacterId) -> Result<LogFileSet> {
        let mut set = LogFileSet::default();
        let mut current = Vec::new();

        for path in list_dir(&self.storage_dir).await? {
            let Some(file_name) = file_name_of(&path) else {
                continue;
            };
            if path.is_dir() {
                if dir_character_id(&file_name) == Some(character_id) {
                    set.rotated.extend(self.rotated_in(&path).await?);
                }
                continue;
            }
            match classify_top_level(&file_name) {
                Some((LogFileKind::Current, id)) if id == character_id => {
                    let modified = modified_of(&path).await;
                    current.push((modified, path));
                }
                Some((LogFileKind::Legacy, id)) if id == character_id => set.legacy.push(path),
                _ => {}
            }
        }

        current.sort_by(|left, right| right.0.cmp(&left.0).then_with(|| left.1.cmp(&right.1)));
        set.current = current.into_iter().map(|(_, path)| path).collect();
        set.legacy.sort();
        set.rotated.sort();
        Ok(set)
    }

    async fn rotated_in(&self, character_dir: &Path) -> Result<Vec<PathBuf>> {
        let rotated = character_dir.join(ROTATED_DIR);
        Ok(list_dir(&rotated)
            .await?
            .into_iter()
            .filter(|path| is_json(path) && path.is_file())
            .collect())
    }

    /// Every change log file under the storage directory (current, legacy
    /// and rotated), excluding the archive tree, reports and temp files.
    pub async fn list_all(&self) -> Result<Vec<LogFileInfo>> {
        let mut files = Vec::new();

        for path in list_dir(&self.storage_dir).await? {
            let Some(file_name) = file_name_of(&path) else {
                continue;
            };
            if path.is_dir() {
                if file_name == ARCHIVE_DIR || file_name == REPORTS_DIR {
                    continue;
                }
                let character_id = dir_character_id(&file_name);
                for rotated in self.rotated_in(&path).await? {
                    files.push(describe(rotated, character_id, LogFileKind::Rotated).await);
                }
                continue;
            }
            if let Some((kind, id)) = classify_top_level(&file_name) {
                files.push(describe(path, Some(id), kind).await);
            }
        }

        files.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(files)
    }

    /// Path inside the archive tree mirroring `path`'s location under the
    /// storage directory.
    #[must_use]
    pub fn archive_path_for(&self, path: &Path) -> PathBuf {
        let relative = path
            .strip_prefix(&self.storage_dir)
            .map_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()), Path::to_path_buf);
        self.archive_dir().join(relative)
    }

    /// Archive destination for `path` that never replaces an earlier archive.
    /// When the mirrored path is taken, `__{stamp}` (plus a counter if
    /// needed) is inserted before the extension.
    pub async fn unique_archive_path_for(&self, path: &Path, stamp: &str) -> Result<PathBuf> {
        let target = self.archive_path_for(path);
        if !exists(&target).await {
            return Ok(target);
        }

        let stem = target
            .file_stem()
            .map_or_else(|| FALLBACK_NAME.into(), |stem| stem.to_string_lossy().into_owned());
        for attempt in 0..MAX_ARCHIVE_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{stem}{ARCHIVE_SEPARATOR}{stamp}.json")
            } else {
                format!("{stem}{ARCHIVE_SEPARATOR}{stamp}_{attempt}.json")
            };
            let candidate = target.with_file_name(file_name);
            if !exists(&candidate).await {
                return Ok(candidate);
            }
        }
        anyhow::bail!("no free archive name for {}", target.display())
    }

    /// Archived files belonging to `character_id`: former current and legacy
    /// files at the top of the archive tree, plus archived rotated snapshots.
    pub async fn discover_archived(&self, character_id: CharacterId) -> Result<LogFileSet> {
        let mut set = LogFileSet::default();
        for path in list_dir(&self.archive_dir()).await? {
            let Some(file_name) = file_name_of(&path) else {
                continue;
            };
            if path.is_dir() {
                if dir_character_id(&file_name) == Some(character_id) {
                    set.rotated.extend(self.rotated_in(&path).await?);
                }
                continue;
            }
            match classify_top_level(&archived_base_name(&file_name)) {
                Some((LogFileKind::Current, id)) if id == character_id => set.current.push(path),
                Some((LogFileKind::Legacy, id)) if id == character_id => set.legacy.push(path),
                _ => {}
            }
        }
        set.current.sort();
        set.legacy.sort();
        set.rotated.sort();
        Ok(set)
    }

    /// Character that owns `path`, if it is a recognised log file.
    #[must_use]
    pub fn owner_of(&self, path: &Path) -> Option<CharacterId> {
        let file_name = file_name_of(path)?;
        if let Some((_, id)) = classify_top_level(&file_name) {
            return Some(id);
        }
        let rotated_dir = path.parent()?;
        if file_name_of(rotated_dir)? != ROTATED_DIR {
            return None;
        }
        dir_character_id(&file_name_of(rotated_dir.parent()?)?)
    }
}

/// Lower-cases nothing; keeps ASCII letters, digits, `-` and `_`, collapses
/// everything else into single underscores.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            sanitized.push(ch);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitized name truncated so that `name + suffix` fits the file name limit.
/// The suffix (which carries the id) is never truncated.
fn bounded_name(name: &str, suffix_len: usize) -> String {
    let mut sanitized = sanitize_name(name);
    let budget = MAX_FILE_NAME_LEN.saturating_sub(suffix_len).max(1);
    if sanitized.len() > budget {
        sanitized.truncate(budget);
        let trimmed = sanitized.trim_end_matches('_').len();
        sanitized.truncate(trimmed.max(1));
    }
    sanitized
}

fn classify_top_level(file_name: &str) -> Option<(LogFileKind, CharacterId)> {
    if let Some(stem) = file_name.strip_suffix(CURRENT_SUFFIX) {
        let (_, id) = stem.rsplit_once('_')?;
        let id = parse_id(id)?;
        let kind = if stem == format!("{FALLBACK_NAME}_{id}") {
            LogFileKind::Legacy
        } else {
            LogFileKind::Current
        };
        return Some((kind, id));
    }
    let id = file_name
        .strip_prefix("character_")?
        .strip_suffix(".json")?;
    parse_id(id).map(|id| (LogFileKind::Legacy, id))
}

/// Strips the `__{stamp}` marker added by
/// [`LogLocator::unique_archive_path_for`]. Sanitized names never contain a
/// double underscore, so the first one starts the marker.
fn archived_base_name(file_name: &str) -> String {
    match file_name.split_once(ARCHIVE_SEPARATOR) {
        Some((base, _)) => format!("{base}.json"),
        None => file_name.to_string(),
    }
}

/// Rotation number encoded in a rotated snapshot name
/// (`changes_{stamp}_r{NNN}.json`), archived variants included.
#[must_use]
pub fn rotation_number(path: &Path) -> Option<u32> {
    let file_name = archived_base_name(&file_name_of(path)?);
    let stem = file_name.strip_suffix(".json")?;
    let (_, digits) = stem.rsplit_once("_r")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn dir_character_id(dir_name: &str) -> Option<CharacterId> {
    let (_, id) = dir_name.rsplit_once('_')?;
    parse_id(id)
}

fn parse_id(raw: &str) -> Option<CharacterId> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u64>().ok().map(CharacterId)
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "json")
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension == TMP_EXTENSION)
}

async fn modified_of(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|metadata| metadata.modified().ok())
}

async fn describe(path: PathBuf, character_id: Option<CharacterId>, kind: LogFileKind) -> LogFileInfo {
    let metadata = tokio::fs::metadata(&path).await.ok();
    LogFileInfo {
        size: metadata.as_ref().map_or(0, std::fs::Metadata::len),
        modified: metadata.and_then(|item| item.modified().ok()),
        path,
        character_id,
        kind,
    }
}

/// Entries of `dir`, or nothing when it does not exist.
pub(crate) async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read directory {}", dir.display()))
        }
    };

    let mut paths = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .with_context(|| format!("failed to read directory entry in {}", dir.display()))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}
