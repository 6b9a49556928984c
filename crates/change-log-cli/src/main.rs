use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = change_log_cli::Cli::parse();
    change_log_cli::init_logging(cli.verbose());
    match change_log_cli::run_cli(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
