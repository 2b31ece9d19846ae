//! Main entry point for the filespacer CLI app

use filespacer::{cli, cli_runner};

fn main() -> std::process::ExitCode {
    let args = cli::parse();
    cli_runner::init_logging(&args.global);

    match cli_runner::run_cli_app(args) {
        Ok(true) => std::process::ExitCode::SUCCESS,
        Ok(false) => std::process::ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
