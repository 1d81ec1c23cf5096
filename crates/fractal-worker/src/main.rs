use clap::Parser;
use fractal_core::logging::{
    init_file_logger, init_stderr_logger, set_log_level, set_log_level_from_env, LogLevel,
};
use fractal_executor::{run_worker, TaskRegistry};
use std::process::ExitCode;

mod cli;

/// Task failed; its error is in the response file.
const EXIT_TASK_FAILED: u8 = 1;
/// The request could not be run at all.
const EXIT_WORKER_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    set_log_level(LogLevel::from_verbosity(cli.verbose));
    if cli.verbose == 0 {
        set_log_level_from_env();
    }
    match &cli.log_file {
        Some(path) => {
            if let Err(e) = init_file_logger(path) {
                eprintln!("[ERROR] Failed to initialize file logger: {}", e);
                init_stderr_logger();
            }
        }
        None => init_stderr_logger(),
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_WORKER_ERROR);
        }
    };

    // Standalone workers only run command callables.
    let registry = TaskRegistry::new();
    match runtime.block_on(run_worker(&cli.input_file, &cli.output_file, &registry)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_TASK_FAILED),
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(EXIT_WORKER_ERROR)
        }
    }
}
