use crate::constants::env::LOG_LEVEL;
use crate::errors::ConfigError;
use chrono::Local;
use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

static DEFAULT_LOG_LEVEL: Mutex<LogLevel> = Mutex::new(LogLevel::Info);

pub fn set_log_level(level: LogLevel) {
    let mut current = DEFAULT_LOG_LEVEL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *current = level;
}

pub fn set_log_level_from_env() {
    if let Some(level) = env::var(LOG_LEVEL).ok().as_deref().and_then(LogLevel::parse) {
        set_log_level(level);
    }
}

fn default_level() -> Level {
    DEFAULT_LOG_LEVEL
        .lock()
        .map(|level| (*level).into())
        .unwrap_or(Level::INFO)
}

/// `RUST_LOG` wins; otherwise the level set through [`set_log_level`].
fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level().to_string().to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub fn init_stderr_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .with_writer(std::io::stderr)
        .with_timer(LocalTimeFormatter)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .try_init();
}

/// Appends structured log lines to `log_path`, creating parent directories.
/// Meant for long-running embedders that own the runner for their lifetime.
pub fn init_file_logger(log_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = log_path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| ConfigError::PathIo {
            path: log_path.to_path_buf(),
            source: e,
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .with_writer(Mutex::new(log_file))
        .with_timer(LocalTimeFormatter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| ConfigError::General(format!("Failed to install logger: {}", e)))?;

    tracing::info!("--- Logger initialized ({}) ---", log_path.display());
    Ok(())
}

pub fn format_command_for_display(command: &Command) -> String {
    let program = command.get_program().to_string_lossy();
    let args = command
        .get_args()
        .map(|arg| {
            let s = arg.to_string_lossy();
            if s.is_empty() || s.contains(char::is_whitespace) || s.contains('\'') {
                format!("'{}'", s.replace('\'', "'\\''"))
            } else {
                s.to_string()
            }
        })
        .collect::<Vec<_>>();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

pub fn log_and_print_command(command: &Command) {
    tracing::debug!("[CMD] {}", format_command_for_display(command));
}
