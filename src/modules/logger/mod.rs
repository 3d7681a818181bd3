use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::dir::DATA_DIR_MANAGER;
use crate::modules::settings::CONFIG;
use chrono::Local;
use std::process;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::layer::SubscriberExt;

pub static LOG_WORKER_GUARD: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// `process_name` selects the rolling log file ("daemon" or "mcp"). The
/// query server always logs to file: its stdout carries the tool protocol.
pub fn initialize_logging(process_name: &str, force_file: bool) {
    if SETTINGS.groundeffect_log_to_file || force_file {
        setup_file_logger(process_name).unwrap();
    } else {
        setup_stdout_logger().unwrap();
    }
}

fn configured_level() -> Level {
    let value = &CONFIG.general.log_level;
    match value.parse::<Level>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!(
                "Invalid log level specified. Use one of: error, warn, info, debug. \
                The log level you currently specified is 'general.log_level'='{}'",
                value
            );
            process::exit(2);
        }
    }
}

fn setup_file_logger(
    process_name: &str,
) -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
    let level = configured_level();
    let (nonb, guard) = log_writer(process_name);
    LOG_WORKER_GUARD.set(vec![guard]).unwrap();

    let layer = fmt::layer()
        .with_timer(LocalTimer)
        .with_ansi(SETTINGS.groundeffect_ansi_logs)
        .with_level(true)
        .with_writer(nonb)
        .with_target(true);

    let subscriber = tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(layer);

    tracing::subscriber::set_global_default(subscriber)
}

fn setup_stdout_logger() -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
    let level = configured_level();
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(true)
        .with_timer(LocalTimer);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(SETTINGS.groundeffect_ansi_logs)
        .with_writer(std::io::stdout)
        .event_format(format)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

fn log_writer(process_name: &str) -> (NonBlocking, WorkerGuard) {
    // Logging comes up before the data-dir manager runs its startup pass.
    let _ = std::fs::create_dir_all(&DATA_DIR_MANAGER.log_dir);
    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(process_name)
        .filename_suffix("log")
        .max_log_files(SETTINGS.groundeffect_max_log_files)
        .build(DATA_DIR_MANAGER.log_dir.clone())
        .expect("failed to initialize rolling file appender");
    let (nb, wg) = tracing_appender::non_blocking(rolling);
    (nb, wg)
}
