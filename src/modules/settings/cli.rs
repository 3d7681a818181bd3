// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use clap::Parser;
use std::sync::LazyLock;

#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::parse);

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::new_for_test);

/// Daemon runtime flags. Operator-facing behaviour (sync cadence, aliases,
/// per-account overrides) lives in `config.toml`; these flags only locate
/// the config/data roots and tune process-level knobs.
#[derive(Debug, Parser)]
#[clap(
    name = "groundeffect",
    about = "A local multi-account Gmail and Google Calendar mirror with hybrid keyword+semantic search.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// Configuration directory containing config.toml and tokens/
    #[clap(
        long,
        env,
        default_value = "~/.config/groundeffect",
        help = "Set the configuration directory"
    )]
    pub groundeffect_config_dir: String,

    /// Data directory root; overridden by general.data_dir in config.toml
    #[clap(
        long,
        env,
        default_value = "~/.local/share/groundeffect",
        help = "Set the data directory root"
    )]
    pub groundeffect_data_dir: String,

    /// Log to daily-rolling files under <data-dir>/logs instead of stdout
    #[clap(
        long,
        default_value = "true",
        env,
        help = "Enable log file output (otherwise logs go to stdout)"
    )]
    pub groundeffect_log_to_file: bool,

    /// Enable ANSI formatted logs
    #[clap(long, default_value = "false", env, help = "Enable ANSI formatted logs")]
    pub groundeffect_ansi_logs: bool,

    #[clap(
        long,
        default_value = "7",
        env,
        help = "Set the maximum number of rotated log files to keep"
    )]
    pub groundeffect_max_log_files: usize,

    /// Commit batching: publish after this many pending items
    #[clap(
        long,
        default_value = "100",
        env,
        help = "Maximum number of items batched into one store commit"
    )]
    pub groundeffect_commit_batch_size: usize,

    /// Commit batching: publish after this many seconds of wall-clock time
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Maximum seconds a pending store commit may wait"
    )]
    pub groundeffect_commit_batch_secs: u64,

    /// Global provider request budget, requests per second
    #[clap(
        long,
        default_value = "10",
        env,
        help = "Global provider request rate limit (requests per second)"
    )]
    pub groundeffect_global_rate_limit: u32,
}

impl Settings {
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self {
            groundeffect_config_dir: std::env::temp_dir()
                .join("groundeffect-test-config")
                .to_string_lossy()
                .into_owned(),
            groundeffect_data_dir: std::env::temp_dir()
                .join("groundeffect-test-data")
                .to_string_lossy()
                .into_owned(),
            groundeffect_log_to_file: false,
            groundeffect_ansi_logs: false,
            groundeffect_max_log_files: 2,
            groundeffect_commit_batch_size: 100,
            groundeffect_commit_batch_secs: 5,
            groundeffect_global_rate_limit: 10,
        }
    }
}
