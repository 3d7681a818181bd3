// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::LazyLock;

pub mod cli;
pub mod config;
pub mod dir;

use config::Config;

/// Operator configuration loaded once per process. A fatal parse or
/// validation error terminates the process with a non-zero exit code before
/// any state is written.
pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    let path = dir::expand_home(&cli::SETTINGS.groundeffect_config_dir).join("config.toml");
    match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {}", e.message());
            std::process::exit(2);
        }
    }
});
