// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::common::Initialize;
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::settings::cli::SETTINGS;
use crate::modules::settings::CONFIG;
use crate::raise_error;
use std::path::PathBuf;
use std::sync::LazyLock;

const STORE_DIR: &str = "store";
const ATTACHMENTS_DIR: &str = "attachments";
const MODELS_DIR: &str = "models";
const LOG_DIR: &str = "logs";
const SYNC_STATE_DIR: &str = "cache/sync_state";
const TOKENS_DIR: &str = "tokens";

pub static DATA_DIR_MANAGER: LazyLock<DataDirManager> = LazyLock::new(|| {
    let data_root = CONFIG
        .general
        .data_dir
        .clone()
        .unwrap_or_else(|| SETTINGS.groundeffect_data_dir.clone());
    DataDirManager::new(
        expand_home(&data_root),
        expand_home(&SETTINGS.groundeffect_config_dir),
    )
});

/// Owns the stable on-disk layout. Every path the daemon or query server
/// touches is minted here; nothing else joins path segments by hand.
#[derive(Debug)]
pub struct DataDirManager {
    pub data_root: PathBuf,
    pub config_root: PathBuf,
    pub store_dir: PathBuf,
    pub attachments_dir: PathBuf,
    pub models_dir: PathBuf,
    pub log_dir: PathBuf,
    pub sync_state_dir: PathBuf,
    pub tokens_dir: PathBuf,
}

impl Initialize for DataDirManager {
    async fn initialize() -> GroundEffectResult<()> {
        for dir in [
            &DATA_DIR_MANAGER.data_root,
            &DATA_DIR_MANAGER.store_dir,
            &DATA_DIR_MANAGER.attachments_dir,
            &DATA_DIR_MANAGER.models_dir,
            &DATA_DIR_MANAGER.log_dir,
            &DATA_DIR_MANAGER.sync_state_dir,
            &DATA_DIR_MANAGER.tokens_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        }
        Ok(())
    }
}

impl DataDirManager {
    pub fn new(data_root: PathBuf, config_root: PathBuf) -> Self {
        Self {
            store_dir: data_root.join(STORE_DIR),
            attachments_dir: data_root.join(ATTACHMENTS_DIR),
            models_dir: data_root.join(MODELS_DIR),
            log_dir: data_root.join(LOG_DIR),
            sync_state_dir: data_root.join(SYNC_STATE_DIR),
            tokens_dir: config_root.join(TOKENS_DIR),
            data_root,
            config_root,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_root.join("config.toml")
    }

    pub fn sync_state_path(&self, email: &str) -> PathBuf {
        self.sync_state_dir.join(format!("{email}.json"))
    }

    pub fn tokens_path(&self, email: &str) -> PathBuf {
        self.tokens_dir.join(format!("{email}.json"))
    }

    pub fn attachment_path(&self, email: &str, message_id: u64, filename: &str) -> PathBuf {
        attachment_path_under(&self.attachments_dir, email, message_id, filename)
    }

    pub fn model_path(&self, model_name: &str) -> PathBuf {
        self.models_dir.join(model_name)
    }
}

pub fn attachment_path_under(
    attachments_dir: &std::path::Path,
    email: &str,
    message_id: u64,
    filename: &str,
) -> PathBuf {
    attachments_dir
        .join(email)
        .join(message_id.to_string())
        .join(sanitize_filename(filename))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            _ => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "attachment".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_paths_are_contained() {
        let manager = DataDirManager::new(PathBuf::from("/tmp/ge-data"), PathBuf::from("/tmp/ge-cfg"));
        let path = manager.attachment_path("a@x.test", 42, "../../etc/passwd");
        assert!(path.starts_with("/tmp/ge-data/attachments/a@x.test/42"));
        assert!(!path.to_string_lossy().contains("../"));
    }

    #[test]
    fn sync_state_paths_are_per_account() {
        let manager = DataDirManager::new(PathBuf::from("/tmp/ge-data"), PathBuf::from("/tmp/ge-cfg"));
        assert_eq!(
            manager.sync_state_path("a@x.test"),
            PathBuf::from("/tmp/ge-data/cache/sync_state/a@x.test.json")
        );
    }
}
