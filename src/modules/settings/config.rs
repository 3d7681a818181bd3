// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Operator configuration, loaded from `<config-dir>/config.toml`.
///
/// Unknown keys are tolerated; out-of-range values are clamped or rejected
/// in [`Config::validate`] so a typo cannot wedge the daemon at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Runtime log verbosity: debug | info | warn | error
    pub log_level: String,
    /// Overrides the data root from the CLI/env settings
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub email_idle_enabled: bool,
    pub email_poll_interval_secs: u64,
    pub calendar_poll_interval_secs: u64,
    pub max_concurrent_fetches: usize,
    pub attachment_max_size_mb: u64,
    /// Historical floor for backfill, in years; 0 means the 90-day recent
    /// window only.
    pub backfill_years: u32,
    pub backfill_interval_secs: u64,
    pub body_truncation_chars: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            email_idle_enabled: true,
            email_poll_interval_secs: 300,
            calendar_poll_interval_secs: 300,
            max_concurrent_fetches: 8,
            attachment_max_size_mb: 25,
            backfill_years: 2,
            backfill_interval_secs: 300,
            body_truncation_chars: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Model identifier; the embedding dimension is fixed at 768 regardless.
    pub embedding_model: String,
    /// Hardware-acceleration hint forwarded to the embedding backend.
    pub use_metal: bool,
    /// Reserved: RRF is unweighted, these knobs are parsed and ignored.
    pub bm25_weight: f32,
    pub vector_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            embedding_model: "nomic-embed-text-v1.5".into(),
            use_metal: true,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// alias -> canonical address, consumed by the query planner.
    #[serde(default)]
    pub aliases: AHashMap<String, String>,
    /// Per-account overrides keyed by canonical address.
    #[serde(flatten)]
    pub overrides: AHashMap<String, AccountOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountOverrides {
    pub sync_enabled: bool,
    /// Folder allowlist; empty means all folders.
    pub folders: Vec<String>,
    pub sync_attachments: bool,
}

impl Default for AccountOverrides {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            folders: Vec::new(),
            sync_attachments: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> GroundEffectResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            raise_error!(
                format!("failed to read {}: {e}", path.display()),
                ErrorCode::MissingConfiguration
            )
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| {
            raise_error!(
                format!("failed to parse {}: {e}", path.display()),
                ErrorCode::MissingConfiguration
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GroundEffectResult<()> {
        for interval in [
            self.sync.email_poll_interval_secs,
            self.sync.calendar_poll_interval_secs,
        ] {
            if !(60..=3600).contains(&interval) {
                return Err(raise_error!(
                    format!("poll interval {interval}s outside the 60-3600s range"),
                    ErrorCode::InvalidParameter
                ));
            }
        }
        if !(1..=50).contains(&self.sync.max_concurrent_fetches) {
            return Err(raise_error!(
                format!(
                    "sync.max_concurrent_fetches = {} outside the 1-50 range",
                    self.sync.max_concurrent_fetches
                ),
                ErrorCode::InvalidParameter
            ));
        }
        if !matches!(
            self.general.log_level.as_str(),
            "debug" | "info" | "warn" | "error"
        ) {
            return Err(raise_error!(
                format!("unknown log level '{}'", self.general.log_level),
                ErrorCode::InvalidParameter
            ));
        }
        for (alias, target) in &self.accounts.aliases {
            crate::modules::utils::validate_email(target).map_err(|_| {
                raise_error!(
                    format!("alias '{alias}' maps to invalid address '{target}'"),
                    ErrorCode::InvalidParameter
                )
            })?;
        }
        Ok(())
    }

    /// Per-account overrides, falling back to defaults when the account has
    /// no `[accounts."<email>"]` block.
    pub fn overrides_for(&self, email: &str) -> AccountOverrides {
        self.accounts
            .overrides
            .get(email)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.accounts
            .aliases
            .get(name)
            .map(String::as_str)
            .or_else(|| {
                if self.accounts.aliases.values().any(|v| v == name) {
                    Some(name)
                } else {
                    None
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_operator_config() {
        let raw = r#"
            [general]
            log_level = "debug"

            [sync]
            email_poll_interval_secs = 120
            max_concurrent_fetches = 4

            [accounts.aliases]
            work = "me@work.test"

            [accounts."me@work.test"]
            sync_enabled = true
            folders = ["INBOX", "Sent"]
            sync_attachments = true
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sync.email_poll_interval_secs, 120);
        assert_eq!(
            config.accounts.aliases.get("work").map(String::as_str),
            Some("me@work.test")
        );
        let overrides = config.overrides_for("me@work.test");
        assert_eq!(overrides.folders, vec!["INBOX", "Sent"]);
        assert!(overrides.sync_attachments);
    }

    #[test]
    fn rejects_out_of_range_poll_interval() {
        let raw = r#"
            [sync]
            email_poll_interval_secs = 5
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
