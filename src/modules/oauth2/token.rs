// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use crate::utc_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Access tokens are refreshed this long before their recorded expiry.
pub const REFRESH_AHEAD_MS: i64 = 5 * 60 * 1000;

/// OAuth bundle as written by the external authorization flow. The client
/// id/secret ride along so the daemon can refresh without any other
/// credential source.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub expires_at: i64,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

impl TokenBundle {
    pub fn expires_soon(&self) -> bool {
        self.expires_at - utc_now!() < REFRESH_AHEAD_MS
    }
}

/// Credential vault boundary. Secrets never reach the store; tests
/// substitute an in-memory implementation.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn load_tokens(&self, email: &str) -> GroundEffectResult<Option<TokenBundle>>;
    async fn save_tokens(&self, email: &str, tokens: &TokenBundle) -> GroundEffectResult<()>;
    /// Accounts for which a bundle exists; the daemon syncs exactly these.
    async fn list_accounts(&self) -> GroundEffectResult<Vec<String>>;
}

/// File-backed vault at `<config-dir>/tokens/<email>.json`, mode 0600.
pub struct FileVault {
    tokens_dir: PathBuf,
}

impl FileVault {
    pub fn new(tokens_dir: PathBuf) -> Self {
        Self { tokens_dir }
    }

    fn path_for(&self, email: &str) -> PathBuf {
        self.tokens_dir.join(format!("{email}.json"))
    }
}

#[async_trait]
impl CredentialVault for FileVault {
    async fn load_tokens(&self, email: &str) -> GroundEffectResult<Option<TokenBundle>> {
        let path = self.path_for(email);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        let bundle: TokenBundle = serde_json::from_str(&raw).map_err(|e| {
            raise_error!(
                format!("token bundle {} undecodable: {e}", path.display()),
                ErrorCode::MissingConfiguration
            )
        })?;
        Ok(Some(bundle))
    }

    async fn save_tokens(&self, email: &str, tokens: &TokenBundle) -> GroundEffectResult<()> {
        tokio::fs::create_dir_all(&self.tokens_dir)
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        let path = self.path_for(email);
        let body = serde_json::to_vec_pretty(tokens)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)
                .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        }
        Ok(())
    }

    async fn list_accounts(&self) -> GroundEffectResult<Vec<String>> {
        if !self.tokens_dir.exists() {
            return Ok(Vec::new());
        }
        let mut accounts = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.tokens_dir)
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(email) = name.strip_suffix(".json") {
                accounts.push(email.to_string());
            }
        }
        accounts.sort();
        Ok(accounts)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use dashmap::DashMap;

    /// In-memory vault for tests.
    #[derive(Default)]
    pub struct MemoryVault {
        pub bundles: DashMap<String, TokenBundle>,
        /// When set, load_tokens reports the bundle missing, simulating a
        /// revoked grant.
        pub revoked: DashMap<String, ()>,
    }

    #[async_trait]
    impl CredentialVault for MemoryVault {
        async fn load_tokens(&self, email: &str) -> GroundEffectResult<Option<TokenBundle>> {
            if self.revoked.contains_key(email) {
                return Ok(None);
            }
            Ok(self.bundles.get(email).map(|b| b.clone()))
        }

        async fn save_tokens(&self, email: &str, tokens: &TokenBundle) -> GroundEffectResult<()> {
            self.bundles.insert(email.to_string(), tokens.clone());
            Ok(())
        }

        async fn list_accounts(&self) -> GroundEffectResult<Vec<String>> {
            let mut accounts: Vec<String> =
                self.bundles.iter().map(|e| e.key().clone()).collect();
            accounts.sort();
            Ok(accounts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(email: &str) -> TokenBundle {
        TokenBundle {
            email: email.into(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: utc_now!() + 3_600_000,
            client_id: "cid".into(),
            client_secret: "cs".into(),
            scopes: vec!["https://mail.google.com/".into()],
        }
    }

    #[tokio::test]
    async fn file_vault_round_trip() {
        let dir = TempDir::new().unwrap();
        let vault = FileVault::new(dir.path().join("tokens"));
        vault.save_tokens("a@x.test", &bundle("a@x.test")).await.unwrap();
        let loaded = vault.load_tokens("a@x.test").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(vault.list_accounts().await.unwrap(), vec!["a@x.test"]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("tokens/a@x.test.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn refresh_ahead_window() {
        let mut b = bundle("a@x.test");
        assert!(!b.expires_soon());
        b.expires_at = utc_now!() + 60_000;
        assert!(b.expires_soon());
    }
}
