// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use crate::modules::oauth2::CredentialVault;
use crate::modules::settings::config::Config;
use crate::modules::store::schema::{AccountRecord, AccountStatus};
use crate::modules::utils::validate_email;
use crate::utc_now;
use std::sync::Arc;
use tracing::info;

pub mod status;

/// Accounts exist exactly where the external OAuth flow left a token
/// bundle. Discovery reconciles the vault against the store at startup:
/// new grants become Active account rows, and config overrides (folder
/// allowlist, attachment flag, sync toggles) are applied on every pass so
/// editing config.toml takes effect on restart.
pub async fn discover_accounts(
    vault: &Arc<dyn CredentialVault>,
    config: &Config,
    existing: impl Fn(&str) -> Option<AccountRecord>,
) -> GroundEffectResult<Vec<AccountRecord>> {
    let mut records = Vec::new();
    for email in vault.list_accounts().await? {
        if validate_email(&email).is_err() {
            info!(account = %email, "skipping vault entry with invalid address");
            continue;
        }
        let overrides = config.overrides_for(&email);
        let alias = config
            .accounts
            .aliases
            .iter()
            .find(|(_, target)| **target == email)
            .map(|(alias, _)| alias.clone());
        let mut record = existing(&email).unwrap_or_else(|| AccountRecord {
            email: email.clone(),
            display_name: email.clone(),
            status: AccountStatus::Active,
            added_at: utc_now!(),
            ..Default::default()
        });
        record.alias = alias;
        record.email_sync_enabled = overrides.sync_enabled;
        record.calendar_sync_enabled = overrides.sync_enabled;
        record.folders = if overrides.folders.is_empty() {
            None
        } else {
            Some(overrides.folders.clone())
        };
        record.sync_attachments = overrides.sync_attachments;
        if !overrides.sync_enabled {
            record.status = AccountStatus::Disabled;
        } else if record.status == AccountStatus::Disabled {
            // Re-enabled by the operator.
            record.status = AccountStatus::Active;
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::oauth2::token::testing::MemoryVault;
    use crate::modules::oauth2::TokenBundle;

    fn vault_with(emails: &[&str]) -> Arc<dyn CredentialVault> {
        let vault = MemoryVault::default();
        for email in emails {
            vault.bundles.insert(
                email.to_string(),
                TokenBundle {
                    email: email.to_string(),
                    ..Default::default()
                },
            );
        }
        Arc::new(vault)
    }

    #[tokio::test]
    async fn grants_become_active_accounts() {
        let vault = vault_with(&["a@x.test", "b@y.test"]);
        let records = discover_accounts(&vault, &Config::default(), |_| None)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == AccountStatus::Active));
    }

    #[tokio::test]
    async fn overrides_and_aliases_are_applied() {
        let raw = r#"
            [accounts.aliases]
            work = "a@x.test"

            [accounts."a@x.test"]
            sync_enabled = false
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let vault = vault_with(&["a@x.test"]);
        let records = discover_accounts(&vault, &config, |_| None).await.unwrap();
        assert_eq!(records[0].alias.as_deref(), Some("work"));
        assert_eq!(records[0].status, AccountStatus::Disabled);
    }

    #[tokio::test]
    async fn existing_rows_keep_their_status() {
        let vault = vault_with(&["a@x.test"]);
        let records = discover_accounts(&vault, &Config::default(), |email| {
            Some(AccountRecord {
                email: email.to_string(),
                status: AccountStatus::NeedsReauth,
                added_at: 5,
                ..Default::default()
            })
        })
        .await
        .unwrap();
        assert_eq!(records[0].status, AccountStatus::NeedsReauth);
        assert_eq!(records[0].added_at, 5);
    }
}
