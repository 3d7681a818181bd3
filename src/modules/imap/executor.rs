// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::GroundEffectResult;
use crate::modules::imap::pool::ImapConnectionManager;
use crate::modules::imap::{FolderInfo, IdleOutcome, MailProvider, RawMessage};
use crate::{encode_mailbox_name, raise_error};
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use bb8::Pool;
use futures::{StreamExt, TryStreamExt};
use itertools::Itertools;
use std::time::Duration;
use tracing::debug;

/// Everything needed to rebuild a message locally, fetched in one
/// round-trip per UID group.
const FULL_MESSAGE_QUERY: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])";

const UID_FLAGS_QUERY: &str = "(UID FLAGS)";

/// Gmail mail provider over IMAP. Command traffic rides the account's
/// single pooled control channel; IDLE waits open their own connection so a
/// blocked listener never starves fetches.
pub struct GmailImap {
    pool: Pool<ImapConnectionManager>,
    manager: ImapConnectionManager,
}

impl GmailImap {
    pub fn new(pool: Pool<ImapConnectionManager>, manager: ImapConnectionManager) -> Self {
        Self { pool, manager }
    }

    fn flag_strings<'a>(flags: impl Iterator<Item = Flag<'a>>) -> Vec<String> {
        flags
            .map(|flag| match flag {
                Flag::Seen => "\\Seen".to_string(),
                Flag::Answered => "\\Answered".to_string(),
                Flag::Flagged => "\\Flagged".to_string(),
                Flag::Deleted => "\\Deleted".to_string(),
                Flag::Draft => "\\Draft".to_string(),
                Flag::Recent => "\\Recent".to_string(),
                Flag::MayCreate => "\\*".to_string(),
                Flag::Custom(name) => name.into_owned(),
            })
            .collect()
    }

    fn raw_from_fetch(fetch: &Fetch, uid_validity: u32) -> Option<RawMessage> {
        let uid = fetch.uid?;
        let body = fetch.body()?;
        Some(RawMessage {
            uid,
            uid_validity,
            flags: Self::flag_strings(fetch.flags()),
            internal_date: fetch
                .internal_date()
                .map(|d| d.timestamp_millis())
                .unwrap_or_default(),
            size: u64::from(fetch.size.unwrap_or(body.len() as u32)),
            rfc822: body.to_vec(),
        })
    }

    fn uid_set(uids: &[u32]) -> String {
        uids.iter().map(|uid| uid.to_string()).join(",")
    }
}

#[async_trait]
impl MailProvider for GmailImap {
    async fn list_folders(&self) -> GroundEffectResult<Vec<FolderInfo>> {
        let names: Vec<String> = {
            let mut session = self.pool.get().await?;
            let list = session
                .list(Some(""), Some("*"))
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
            let names = list
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
            names
                .iter()
                .filter(|name| !name.attributes().iter().any(|a| {
                    matches!(a, async_imap::types::NameAttribute::NoSelect)
                }))
                .map(|name| crate::decode_mailbox_name!(name.name()))
                .collect()
        };
        let mut folders = Vec::with_capacity(names.len());
        for name in names {
            folders.push(self.folder_status(&name).await?);
        }
        Ok(folders)
    }

    async fn folder_status(&self, folder: &str) -> GroundEffectResult<FolderInfo> {
        let mut session = self.pool.get().await?;
        let mailbox = session
            .examine(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        Ok(FolderInfo {
            name: folder.to_string(),
            uid_validity: mailbox.uid_validity.unwrap_or_default(),
            uid_next: mailbox.uid_next.unwrap_or_default(),
            exists: mailbox.exists,
        })
    }

    async fn uid_search_since(&self, folder: &str, date: &str) -> GroundEffectResult<Vec<u32>> {
        self.uid_search(folder, &format!("SINCE {date}")).await
    }

    async fn uid_search(&self, folder: &str, query: &str) -> GroundEffectResult<Vec<u32>> {
        let mut session = self.pool.get().await?;
        session
            .examine(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let uids = session
            .uid_search(query)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_messages(
        &self,
        folder: &str,
        uids: &[u32],
    ) -> GroundEffectResult<Vec<RawMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let mut session = self.pool.get().await?;
        let mailbox = session
            .examine(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let uid_validity = mailbox.uid_validity.unwrap_or_default();

        let mut stream = session
            .uid_fetch(Self::uid_set(uids), FULL_MESSAGE_QUERY)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;

        let mut messages = Vec::with_capacity(uids.len());
        while let Some(fetch) = stream.next().await {
            let fetch =
                fetch.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
            if let Some(raw) = Self::raw_from_fetch(&fetch, uid_validity) {
                messages.push(raw);
            } else {
                debug!(folder, "fetch item without uid/body skipped");
            }
        }
        Ok(messages)
    }

    async fn fetch_flags(&self, folder: &str) -> GroundEffectResult<Vec<(u32, Vec<String>)>> {
        let mut session = self.pool.get().await?;
        session
            .examine(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut stream = session
            .uid_fetch("1:*", UID_FLAGS_QUERY)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut flags = Vec::new();
        while let Some(fetch) = stream.next().await {
            let fetch =
                fetch.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
            if let Some(uid) = fetch.uid {
                flags.push((uid, Self::flag_strings(fetch.flags())));
            }
        }
        Ok(flags)
    }

    async fn idle(&self, folder: &str, timeout: Duration) -> GroundEffectResult<IdleOutcome> {
        // A dedicated session: idle() parks the connection until the server
        // speaks, which would wedge the shared control channel.
        let mut session = self.manager.build().await?;
        session
            .examine(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut idle = session.idle();
        idle.init()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::IdleDropped))?;
        let (wait, _interrupt) = idle.wait_with_timeout(timeout);
        let outcome = wait
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::IdleDropped))?;
        let mut session = idle
            .done()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::IdleDropped))?;
        let _ = session.logout().await;
        match outcome {
            IdleResponse::NewData(_) => Ok(IdleOutcome::Changed),
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => Ok(IdleOutcome::Timeout),
        }
    }

    async fn add_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()> {
        let mut session = self.pool.get().await?;
        session
            .select(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut stream = session
            .uid_store(uid.to_string(), format!("+FLAGS ({flags})"))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        while let Some(item) = stream.next().await {
            item.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        }
        Ok(())
    }

    async fn remove_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()> {
        let mut session = self.pool.get().await?;
        session
            .select(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let mut stream = session
            .uid_store(uid.to_string(), format!("-FLAGS ({flags})"))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        while let Some(item) = stream.next().await {
            item.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        }
        Ok(())
    }

    async fn copy_message(
        &self,
        folder: &str,
        uid: u32,
        destination: &str,
    ) -> GroundEffectResult<()> {
        let mut session = self.pool.get().await?;
        session
            .select(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        session
            .uid_copy(uid.to_string(), encode_mailbox_name!(destination))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        Ok(())
    }

    async fn move_message(
        &self,
        folder: &str,
        uid: u32,
        destination: &str,
    ) -> GroundEffectResult<()> {
        let mut session = self.pool.get().await?;
        session
            .select(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        session
            .uid_mv(uid.to_string(), encode_mailbox_name!(destination))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        Ok(())
    }

    async fn delete_message(&self, folder: &str, uid: u32) -> GroundEffectResult<()> {
        self.add_flags(folder, uid, "\\Deleted").await?;
        let mut session = self.pool.get().await?;
        session
            .select(encode_mailbox_name!(folder))
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        let stream = session
            .expunge()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            item.map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))?;
        }
        Ok(())
    }
}
