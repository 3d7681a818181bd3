// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod client;
pub mod executor;
pub mod idle;
pub mod oauth2;
pub mod pool;
pub mod session;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FolderInfo {
    pub name: String,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub exists: u32,
}

/// One message as fetched from the server: provider attributes plus the
/// raw RFC-5322 payload. Parsing happens in the ingest pipeline.
#[derive(Clone, Debug, Default)]
pub struct RawMessage {
    pub uid: u32,
    pub uid_validity: u32,
    pub flags: Vec<String>,
    /// Milliseconds since the Unix epoch; the server's INTERNALDATE.
    pub internal_date: i64,
    pub size: u64,
    pub rfc822: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdleOutcome {
    /// The server pushed a mailbox change.
    Changed,
    /// The wait elapsed without news; re-issue to keep the channel alive.
    Timeout,
}

/// Capability surface of the mail provider. The production implementation
/// drives Gmail over IMAP; tests substitute an in-memory fake.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_folders(&self) -> GroundEffectResult<Vec<FolderInfo>>;
    async fn folder_status(&self, folder: &str) -> GroundEffectResult<FolderInfo>;
    /// UIDs of messages received on or after `date` (IMAP `SINCE` form,
    /// e.g. "01-Jan-2025").
    async fn uid_search_since(&self, folder: &str, date: &str) -> GroundEffectResult<Vec<u32>>;
    /// UIDs matching a raw search query, e.g. "UNSEEN" or "FLAGGED".
    async fn uid_search(&self, folder: &str, query: &str) -> GroundEffectResult<Vec<u32>>;
    /// Fetches the given UIDs whole. Callers group UIDs under a byte cap;
    /// the adapter never splits further.
    async fn fetch_messages(
        &self,
        folder: &str,
        uids: &[u32],
    ) -> GroundEffectResult<Vec<RawMessage>>;
    /// Lightweight (uid, flags) resync of a whole folder.
    async fn fetch_flags(&self, folder: &str) -> GroundEffectResult<Vec<(u32, Vec<String>)>>;
    /// Blocks on an IDLE channel until the server reports a change or the
    /// timeout elapses. Uses a dedicated connection.
    async fn idle(&self, folder: &str, timeout: Duration) -> GroundEffectResult<IdleOutcome>;
    async fn add_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()>;
    async fn remove_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()>;
    async fn copy_message(&self, folder: &str, uid: u32, destination: &str)
        -> GroundEffectResult<()>;
    async fn move_message(&self, folder: &str, uid: u32, destination: &str)
        -> GroundEffectResult<()>;
    /// Flags \Deleted and expunges the single UID.
    async fn delete_message(&self, folder: &str, uid: u32) -> GroundEffectResult<()>;
}
