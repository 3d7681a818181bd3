// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-account sync phase. Transitions are centralised here so the
/// orchestrator loop stays a plain match over an explicit enum.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Init,
    Priming,
    Live,
    Degraded,
    NeedsReauth,
    Disabled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhaseEvent {
    /// Tokens acquired and the folder/calendar list resolved.
    Prepared,
    /// The first priming batch reached the store.
    FirstBatchCommitted,
    /// Repeated IDLE drops or refresh hiccups.
    ChannelUnstable,
    /// A full poll cycle succeeded while degraded.
    ChannelRecovered,
    AuthFailed,
    Reauthorized,
    OperatorDisabled,
    OperatorEnabled,
}

impl SyncPhase {
    pub fn transition(self, event: PhaseEvent) -> SyncPhase {
        use PhaseEvent::*;
        use SyncPhase::*;
        match (self, event) {
            (_, OperatorDisabled) => Disabled,
            (Disabled, OperatorEnabled) => Init,
            (Disabled, _) => Disabled,
            (_, AuthFailed) => NeedsReauth,
            (NeedsReauth, Reauthorized) => Init,
            (NeedsReauth, _) => NeedsReauth,
            (Init, Prepared) => Priming,
            (Priming, FirstBatchCommitted) => Live,
            (Live, ChannelUnstable) => Degraded,
            (Degraded, ChannelRecovered) => Live,
            (current, _) => current,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, SyncPhase::Priming | SyncPhase::Live | SyncPhase::Degraded)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FolderCursor {
    pub uid_validity: u32,
    /// Highest UID ingested; incremental fetches start above it.
    pub last_seen_uid: u32,
    /// Lowest UID ingested; backfill continues below it.
    pub lowest_seen_uid: u32,
    pub backfill_done: bool,
}

/// Durable per-account cursor state at `cache/sync_state/<account>.json`.
/// Owned exclusively by the writer process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncStateFile {
    pub account: String,
    pub folders: AHashMap<String, FolderCursor>,
    /// CalDAV sync tokens keyed by calendar id.
    pub calendar_tokens: AHashMap<String, String>,
    /// Quarantined message UIDs per folder; never retried.
    pub poison_uids: AHashMap<String, AHashSet<u32>>,
    /// Per-folder flag fingerprints (uid -> hash of its flag set), the
    /// basis for detecting server-side flag changes and removals.
    #[serde(default)]
    pub flag_hashes: AHashMap<String, AHashMap<u32, u64>>,
    /// Quarantined event hrefs.
    pub poison_events: AHashSet<String>,
    pub retry_counters: AHashMap<String, u32>,
    pub last_email_sync: Option<i64>,
    pub last_calendar_sync: Option<i64>,
}

impl SyncStateFile {
    pub fn load(path: &Path, account: &str) -> GroundEffectResult<Self> {
        if !path.exists() {
            return Ok(Self {
                account: account.to_string(),
                ..Default::default()
            });
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        serde_json::from_str(&raw).map_err(|e| {
            raise_error!(
                format!("sync state {} undecodable: {e}", path.display()),
                ErrorCode::InternalError
            )
        })
    }

    pub fn save(&self, path: &Path) -> GroundEffectResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        }
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        crate::modules::store::manifest::write_atomically(path, &body)
    }

    pub fn cursor_mut(&mut self, folder: &str) -> &mut FolderCursor {
        self.folders.entry(folder.to_string()).or_default()
    }

    pub fn is_poisoned(&self, folder: &str, uid: u32) -> bool {
        self.poison_uids
            .get(folder)
            .is_some_and(|set| set.contains(&uid))
    }

    pub fn poison_uid(&mut self, folder: &str, uid: u32) {
        self.poison_uids
            .entry(folder.to_string())
            .or_default()
            .insert(uid);
    }

    /// Records an ingested UID range for a folder.
    pub fn observe_uids(&mut self, folder: &str, uid_validity: u32, uids: &[u32]) {
        let cursor = self.cursor_mut(folder);
        cursor.uid_validity = uid_validity;
        for uid in uids {
            if *uid > cursor.last_seen_uid {
                cursor.last_seen_uid = *uid;
            }
            if cursor.lowest_seen_uid == 0 || *uid < cursor.lowest_seen_uid {
                cursor.lowest_seen_uid = *uid;
            }
        }
    }

    /// A UID-validity rollover resets every cursor for the folder.
    pub fn reset_folder(&mut self, folder: &str, uid_validity: u32) {
        let cursor = self.cursor_mut(folder);
        *cursor = FolderCursor {
            uid_validity,
            ..Default::default()
        };
        self.poison_uids.remove(folder);
        self.flag_hashes.remove(folder);
    }
}
