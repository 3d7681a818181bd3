// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use crate::utc_now;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HintChannel {
    Mail,
    Calendar,
}

/// Signals the orchestrators react to, fanned out over one in-process
/// broadcast channel.
#[derive(Clone, Debug)]
pub enum SyncSignal {
    /// An IDLE listener saw the server push a change.
    IdleChanged { account: String, folder: String },
    /// An IDLE channel died; the orchestrator decides whether to degrade.
    IdleDropped { account: String, folder: String },
    /// A mutation went through; pull its result promptly.
    MutationHint {
        account: String,
        channel: HintChannel,
    },
    /// Token refresh failed terminally for this account.
    AuthFailed { account: String },
    /// Manual wake; None wakes every account.
    Wake { account: Option<String> },
}

impl SyncSignal {
    pub fn concerns(&self, email: &str) -> bool {
        match self {
            SyncSignal::IdleChanged { account, .. }
            | SyncSignal::IdleDropped { account, .. }
            | SyncSignal::MutationHint { account, .. }
            | SyncSignal::AuthFailed { account } => account == email,
            SyncSignal::Wake { account } => {
                account.as_deref().map(|a| a == email).unwrap_or(true)
            }
        }
    }
}

pub struct SyncBus {
    sender: broadcast::Sender<SyncSignal>,
}

impl SyncBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn publish(&self, signal: SyncSignal) {
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncSignal> {
        self.sender.subscribe()
    }
}

/// On-disk hint format bridging the two processes: the query server (which
/// owns no store write path and no bus) drops a file, the daemon sweeps the
/// directory and republishes on its bus.
#[derive(Debug, Serialize, Deserialize)]
pub struct HintFile {
    pub account: Option<String>,
    pub channel: Option<HintChannel>,
    pub created_at: i64,
}

pub const HINT_DIR: &str = "cache/hints";

pub fn drop_hint(
    data_root: &Path,
    account: Option<&str>,
    channel: Option<HintChannel>,
) -> GroundEffectResult<()> {
    let dir = data_root.join(HINT_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    let hint = HintFile {
        account: account.map(str::to_string),
        channel,
        created_at: utc_now!(),
    };
    let name = format!(
        "{}-{}.hint",
        hint.created_at,
        crate::modules::utils::generate_id()
    );
    let body = serde_json::to_vec(&hint)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    std::fs::write(dir.join(name), body)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    Ok(())
}

/// Consumes and removes every pending hint file, oldest first.
pub fn sweep_hints(data_root: &Path) -> GroundEffectResult<Vec<HintFile>> {
    let dir = data_root.join(HINT_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "hint"))
        .collect();
    paths.sort();
    let mut hints = Vec::with_capacity(paths.len());
    for path in paths {
        if let Ok(raw) = std::fs::read(&path) {
            if let Ok(hint) = serde_json::from_slice::<HintFile>(&raw) {
                hints.push(hint);
            } else {
                debug!(path = %path.display(), "discarding undecodable hint file");
            }
        }
        let _ = std::fs::remove_file(&path);
    }
    Ok(hints)
}

impl HintFile {
    pub fn into_signal(self) -> SyncSignal {
        match (self.account, self.channel) {
            (Some(account), Some(channel)) => SyncSignal::MutationHint { account, channel },
            (account, _) => SyncSignal::Wake { account },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hints_round_trip_through_the_filesystem() {
        let dir = TempDir::new().unwrap();
        drop_hint(dir.path(), Some("a@x.test"), Some(HintChannel::Mail)).unwrap();
        drop_hint(dir.path(), None, None).unwrap();

        let hints = sweep_hints(dir.path()).unwrap();
        assert_eq!(hints.len(), 2);
        // Swept files are gone.
        assert!(sweep_hints(dir.path()).unwrap().is_empty());

        let signals: Vec<SyncSignal> = hints.into_iter().map(HintFile::into_signal).collect();
        assert!(matches!(
            &signals[0],
            SyncSignal::MutationHint { account, channel: HintChannel::Mail } if account == "a@x.test"
        ));
        assert!(matches!(&signals[1], SyncSignal::Wake { account: None }));
    }

    #[test]
    fn signal_targeting() {
        let signal = SyncSignal::Wake { account: None };
        assert!(signal.concerns("anyone@x.test"));
        let signal = SyncSignal::AuthFailed {
            account: "a@x.test".into(),
        };
        assert!(signal.concerns("a@x.test"));
        assert!(!signal.concerns("b@y.test"));
    }
}
