// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::account::status::StatusBoard;
use crate::modules::caldav::CalendarProvider;
use crate::modules::embedder::Embedder;
use crate::modules::error::GroundEffectResult;
use crate::modules::imap::MailProvider;
use crate::modules::ratelimit::SyncRateLimiter;
use crate::modules::settings::config::SyncConfig;
use crate::modules::store::schema::AccountRecord;
use crate::modules::store::writer::CommitHandle;
use crate::modules::sync::hints::SyncBus;
use crate::modules::sync::state::SyncStateFile;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

pub mod hints;
pub mod ingest;
pub mod orchestrator;
pub mod state;
pub mod task;
pub mod workers;

#[cfg(test)]
mod tests;

/// Everything the workers and the orchestrator of one account share.
/// Constructed once per account at daemon startup; all fields are injected,
/// nothing reaches for ambient state.
pub struct AccountContext {
    pub email: String,
    pub mail: Arc<dyn MailProvider>,
    pub calendar: Arc<dyn CalendarProvider>,
    pub embedder: Arc<Embedder>,
    pub commits: CommitHandle,
    pub limiter: Arc<SyncRateLimiter>,
    pub bus: Arc<SyncBus>,
    pub status: Arc<StatusBoard>,
    pub sync_config: SyncConfig,
    pub state: Mutex<SyncStateFile>,
    pub state_path: PathBuf,
    pub account_row: Mutex<AccountRecord>,
    pub attachments_dir: PathBuf,
    first_commit: Notify,
    committed_once: AtomicBool,
}

impl AccountContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        email: String,
        mail: Arc<dyn MailProvider>,
        calendar: Arc<dyn CalendarProvider>,
        embedder: Arc<Embedder>,
        commits: CommitHandle,
        limiter: Arc<SyncRateLimiter>,
        bus: Arc<SyncBus>,
        status: Arc<StatusBoard>,
        sync_config: SyncConfig,
        state: SyncStateFile,
        state_path: PathBuf,
        account_row: AccountRecord,
        attachments_dir: PathBuf,
    ) -> Self {
        Self {
            email,
            mail,
            calendar,
            embedder,
            commits,
            limiter,
            bus,
            status,
            sync_config,
            state: Mutex::new(state),
            state_path,
            account_row: Mutex::new(account_row),
            attachments_dir,
            first_commit: Notify::new(),
            committed_once: AtomicBool::new(false),
        }
    }

    pub async fn save_state(&self) -> GroundEffectResult<()> {
        let state = self.state.lock().await;
        state.save(&self.state_path)
    }

    /// Signalled by the ingest pipeline when the account's first batch
    /// lands; the orchestrator leaves Priming on it.
    pub fn mark_committed(&self) {
        if !self.committed_once.swap(true, Ordering::SeqCst) {
            self.first_commit.notify_waiters();
        }
    }

    pub fn has_committed(&self) -> bool {
        self.committed_once.load(Ordering::SeqCst)
    }

    pub async fn wait_first_commit(&self) {
        if self.has_committed() {
            return;
        }
        self.first_commit.notified().await;
    }
}
