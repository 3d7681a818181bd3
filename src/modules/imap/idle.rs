// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::imap::{IdleOutcome, MailProvider};
use crate::modules::sync::hints::{SyncBus, SyncSignal};
use crate::modules::utils::backoff_secs;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Gmail drops IDLE channels around the half-hour mark; re-issue before
/// that so a silent folder stays subscribed.
const IDLE_WAIT: Duration = Duration::from_secs(23 * 60);

/// Long-running IDLE listener for one (account, folder). Publishes to the
/// sync bus; the orchestrator owns the reaction. Consecutive failures back
/// off exponentially and are reported so the orchestrator can degrade the
/// account to polling.
pub struct IdleListener {
    handle: JoinHandle<()>,
}

impl IdleListener {
    pub fn spawn(
        account: String,
        folder: String,
        provider: Arc<dyn MailProvider>,
        bus: Arc<SyncBus>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            info!(account = %account, folder = %folder, "IDLE listener started");
            let mut failures: u32 = 0;
            loop {
                let wait = provider.idle(&folder, IDLE_WAIT);
                let outcome = tokio::select! {
                    outcome = wait => outcome,
                    _ = shutdown.recv() => {
                        info!(account = %account, folder = %folder, "IDLE listener shutting down");
                        return;
                    }
                };
                match outcome {
                    Ok(IdleOutcome::Changed) => {
                        failures = 0;
                        debug!(account = %account, folder = %folder, "IDLE push received");
                        bus.publish(SyncSignal::IdleChanged {
                            account: account.clone(),
                            folder: folder.clone(),
                        });
                    }
                    Ok(IdleOutcome::Timeout) => {
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            account = %account,
                            folder = %folder,
                            failures,
                            "IDLE channel dropped: {}",
                            e.message()
                        );
                        bus.publish(SyncSignal::IdleDropped {
                            account: account.clone(),
                            folder: folder.clone(),
                        });
                        let delay = Duration::from_secs(backoff_secs(failures.saturating_sub(1)));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.recv() => return,
                        }
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for IdleListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
