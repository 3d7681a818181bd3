// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::imap::idle::IdleListener;
use crate::modules::oauth2::TokenRefresher;
use crate::modules::store::schema::AccountStatus;
use crate::modules::store::writer::WriteOp;
use crate::modules::sync::hints::{HintChannel, SyncSignal};
use crate::modules::sync::state::{PhaseEvent, SyncPhase};
use crate::modules::sync::task::{FetchQueue, FetchTask, FetchTaskKind, Priority, ScanMode};
use crate::modules::sync::AccountContext;
use crate::modules::utils::backoff_secs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive IDLE drops tolerated before the account degrades to
/// polling.
const IDLE_DROPS_BEFORE_DEGRADE: u32 = 3;

/// Cadence of re-auth probes while an account sits in NeedsReauth.
const REAUTH_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// One orchestrator per account: an explicit state machine driving the
/// fetch queue from its three inputs (wake signals, the IDLE event
/// stream, the mutation-hint bus). Failures on this account never touch
/// the others; every path out of the loop leaves the sync-state file
/// saved.
pub struct SyncOrchestrator {
    ctx: Arc<AccountContext>,
    queue: Arc<FetchQueue>,
    refresher: Arc<TokenRefresher>,
    idle_enabled: bool,
}

impl SyncOrchestrator {
    pub fn spawn(
        ctx: Arc<AccountContext>,
        queue: Arc<FetchQueue>,
        refresher: Arc<TokenRefresher>,
        idle_enabled: bool,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let orchestrator = Self {
            ctx,
            queue,
            refresher,
            idle_enabled,
        };
        tokio::spawn(async move {
            orchestrator.run(shutdown).await;
        })
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let email = self.ctx.email.clone();
        info!(account = %email, "sync orchestrator started");

        let mut phase = {
            let row = self.ctx.account_row.lock().await;
            if row.status == AccountStatus::Disabled
                || (!row.email_sync_enabled && !row.calendar_sync_enabled)
            {
                SyncPhase::Disabled
            } else {
                SyncPhase::Init
            }
        };

        let mut signals = self.ctx.bus.subscribe();
        let mut listeners: Vec<IdleListener> = Vec::new();
        let mut idle_drops: u32 = 0;
        let mut degraded_attempts: u32 = 0;
        let shutdown_for_listeners = self.ctx_shutdown();

        let mut email_poll = tokio::time::interval(Duration::from_secs(
            self.ctx.sync_config.email_poll_interval_secs,
        ));
        let mut backfill_tick = tokio::time::interval(Duration::from_secs(
            self.ctx.sync_config.backfill_interval_secs,
        ));
        let mut calendar_tick = tokio::time::interval(Duration::from_secs(
            self.ctx.sync_config.calendar_poll_interval_secs,
        ));
        // The immediate first tick of each interval is swallowed; priming
        // already covers that ground.
        email_poll.tick().await;
        backfill_tick.tick().await;
        calendar_tick.tick().await;

        loop {
            self.publish_phase(phase).await;
            match phase {
                SyncPhase::Init => {
                    match self.prepare().await {
                        Ok(()) => {
                            phase = phase.transition(PhaseEvent::Prepared);
                        }
                        Err(e) if e.code().is_auth() => {
                            warn!(account = %email, "auth failed during init: {}", e.message());
                            phase = phase.transition(PhaseEvent::AuthFailed);
                        }
                        Err(e) => {
                            error!(account = %email, "init failed, retrying: {}", e.message());
                            self.ctx.status.append_error(&email, e.message().to_string());
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(backoff_secs(degraded_attempts))) => {}
                                _ = shutdown.recv() => break,
                            }
                            degraded_attempts += 1;
                        }
                    }
                }
                SyncPhase::Priming => {
                    tokio::select! {
                        _ = self.ctx.wait_first_commit() => {
                            info!(account = %email, "first batch committed, account is live");
                            degraded_attempts = 0;
                            phase = phase.transition(PhaseEvent::FirstBatchCommitted);
                        }
                        signal = signals.recv() => {
                            if let Some(event) = self.handle_signal(signal, &mut idle_drops).await {
                                phase = phase.transition(event);
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                SyncPhase::Live => {
                    if self.idle_enabled && listeners.is_empty() {
                        listeners = self.spawn_listeners(&shutdown_for_listeners).await;
                    }
                    tokio::select! {
                        signal = signals.recv() => {
                            if let Some(event) = self.handle_signal(signal, &mut idle_drops).await {
                                listeners.clear();
                                phase = phase.transition(event);
                            }
                        }
                        _ = email_poll.tick(), if !self.idle_enabled => {
                            self.push_incremental_scans().await;
                        }
                        _ = backfill_tick.tick() => {
                            self.push_backfill_scans().await;
                        }
                        _ = calendar_tick.tick() => {
                            self.push_calendar_deltas().await;
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                SyncPhase::Degraded => {
                    listeners.clear();
                    let delay = Duration::from_secs(backoff_secs(degraded_attempts));
                    degraded_attempts += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.push_incremental_scans().await;
                            // A live control channel is the recovery probe.
                            match self.ctx.mail.folder_status("INBOX").await {
                                Ok(_) => {
                                    info!(account = %email, "channel recovered, leaving degraded mode");
                                    idle_drops = 0;
                                    degraded_attempts = 0;
                                    phase = phase.transition(PhaseEvent::ChannelRecovered);
                                }
                                Err(e) if e.code().is_auth() => {
                                    phase = phase.transition(PhaseEvent::AuthFailed);
                                }
                                Err(e) => {
                                    debug!(account = %email, "still degraded: {}", e.message());
                                }
                            }
                        }
                        signal = signals.recv() => {
                            if let Some(event) = self.handle_signal(signal, &mut idle_drops).await {
                                phase = phase.transition(event);
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                SyncPhase::NeedsReauth => {
                    listeners.clear();
                    self.queue.cancel_account(&email);
                    tokio::select! {
                        _ = tokio::time::sleep(REAUTH_PROBE_INTERVAL) => {
                            if self.refresher.current_tokens(&email).await.is_ok() {
                                info!(account = %email, "credentials replaced, resuming sync");
                                phase = phase.transition(PhaseEvent::Reauthorized);
                            }
                        }
                        signal = signals.recv() => {
                            // A manual wake forces an immediate probe.
                            if matches!(signal, Ok(ref s) if s.concerns(&email))
                                && self.refresher.current_tokens(&email).await.is_ok()
                            {
                                phase = phase.transition(PhaseEvent::Reauthorized);
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                SyncPhase::Disabled => {
                    listeners.clear();
                    self.queue.cancel_account(&email);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        // Parked until the daemon restarts with new config.
                        _ = std::future::pending::<()>() => unreachable!(),
                    }
                }
            }
        }

        listeners.clear();
        if let Err(e) = self.ctx.save_state().await {
            warn!(account = %email, "failed to save sync state on shutdown: {}", e.message());
        }
        info!(account = %email, "sync orchestrator stopped");
    }

    fn ctx_shutdown(&self) -> broadcast::Sender<()> {
        // Listener lifetimes are tied to the orchestrator, not the process:
        // dropping an IdleListener aborts it, so this channel only needs to
        // exist for the spawn signature.
        let (sender, _) = broadcast::channel(1);
        sender
    }

    async fn publish_phase(&self, phase: SyncPhase) {
        self.ctx.status.set_phase(&self.ctx.email, &format!("{phase:?}"));
        let status = match phase {
            SyncPhase::Init | SyncPhase::Priming => AccountStatus::Syncing,
            SyncPhase::Live | SyncPhase::Degraded => AccountStatus::Active,
            SyncPhase::NeedsReauth => AccountStatus::NeedsReauth,
            SyncPhase::Disabled => AccountStatus::Disabled,
        };
        let op = {
            let mut row = self.ctx.account_row.lock().await;
            if row.status == status {
                return;
            }
            row.status = status;
            WriteOp::UpsertAccount(row.clone())
        };
        if let Err(e) = self.ctx.commits.submit(vec![op]).await {
            warn!(account = %self.ctx.email, "failed to publish account status: {}", e.message());
        }
    }

    /// Init: verify credentials, then seed the priming work, the recent
    /// window per folder plus the primary calendar horizon.
    async fn prepare(&self) -> crate::modules::error::GroundEffectResult<()> {
        self.refresher.current_tokens(&self.ctx.email).await?;
        let row = self.ctx.account_row.lock().await.clone();
        if row.email_sync_enabled {
            self.queue.push(FetchTask::new(
                &self.ctx.email,
                FetchTaskKind::FolderList {
                    mode: ScanMode::RecentWindow,
                },
                Priority::Recent,
            ));
        }
        if row.calendar_sync_enabled {
            // Resolve the calendar list once at init; later polls reuse the
            // sync tokens recorded per calendar.
            self.ctx.limiter.acquire(&self.ctx.email, 1, None, None).await?;
            let calendars: Vec<String> = match self.ctx.calendar.list_calendars().await {
                Ok(list) if !list.is_empty() => list.into_iter().map(|c| c.id).collect(),
                Ok(_) => vec![self.ctx.email.clone()],
                Err(e) if e.code().is_auth() => return Err(e),
                Err(e) => {
                    warn!(account = %self.ctx.email, "calendar listing failed: {}", e.message());
                    vec![self.ctx.email.clone()]
                }
            };
            for calendar_id in calendars {
                self.queue.push(FetchTask::new(
                    &self.ctx.email,
                    FetchTaskKind::CalDavDelta { calendar_id },
                    Priority::Recent,
                ));
            }
        }
        if !row.email_sync_enabled {
            // Calendar-only accounts prime on their first calendar commit.
            debug!(account = %self.ctx.email, "email sync disabled, priming from calendar only");
        }
        Ok(())
    }

    /// Reacts to one bus signal; returns a phase event when the signal
    /// forces a transition.
    async fn handle_signal(
        &self,
        signal: Result<SyncSignal, broadcast::error::RecvError>,
        idle_drops: &mut u32,
    ) -> Option<PhaseEvent> {
        let signal = match signal {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(account = %self.ctx.email, missed, "signal bus lagged, forcing a full wake");
                self.push_incremental_scans().await;
                return None;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        if !signal.concerns(&self.ctx.email) {
            return None;
        }
        match signal {
            SyncSignal::IdleChanged { folder, .. } => {
                *idle_drops = 0;
                self.queue.push(FetchTask::new(
                    &self.ctx.email,
                    FetchTaskKind::MailScan {
                        folder,
                        mode: ScanMode::Incremental,
                    },
                    Priority::Incremental,
                ));
                None
            }
            SyncSignal::IdleDropped { .. } => {
                *idle_drops += 1;
                if *idle_drops >= IDLE_DROPS_BEFORE_DEGRADE {
                    warn!(
                        account = %self.ctx.email,
                        drops = *idle_drops,
                        "repeated IDLE drops, degrading to polling"
                    );
                    Some(PhaseEvent::ChannelUnstable)
                } else {
                    None
                }
            }
            SyncSignal::MutationHint { channel, .. } => {
                match channel {
                    HintChannel::Mail => self.push_mutation_scans().await,
                    HintChannel::Calendar => self.push_calendar_deltas().await,
                }
                None
            }
            SyncSignal::AuthFailed { .. } => Some(PhaseEvent::AuthFailed),
            SyncSignal::Wake { .. } => {
                self.push_incremental_scans().await;
                self.push_calendar_deltas().await;
                None
            }
        }
    }

    async fn known_folders(&self) -> Vec<String> {
        let state = self.ctx.state.lock().await;
        let mut folders: Vec<String> = state.folders.keys().cloned().collect();
        if folders.is_empty() {
            folders.push("INBOX".to_string());
        }
        folders.sort();
        folders
    }

    async fn push_incremental_scans(&self) {
        if !self.ctx.account_row.lock().await.email_sync_enabled {
            return;
        }
        for folder in self.known_folders().await {
            self.queue.push(FetchTask::new(
                &self.ctx.email,
                FetchTaskKind::MailScan {
                    folder,
                    mode: ScanMode::Incremental,
                },
                Priority::Incremental,
            ));
        }
    }

    async fn push_backfill_scans(&self) {
        if !self.ctx.account_row.lock().await.email_sync_enabled {
            return;
        }
        for folder in self.known_folders().await {
            self.queue.push(FetchTask::new(
                &self.ctx.email,
                FetchTaskKind::MailScan {
                    folder,
                    mode: ScanMode::Backfill,
                },
                Priority::Backfill,
            ));
        }
    }

    /// A sent message lands in the Sent folder; a mutation hint pulls it
    /// (and the inbox) without waiting for the next poll.
    async fn push_mutation_scans(&self) {
        let folders = self.known_folders().await;
        let mut targets: Vec<String> = folders
            .iter()
            .filter(|f| f.to_ascii_lowercase().contains("sent"))
            .cloned()
            .collect();
        if let Some(inbox) = folders.iter().find(|f| f.eq_ignore_ascii_case("INBOX")) {
            targets.push(inbox.clone());
        }
        if targets.is_empty() {
            targets = folders;
        }
        for folder in targets {
            self.queue.push(FetchTask::new(
                &self.ctx.email,
                FetchTaskKind::MailScan {
                    folder,
                    mode: ScanMode::Incremental,
                },
                Priority::Incremental,
            ));
        }
    }

    async fn push_calendar_deltas(&self) {
        if !self.ctx.account_row.lock().await.calendar_sync_enabled {
            return;
        }
        let mut calendars: Vec<String> = {
            let state = self.ctx.state.lock().await;
            state.calendar_tokens.keys().cloned().collect()
        };
        if calendars.is_empty() {
            // The primary calendar shares the account address.
            calendars.push(self.ctx.email.clone());
        }
        calendars.sort();
        for calendar_id in calendars {
            self.queue.push(FetchTask::new(
                &self.ctx.email,
                FetchTaskKind::CalDavDelta { calendar_id },
                Priority::Incremental,
            ));
        }
    }

    async fn spawn_listeners(&self, shutdown: &broadcast::Sender<()>) -> Vec<IdleListener> {
        let folders = self.known_folders().await;
        info!(
            account = %self.ctx.email,
            folders = folders.len(),
            "subscribing IDLE listeners"
        );
        folders
            .into_iter()
            .map(|folder| {
                IdleListener::spawn(
                    self.ctx.email.clone(),
                    folder,
                    self.ctx.mail.clone(),
                    self.ctx.bus.clone(),
                    shutdown.subscribe(),
                )
            })
            .collect()
    }
}
