// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use crate::modules::sync::hints::SyncSignal;
use crate::modules::sync::ingest::{download_attachments, ingest_calendar_batch, ingest_mail_batch};
use crate::modules::sync::task::{FetchQueue, FetchTask, FetchTaskKind, Priority, ScanMode};
use crate::modules::sync::AccountContext;
use crate::modules::utils::backoff_secs;
use ahash::AHashSet;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// UIDs fetched per grouped round-trip; the practical stand-in for the
/// response byte cap.
const UID_GROUP_SIZE: usize = 50;

/// Messages pulled per backfill batch.
const BACKFILL_BATCH: usize = 50;

/// Events multiget per round-trip.
const EVENT_GROUP_SIZE: usize = 20;

const MAX_ATTEMPTS: u32 = 5;

/// Days of history the recent window covers.
pub const RECENT_WINDOW_DAYS: i64 = 90;

pub fn imap_date(days_back: i64) -> String {
    (Utc::now() - ChronoDuration::days(days_back))
        .format("%d-%b-%Y")
        .to_string()
}

/// The bounded fetch pool. Workers pull from the shared queue (strict
/// priority within an account, round-robin across accounts) and execute
/// against the owning account's context.
pub struct FetchWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl FetchWorkers {
    pub fn spawn(
        queue: Arc<FetchQueue>,
        contexts: Arc<DashMap<String, Arc<AccountContext>>>,
        count: usize,
        shutdown: tokio::sync::broadcast::Sender<()>,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = queue.clone();
            let contexts = contexts.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "fetch worker started");
                loop {
                    let task = tokio::select! {
                        task = queue.pop() => task,
                        _ = shutdown_rx.recv() => break,
                    };
                    let Some(ctx) = contexts.get(&task.account).map(|c| c.clone()) else {
                        debug!(account = %task.account, "dropping task for unknown account");
                        continue;
                    };
                    execute_with_retry(&ctx, &queue, task).await;
                }
                debug!(worker_id, "fetch worker stopped");
            }));
        }
        Self { handles }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn execute_with_retry(ctx: &Arc<AccountContext>, queue: &Arc<FetchQueue>, task: FetchTask) {
    if tokio::time::Instant::now() > task.deadline {
        debug!(account = %task.account, "task deadline passed, dropping; a later cycle re-plans it");
        return;
    }
    match execute(ctx, queue, &task).await {
        Ok(()) => {}
        Err(e) if e.code().is_auth() => {
            warn!(account = %task.account, "auth failure during fetch: {}", e.message());
            ctx.status.append_error(&task.account, e.message().to_string());
            queue.cancel_account(&task.account);
            ctx.bus.publish(SyncSignal::AuthFailed {
                account: task.account.clone(),
            });
        }
        Err(e) if e.code().is_transient() && task.attempt + 1 < MAX_ATTEMPTS => {
            let delay = Duration::from_secs(backoff_secs(task.attempt));
            debug!(
                account = %task.account,
                attempt = task.attempt,
                "transient fetch failure, requeueing in {delay:?}: {}",
                e.message()
            );
            let queue = queue.clone();
            let mut task = task;
            task.attempt += 1;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.push(task);
            });
        }
        Err(e) => {
            warn!(
                account = %task.account,
                "fetch task abandoned after {} attempts: {}",
                task.attempt + 1,
                e.message()
            );
            ctx.status.append_error(&task.account, e.message().to_string());
        }
    }
}

async fn execute(
    ctx: &Arc<AccountContext>,
    queue: &Arc<FetchQueue>,
    task: &FetchTask,
) -> GroundEffectResult<()> {
    match &task.kind {
        FetchTaskKind::FolderList { mode } => plan_folders(ctx, queue, mode, task.priority).await,
        FetchTaskKind::MailScan { folder, mode } => {
            scan_folder(ctx, queue, folder, mode, task.priority).await
        }
        FetchTaskKind::EnvelopeBatch { folder, uids } => {
            fetch_and_ingest(ctx, queue, folder, uids).await
        }
        FetchTaskKind::AttachmentFetch { folder, uid, .. } => {
            ctx.limiter
                .acquire(&ctx.email, 1, Some(task.deadline), None)
                .await?;
            download_attachments(ctx, folder, *uid).await?;
            Ok(())
        }
        FetchTaskKind::CalDavDelta { calendar_id } => {
            ctx.limiter
                .acquire(&ctx.email, 1, Some(task.deadline), None)
                .await?;
            run_calendar_delta(ctx, queue, calendar_id).await
        }
        FetchTaskKind::CalDavEvent { calendar_id, hrefs } => {
            ctx.limiter
                .acquire(&ctx.email, 1, Some(task.deadline), None)
                .await?;
            let objects = ctx.calendar.fetch_events(calendar_id, hrefs).await?;
            ingest_calendar_batch(ctx, calendar_id, objects, Vec::new(), None).await?;
            Ok(())
        }
    }
}

/// Resolves the folder list (honouring the allowlist), detects UID-validity
/// rollovers, and seeds one scan task per folder.
async fn plan_folders(
    ctx: &Arc<AccountContext>,
    queue: &Arc<FetchQueue>,
    mode: &ScanMode,
    priority: Priority,
) -> GroundEffectResult<()> {
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    ctx.status.mark_email_sync_start(&ctx.email);
    let folders = ctx.mail.list_folders().await?;
    let allowlist = ctx.account_row.lock().await.folders.clone();

    for folder in folders {
        if let Some(allowed) = &allowlist {
            if !allowed.iter().any(|f| f.eq_ignore_ascii_case(&folder.name)) {
                continue;
            }
        }
        let rollover = {
            let state = ctx.state.lock().await;
            state
                .folders
                .get(&folder.name)
                .map(|cursor| cursor.uid_validity != 0 && cursor.uid_validity != folder.uid_validity)
                .unwrap_or(false)
        };
        if rollover {
            info!(
                account = %ctx.email,
                folder = %folder.name,
                new_validity = folder.uid_validity,
                "UID-validity changed, re-mapping folder"
            );
            remap_folder(ctx, &folder.name, folder.uid_validity).await?;
            continue;
        }
        {
            // Register the folder even when it is empty so IDLE listeners
            // and mutation scans know about it.
            let mut state = ctx.state.lock().await;
            let cursor = state.cursor_mut(&folder.name);
            if cursor.uid_validity == 0 {
                cursor.uid_validity = folder.uid_validity;
            }
        }
        queue.push(FetchTask::new(
            &ctx.email,
            FetchTaskKind::MailScan {
                folder: folder.name.clone(),
                mode: mode.clone(),
            },
            priority,
        ));
    }
    ctx.save_state().await?;
    Ok(())
}

/// UID-validity rollover: re-fetch the live window under the new epoch,
/// then drop whatever still carries the old one. The invalidating commit
/// is issued only after every re-mapped batch has drained, preserving the
/// folder's ordering guarantee.
async fn remap_folder(
    ctx: &Arc<AccountContext>,
    folder: &str,
    new_validity: u32,
) -> GroundEffectResult<()> {
    {
        let mut state = ctx.state.lock().await;
        state.reset_folder(folder, new_validity);
    }
    let uids = recent_window_uids(ctx, folder).await?;
    for group in uids.chunks(UID_GROUP_SIZE) {
        ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
        let raws = ctx.mail.fetch_messages(folder, group).await?;
        ingest_mail_batch(ctx, folder, raws).await?;
    }
    ctx.commits
        .submit_and_wait(vec![crate::modules::store::writer::WriteOp::InvalidateFolderUids {
            account_id: ctx.email.clone(),
            folder: folder.to_string(),
            uid_validity: new_validity,
        }])
        .await?;
    ctx.save_state().await?;
    Ok(())
}

async fn recent_window_uids(
    ctx: &Arc<AccountContext>,
    folder: &str,
) -> GroundEffectResult<Vec<u32>> {
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    let since = ctx
        .mail
        .uid_search_since(folder, &imap_date(RECENT_WINDOW_DAYS))
        .await?;
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    let unseen = ctx.mail.uid_search(folder, "UNSEEN").await?;
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    let flagged = ctx.mail.uid_search(folder, "FLAGGED").await?;

    let mut merged: AHashSet<u32> = AHashSet::new();
    merged.extend(since);
    merged.extend(unseen);
    merged.extend(flagged);
    let poisoned = {
        let state = ctx.state.lock().await;
        state.poison_uids.get(folder).cloned().unwrap_or_default()
    };
    let mut uids: Vec<u32> = merged
        .into_iter()
        .filter(|uid| !poisoned.contains(uid))
        .collect();
    // Newest first so fresh mail is searchable soonest.
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

async fn scan_folder(
    ctx: &Arc<AccountContext>,
    queue: &Arc<FetchQueue>,
    folder: &str,
    mode: &ScanMode,
    priority: Priority,
) -> GroundEffectResult<()> {
    let uids = match mode {
        ScanMode::RecentWindow => {
            let uids = recent_window_uids(ctx, folder).await?;
            ctx.status.set_priming_progress(
                &ctx.email,
                folder,
                0,
                uids.len().div_ceil(UID_GROUP_SIZE) as u32,
            );
            uids
        }
        ScanMode::Incremental => {
            ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
            let status = ctx.mail.folder_status(folder).await?;
            let (last_seen, known_validity) = {
                let state = ctx.state.lock().await;
                let cursor = state.folders.get(folder).cloned().unwrap_or_default();
                (cursor.last_seen_uid, cursor.uid_validity)
            };
            if known_validity != 0 && known_validity != status.uid_validity {
                return remap_folder(ctx, folder, status.uid_validity).await;
            }
            ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
            let uids = ctx
                .mail
                .uid_search(folder, &format!("UID {}:*", last_seen + 1))
                .await?;
            let mut uids: Vec<u32> = uids.into_iter().filter(|uid| *uid > last_seen).collect();
            uids.sort_unstable_by(|a, b| b.cmp(a));
            uids.extend(resync_flags(ctx, folder).await?);
            uids.dedup();
            uids
        }
        ScanMode::Backfill => {
            let (lowest, done) = {
                let state = ctx.state.lock().await;
                let cursor = state.folders.get(folder).cloned().unwrap_or_default();
                (cursor.lowest_seen_uid, cursor.backfill_done)
            };
            if done || lowest <= 1 {
                return Ok(());
            }
            ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
            let floor_days = i64::from(ctx.sync_config.backfill_years) * 365;
            let query = format!(
                "UID 1:{} SINCE {}",
                lowest - 1,
                imap_date(floor_days.max(RECENT_WINDOW_DAYS))
            );
            let mut uids = ctx.mail.uid_search(folder, &query).await?;
            if uids.is_empty() {
                let mut state = ctx.state.lock().await;
                state.cursor_mut(folder).backfill_done = true;
                drop(state);
                ctx.save_state().await?;
                debug!(account = %ctx.email, folder, "backfill reached the historical floor");
                return Ok(());
            }
            // Reverse chronological: take the highest remaining UIDs.
            uids.sort_unstable_by(|a, b| b.cmp(a));
            uids.truncate(BACKFILL_BATCH);
            ctx.limiter.acquire_backfill(uids.len() as u32).await;
            uids
        }
    };

    for group in uids.chunks(UID_GROUP_SIZE) {
        queue.push(FetchTask::new(
            &ctx.email,
            FetchTaskKind::EnvelopeBatch {
                folder: folder.to_string(),
                uids: group.to_vec(),
            },
            priority,
        ));
    }
    Ok(())
}

/// Compares the folder's current (uid, flags) listing against the stored
/// fingerprints. Changed flag sets re-fetch the message so the row updates
/// in place; vanished UIDs are server-side removals and delete their rows
/// silently.
async fn resync_flags(
    ctx: &Arc<AccountContext>,
    folder: &str,
) -> GroundEffectResult<Vec<u32>> {
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    let listing = ctx.mail.fetch_flags(folder).await?;

    let mut current: ahash::AHashMap<u32, u64> =
        ahash::AHashMap::with_capacity(listing.len());
    for (uid, mut flags) in listing {
        flags.sort_unstable();
        current.insert(
            uid,
            crate::modules::message::stable_hash64(&flags.join("\x1f")),
        );
    }

    let (changed, removed) = {
        let mut state = ctx.state.lock().await;
        let known = state
            .flag_hashes
            .entry(folder.to_string())
            .or_default();
        let changed: Vec<u32> = current
            .iter()
            .filter(|(uid, hash)| known.get(uid).is_some_and(|k| k != *hash))
            .map(|(uid, _)| *uid)
            .collect();
        let removed: Vec<u32> = known
            .keys()
            .filter(|uid| !current.contains_key(uid))
            .copied()
            .collect();
        *known = current;
        (changed, removed)
    };
    ctx.save_state().await?;

    if !removed.is_empty() {
        debug!(
            account = %ctx.email,
            folder,
            count = removed.len(),
            "server removed messages, deleting rows"
        );
        let ops = removed
            .into_iter()
            .map(|uid| crate::modules::store::writer::WriteOp::DeleteMailByUid {
                account_id: ctx.email.clone(),
                folder: folder.to_string(),
                uid,
            })
            .collect();
        ctx.commits.submit_and_wait(ops).await?;
    }
    Ok(changed)
}

async fn fetch_and_ingest(
    ctx: &Arc<AccountContext>,
    queue: &Arc<FetchQueue>,
    folder: &str,
    uids: &[u32],
) -> GroundEffectResult<()> {
    ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
    let raws = ctx.mail.fetch_messages(folder, uids).await?;
    let ingested = ingest_mail_batch(ctx, folder, raws).await?;

    let sync_attachments = ctx.account_row.lock().await.sync_attachments;
    if sync_attachments {
        for item in ingested.iter().filter(|i| i.has_attachments) {
            queue.push(FetchTask::new(
                &ctx.email,
                FetchTaskKind::AttachmentFetch {
                    folder: folder.to_string(),
                    uid: item.uid,
                    gmail_message_id: item.gmail_message_id,
                },
                Priority::Attachment,
            ));
        }
    }
    Ok(())
}

/// Runs one sync-collection report. Changed hrefs fan out into multiget
/// tasks; removals and the advanced token commit together with the final
/// chunk so a crash between report and fetch never skips events.
async fn run_calendar_delta(
    ctx: &Arc<AccountContext>,
    queue: &Arc<FetchQueue>,
    calendar_id: &str,
) -> GroundEffectResult<()> {
    ctx.status.mark_calendar_sync_start(&ctx.email);
    let token = {
        let state = ctx.state.lock().await;
        state.calendar_tokens.get(calendar_id).cloned()
    };
    let delta = ctx.calendar.sync_delta(calendar_id, token.as_deref()).await?;

    let (changed, deleted): (Vec<_>, Vec<_>) =
        delta.items.into_iter().partition(|item| !item.is_deleted);
    let changed_hrefs: Vec<String> = changed.into_iter().map(|item| item.href).collect();
    let deleted_hrefs: Vec<String> = deleted.into_iter().map(|item| item.href).collect();

    if changed_hrefs.is_empty() {
        ingest_calendar_batch(ctx, calendar_id, Vec::new(), deleted_hrefs, delta.sync_token)
            .await?;
        return Ok(());
    }

    let mut chunks = changed_hrefs.chunks(EVENT_GROUP_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        if last {
            // Final chunk carries removals and the token, committed after
            // its events are ingested.
            ctx.limiter.acquire(&ctx.email, 1, None, None).await?;
            let objects = ctx.calendar.fetch_events(calendar_id, chunk).await?;
            ingest_calendar_batch(
                ctx,
                calendar_id,
                objects,
                deleted_hrefs.clone(),
                delta.sync_token.clone(),
            )
            .await?;
        } else {
            queue.push(FetchTask::new(
                &ctx.email,
                FetchTaskKind::CalDavEvent {
                    calendar_id: calendar_id.to_string(),
                    hrefs: chunk.to_vec(),
                },
                Priority::Incremental,
            ));
        }
    }
    Ok(())
}
