// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::account::status::StatusBoard;
use crate::modules::caldav::{
    CalendarDelta, CalendarInfo, CalendarObject, CalendarProvider, DeltaItem,
};
use crate::modules::embedder::testing::FakeBackend;
use crate::modules::embedder::Embedder;
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::imap::{FolderInfo, IdleOutcome, MailProvider, RawMessage};
use crate::modules::message::testing::raw_message;
use crate::modules::oauth2::token::testing::MemoryVault;
use crate::modules::oauth2::{TokenBundle, TokenRefresher};
use crate::modules::ratelimit::SyncRateLimiter;
use crate::modules::settings::config::SyncConfig;
use crate::modules::store::reader::StoreReader;
use crate::modules::store::schema::{AccountRecord, AccountStatus};
use crate::modules::store::writer::{spawn_commit_queue, StoreWriter};
use crate::modules::sync::hints::{HintChannel, SyncBus, SyncSignal};
use crate::modules::sync::orchestrator::SyncOrchestrator;
use crate::modules::sync::state::SyncStateFile;
use crate::modules::sync::task::FetchQueue;
use crate::modules::sync::workers::FetchWorkers;
use crate::modules::sync::AccountContext;
use crate::raise_error;
use crate::utc_now;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};

const DAY_MS: i64 = 86_400_000;

// ---------------------------------------------------------------- fakes

#[derive(Default)]
struct MockFolder {
    uid_validity: u32,
    messages: BTreeMap<u32, RawMessage>,
}

/// In-memory Gmail stand-in with just enough IMAP search grammar for the
/// scans the orchestrator issues.
#[derive(Default)]
struct MockImap {
    folders: Mutex<BTreeMap<String, MockFolder>>,
    idle_notify: Notify,
    fail_all: AtomicBool,
}

impl MockImap {
    fn put(&self, folder: &str, uid_validity: u32, raw: RawMessage) {
        let mut folders = self.folders.lock().unwrap();
        let entry = folders.entry(folder.to_string()).or_default();
        entry.uid_validity = uid_validity;
        entry.messages.insert(raw.uid, raw);
    }

    fn clear_folder(&self, folder: &str, uid_validity: u32) {
        let mut folders = self.folders.lock().unwrap();
        let entry = folders.entry(folder.to_string()).or_default();
        entry.uid_validity = uid_validity;
        entry.messages.clear();
    }

    fn push_idle(&self) {
        self.idle_notify.notify_one();
    }

    fn remove_message(&self, folder: &str, uid: u32) {
        let mut folders = self.folders.lock().unwrap();
        if let Some(state) = folders.get_mut(folder) {
            state.messages.remove(&uid);
        }
    }

    fn check_auth(&self) -> GroundEffectResult<()> {
        if self.fail_all.load(Ordering::Relaxed) {
            return Err(raise_error!(
                "XOAUTH2 rejected".into(),
                ErrorCode::ImapAuthenticationFailed
            ));
        }
        Ok(())
    }

    fn matching_uids(&self, folder: &str, query: &str) -> Vec<u32> {
        let folders = self.folders.lock().unwrap();
        let Some(state) = folders.get(folder) else {
            return Vec::new();
        };
        let mut unseen = false;
        let mut flagged = false;
        let mut since: Option<i64> = None;
        let mut range: Option<(u32, Option<u32>)> = None;

        let tokens: Vec<&str> = query.split_whitespace().collect();
        let mut index = 0;
        while index < tokens.len() {
            match tokens[index] {
                "UNSEEN" => unseen = true,
                "FLAGGED" => flagged = true,
                "SINCE" => {
                    index += 1;
                    let date =
                        chrono::NaiveDate::parse_from_str(tokens[index], "%d-%b-%Y").unwrap();
                    since = Some(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis());
                }
                "UID" => {
                    index += 1;
                    let (low, high) = tokens[index].split_once(':').unwrap();
                    let low: u32 = low.parse().unwrap();
                    let high: Option<u32> = (high != "*").then(|| high.parse().unwrap());
                    range = Some((low, high));
                }
                _ => {}
            }
            index += 1;
        }

        state
            .messages
            .values()
            .filter(|raw| {
                if let Some((low, high)) = range {
                    if raw.uid < low {
                        return false;
                    }
                    if let Some(high) = high {
                        if raw.uid > high {
                            return false;
                        }
                    }
                }
                if let Some(floor) = since {
                    if raw.internal_date < floor {
                        return false;
                    }
                }
                if unseen && raw.flags.iter().any(|f| f == "\\Seen") {
                    return false;
                }
                if flagged && !raw.flags.iter().any(|f| f == "\\Flagged") {
                    return false;
                }
                true
            })
            .map(|raw| raw.uid)
            .collect()
    }
}

#[async_trait]
impl MailProvider for MockImap {
    async fn list_folders(&self) -> GroundEffectResult<Vec<FolderInfo>> {
        self.check_auth()?;
        let folders = self.folders.lock().unwrap();
        Ok(folders
            .iter()
            .map(|(name, state)| FolderInfo {
                name: name.clone(),
                uid_validity: state.uid_validity,
                uid_next: state.messages.keys().max().copied().unwrap_or(0) + 1,
                exists: state.messages.len() as u32,
            })
            .collect())
    }

    async fn folder_status(&self, folder: &str) -> GroundEffectResult<FolderInfo> {
        self.check_auth()?;
        let folders = self.folders.lock().unwrap();
        let state = folders.get(folder).ok_or_else(|| {
            raise_error!(format!("no such folder {folder}"), ErrorCode::ImapCommandFailed)
        })?;
        Ok(FolderInfo {
            name: folder.to_string(),
            uid_validity: state.uid_validity,
            uid_next: state.messages.keys().max().copied().unwrap_or(0) + 1,
            exists: state.messages.len() as u32,
        })
    }

    async fn uid_search_since(&self, folder: &str, date: &str) -> GroundEffectResult<Vec<u32>> {
        self.uid_search(folder, &format!("SINCE {date}")).await
    }

    async fn uid_search(&self, folder: &str, query: &str) -> GroundEffectResult<Vec<u32>> {
        self.check_auth()?;
        Ok(self.matching_uids(folder, query))
    }

    async fn fetch_messages(
        &self,
        folder: &str,
        uids: &[u32],
    ) -> GroundEffectResult<Vec<RawMessage>> {
        self.check_auth()?;
        let folders = self.folders.lock().unwrap();
        let Some(state) = folders.get(folder) else {
            return Ok(Vec::new());
        };
        Ok(uids
            .iter()
            .filter_map(|uid| state.messages.get(uid).cloned())
            .map(|mut raw| {
                raw.uid_validity = state.uid_validity;
                raw
            })
            .collect())
    }

    async fn fetch_flags(&self, folder: &str) -> GroundEffectResult<Vec<(u32, Vec<String>)>> {
        self.check_auth()?;
        let folders = self.folders.lock().unwrap();
        Ok(folders
            .get(folder)
            .map(|state| {
                state
                    .messages
                    .values()
                    .map(|raw| (raw.uid, raw.flags.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn idle(&self, _folder: &str, timeout: Duration) -> GroundEffectResult<IdleOutcome> {
        self.check_auth()?;
        tokio::select! {
            _ = self.idle_notify.notified() => Ok(IdleOutcome::Changed),
            _ = tokio::time::sleep(timeout) => Ok(IdleOutcome::Timeout),
        }
    }

    async fn add_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()> {
        self.check_auth()?;
        let mut folders = self.folders.lock().unwrap();
        if let Some(raw) = folders
            .get_mut(folder)
            .and_then(|state| state.messages.get_mut(&uid))
        {
            raw.flags.push(flags.to_string());
        }
        Ok(())
    }

    async fn remove_flags(&self, folder: &str, uid: u32, flags: &str) -> GroundEffectResult<()> {
        self.check_auth()?;
        let mut folders = self.folders.lock().unwrap();
        if let Some(raw) = folders
            .get_mut(folder)
            .and_then(|state| state.messages.get_mut(&uid))
        {
            raw.flags.retain(|f| f != flags);
        }
        Ok(())
    }

    async fn copy_message(
        &self,
        folder: &str,
        uid: u32,
        destination: &str,
    ) -> GroundEffectResult<()> {
        self.check_auth()?;
        let mut folders = self.folders.lock().unwrap();
        let raw = folders
            .get(folder)
            .and_then(|state| state.messages.get(&uid).cloned());
        if let Some(raw) = raw {
            let dest = folders.entry(destination.to_string()).or_default();
            dest.messages.insert(raw.uid, raw);
        }
        Ok(())
    }

    async fn move_message(
        &self,
        folder: &str,
        uid: u32,
        destination: &str,
    ) -> GroundEffectResult<()> {
        self.copy_message(folder, uid, destination).await?;
        let mut folders = self.folders.lock().unwrap();
        if let Some(state) = folders.get_mut(folder) {
            state.messages.remove(&uid);
        }
        Ok(())
    }

    async fn delete_message(&self, folder: &str, uid: u32) -> GroundEffectResult<()> {
        self.check_auth()?;
        let mut folders = self.folders.lock().unwrap();
        if let Some(state) = folders.get_mut(folder) {
            state.messages.remove(&uid);
        }
        Ok(())
    }
}

/// Calendar stand-in: one change set handed out once per token advance.
#[derive(Default)]
pub struct MockCalDav {
    events: Mutex<Vec<CalendarObject>>,
    deleted: Mutex<Vec<String>>,
    token_seq: AtomicU32,
}

impl MockCalDav {
    fn seed_event(&self, href: &str, etag: &str, ical: String) {
        self.events.lock().unwrap().push(CalendarObject {
            href: href.to_string(),
            etag: etag.to_string(),
            ical,
        });
        self.token_seq.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl CalendarProvider for MockCalDav {
    async fn list_calendars(&self) -> GroundEffectResult<Vec<CalendarInfo>> {
        Ok(vec![CalendarInfo {
            id: "primary".into(),
            display_name: "Primary".into(),
        }])
    }

    async fn sync_delta(
        &self,
        _calendar_id: &str,
        sync_token: Option<&str>,
    ) -> GroundEffectResult<CalendarDelta> {
        let current = format!("tok-{}", self.token_seq.load(Ordering::Relaxed));
        if sync_token == Some(current.as_str()) {
            return Ok(CalendarDelta {
                sync_token: Some(current),
                items: Vec::new(),
            });
        }
        let mut items: Vec<DeltaItem> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|object| DeltaItem {
                href: object.href.clone(),
                etag: Some(object.etag.clone()),
                is_deleted: false,
            })
            .collect();
        items.extend(self.deleted.lock().unwrap().iter().map(|href| DeltaItem {
            href: href.clone(),
            etag: None,
            is_deleted: true,
        }));
        Ok(CalendarDelta {
            sync_token: Some(current),
            items,
        })
    }

    async fn fetch_events(
        &self,
        _calendar_id: &str,
        hrefs: &[String],
    ) -> GroundEffectResult<Vec<CalendarObject>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|object| hrefs.contains(&object.href))
            .cloned()
            .collect())
    }

    async fn put_event(
        &self,
        _calendar_id: &str,
        event_id: &str,
        ical: &str,
        _if_match: Option<&str>,
    ) -> GroundEffectResult<String> {
        let etag = format!("etag-{event_id}");
        self.seed_event(&format!("/events/{event_id}.ics"), &etag, ical.to_string());
        Ok(etag)
    }

    async fn delete_event(
        &self,
        _calendar_id: &str,
        event_id: &str,
        _if_match: Option<&str>,
    ) -> GroundEffectResult<()> {
        let href = format!("/events/{event_id}.ics");
        self.events.lock().unwrap().retain(|o| o.href != href);
        self.deleted.lock().unwrap().push(href);
        self.token_seq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ------------------------------------------------------------- harness

struct Harness {
    _dir: TempDir,
    store_dir: std::path::PathBuf,
    contexts: Arc<DashMap<String, Arc<AccountContext>>>,
    queue: Arc<FetchQueue>,
    bus: Arc<SyncBus>,
    vault: Arc<MemoryVault>,
    refresher: Arc<TokenRefresher>,
    shutdown: broadcast::Sender<()>,
    commits: crate::modules::store::writer::CommitHandle,
    _workers: FetchWorkers,
}

fn fresh_bundle(email: &str) -> TokenBundle {
    TokenBundle {
        email: email.to_string(),
        access_token: "at".into(),
        refresh_token: Some("rt".into()),
        expires_at: utc_now!() + 86_400_000,
        client_id: "cid".into(),
        client_secret: "cs".into(),
        scopes: Vec::new(),
    }
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        let writer = StoreWriter::open(store_dir.clone()).unwrap();
        let (shutdown, _) = broadcast::channel(8);
        let (commits, _queue_task) = spawn_commit_queue(
            writer,
            100,
            Duration::from_millis(50),
            shutdown.subscribe(),
        );

        let vault = Arc::new(MemoryVault::default());
        let refresher = Arc::new(TokenRefresher::new(
            vault.clone() as Arc<dyn crate::modules::oauth2::CredentialVault>
        ));
        let contexts = Arc::new(DashMap::new());
        let queue = Arc::new(FetchQueue::new());
        let bus = Arc::new(SyncBus::new());
        let workers = FetchWorkers::spawn(queue.clone(), contexts.clone(), 3, shutdown.clone());

        Self {
            _dir: dir,
            store_dir,
            contexts,
            queue,
            bus,
            vault,
            refresher,
            shutdown,
            commits,
            _workers: workers,
        }
    }

    async fn add_account(
        &self,
        email: &str,
        mail: Arc<MockImap>,
        calendar: Arc<MockCalDav>,
    ) -> Arc<AccountContext> {
        self.vault
            .bundles
            .insert(email.to_string(), fresh_bundle(email));
        let row = AccountRecord {
            email: email.to_string(),
            display_name: email.to_string(),
            status: AccountStatus::Active,
            added_at: utc_now!(),
            email_sync_enabled: true,
            calendar_sync_enabled: true,
            ..Default::default()
        };
        self.commits
            .clone()
            .submit_and_wait(vec![crate::modules::store::writer::WriteOp::UpsertAccount(
                row.clone(),
            )])
            .await
            .unwrap();

        let ctx = Arc::new(AccountContext::new(
            email.to_string(),
            mail,
            calendar,
            Arc::new(Embedder::new(Arc::new(FakeBackend::new()))),
            self.commits.clone(),
            Arc::new(SyncRateLimiter::new(1000)),
            self.bus.clone(),
            Arc::new(StatusBoard::new()),
            SyncConfig::default(),
            SyncStateFile {
                account: email.to_string(),
                ..Default::default()
            },
            self._dir.path().join(format!("state/{email}.json")),
            row,
            self._dir.path().join("attachments"),
        ));
        self.contexts.insert(email.to_string(), ctx.clone());
        SyncOrchestrator::spawn(
            ctx.clone(),
            self.queue.clone(),
            self.refresher.clone(),
            true,
            self.shutdown.subscribe(),
        );
        ctx
    }

    fn reader(&self) -> StoreReader {
        StoreReader::open(self.store_dir.clone()).unwrap()
    }

    async fn wait_for<F>(&self, what: &str, timeout: Duration, mut check: F)
    where
        F: FnMut(&crate::modules::store::reader::Snapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reader = self.reader();
            if check(&reader.snapshot()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn seed_cold_start_fixture(mock: &MockImap) {
    let now = utc_now!();
    let mut uid = 1;
    // 25 inside the 90-day window.
    for i in 0..25 {
        let mut raw = raw_message(
            uid,
            1,
            &format!("recent-{i}@x.test"),
            &format!("recent {i}"),
            "recent body",
            now - (i as i64 % 80) * DAY_MS,
        );
        raw.flags = vec!["\\Seen".into()];
        mock.put("INBOX", 1, raw);
        uid += 1;
    }
    // 25 outside the window, 10 of them unread.
    for i in 0..25 {
        let mut raw = raw_message(
            uid,
            1,
            &format!("old-{i}@x.test"),
            &format!("old {i}"),
            "old body",
            now - (100 + i as i64) * DAY_MS,
        );
        if i >= 10 {
            raw.flags = vec!["\\Seen".into()];
        }
        mock.put("INBOX", 1, raw);
        uid += 1;
    }
}

// --------------------------------------------------------------- tests

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_start_primes_the_recent_window() {
    let harness = Harness::new().await;
    let mock = Arc::new(MockImap::default());
    seed_cold_start_fixture(&mock);
    harness
        .add_account("a@x.test", mock.clone(), Arc::new(MockCalDav::default()))
        .await;

    harness
        .wait_for("35 primed items", Duration::from_secs(15), |snapshot| {
            snapshot.mail_count() == 35
        })
        .await;

    let reader = harness.reader();
    let snapshot = reader.snapshot();
    assert_eq!(snapshot.mail_count(), 35);
    for id in snapshot.filter_scan(
        crate::modules::store::reader::Table::Mail,
        &Default::default(),
        100,
    ) {
        let record = snapshot.mail(id).unwrap();
        assert_eq!(record.embedding.len(), 768);
        assert!(record.embedding.iter().any(|v| *v != 0.0));
    }
    // Priming flipped the account to Active.
    harness
        .wait_for("active status", Duration::from_secs(5), |snapshot| {
            snapshot
                .account("a@x.test")
                .is_some_and(|a| a.status == AccountStatus::Active)
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_push_lands_within_five_seconds() {
    let harness = Harness::new().await;
    let mock = Arc::new(MockImap::default());
    let now = utc_now!();
    mock.put(
        "INBOX",
        1,
        raw_message(1, 1, "seed@x.test", "seed", "seed body", now - DAY_MS),
    );
    harness
        .add_account("a@x.test", mock.clone(), Arc::new(MockCalDav::default()))
        .await;
    harness
        .wait_for("priming", Duration::from_secs(10), |s| s.mail_count() == 1)
        .await;

    let sync_before = harness
        .reader()
        .snapshot()
        .account("a@x.test")
        .unwrap()
        .last_email_sync;

    // Give the IDLE listener a beat to subscribe, then push.
    tokio::time::sleep(Duration::from_millis(200)).await;
    mock.put(
        "INBOX",
        1,
        raw_message(2, 1, "pushed@x.test", "pushed", "pushed body", now),
    );
    mock.push_idle();

    harness
        .wait_for("idle increment", Duration::from_secs(5), |s| {
            s.mail_count() == 2
        })
        .await;
    let sync_after = harness
        .reader()
        .snapshot()
        .account("a@x.test")
        .unwrap()
        .last_email_sync;
    assert!(sync_after >= sync_before);
    assert!(sync_after.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auth_failure_in_one_account_does_not_block_another() {
    let harness = Harness::new().await;

    let mock_a = Arc::new(MockImap::default());
    let now = utc_now!();
    mock_a.put(
        "INBOX",
        1,
        raw_message(1, 1, "a1@x.test", "a mail", "body", now - DAY_MS),
    );
    let mock_b = Arc::new(MockImap::default());
    mock_b.put(
        "INBOX",
        1,
        raw_message(1, 1, "b1@y.test", "b mail", "body", now - DAY_MS),
    );

    harness
        .add_account("a@x.test", mock_a.clone(), Arc::new(MockCalDav::default()))
        .await;
    harness
        .add_account("b@y.test", mock_b.clone(), Arc::new(MockCalDav::default()))
        .await;

    harness
        .wait_for("both primed", Duration::from_secs(15), |s| {
            s.mail_count() == 2
        })
        .await;

    // Revoke a's grant and break its connection.
    harness.vault.revoked.insert("a@x.test".to_string(), ());
    mock_a.fail_all.store(true, Ordering::Relaxed);
    harness.bus.publish(SyncSignal::AuthFailed {
        account: "a@x.test".into(),
    });

    harness
        .wait_for("a needs reauth", Duration::from_secs(10), |s| {
            s.account("a@x.test")
                .is_some_and(|a| a.status == AccountStatus::NeedsReauth)
        })
        .await;

    // b keeps advancing.
    let b_sync_before = harness
        .reader()
        .snapshot()
        .account("b@y.test")
        .unwrap()
        .last_email_sync
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    mock_b.put(
        "INBOX",
        1,
        raw_message(2, 1, "b2@y.test", "b mail 2", "body", utc_now!()),
    );
    harness.bus.publish(SyncSignal::Wake {
        account: Some("b@y.test".into()),
    });
    harness
        .wait_for("b advanced", Duration::from_secs(10), |s| {
            s.account("b@y.test")
                .and_then(|a| a.last_email_sync)
                .is_some_and(|t| t > b_sync_before)
                && s.mail_count() == 3
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uid_validity_rollover_remaps_the_folder() {
    let harness = Harness::new().await;
    let mock = Arc::new(MockImap::default());
    let now = utc_now!();
    mock.put(
        "INBOX",
        1,
        raw_message(10, 1, "stable@x.test", "stable", "body", now - DAY_MS),
    );
    harness
        .add_account("a@x.test", mock.clone(), Arc::new(MockCalDav::default()))
        .await;
    harness
        .wait_for("primed", Duration::from_secs(10), |s| s.mail_count() == 1)
        .await;

    // Server re-issues the folder under a new epoch with new UIDs.
    mock.clear_folder("INBOX", 2);
    mock.put(
        "INBOX",
        2,
        raw_message(99, 2, "stable@x.test", "stable", "body", now - DAY_MS),
    );
    harness.bus.publish(SyncSignal::Wake {
        account: Some("a@x.test".into()),
    });

    harness
        .wait_for("remap", Duration::from_secs(10), |s| {
            s.mail_by_provider_id(
                "a@x.test",
                crate::modules::message::stable_hash64("stable@x.test"),
            )
            .is_some_and(|r| r.uid == 99 && r.uid_validity == 2)
        })
        .await;
    // No stale rows under the old epoch, and identity is preserved.
    let reader = harness.reader();
    let snapshot = reader.snapshot();
    assert_eq!(snapshot.mail_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutation_hint_pulls_the_sent_copy() {
    let harness = Harness::new().await;
    let mock = Arc::new(MockImap::default());
    let now = utc_now!();
    mock.put(
        "INBOX",
        1,
        raw_message(1, 1, "seed@x.test", "seed", "body", now - DAY_MS),
    );
    mock.clear_folder("Sent", 5);
    harness
        .add_account("a@x.test", mock.clone(), Arc::new(MockCalDav::default()))
        .await;
    harness
        .wait_for("primed", Duration::from_secs(10), |s| s.mail_count() == 1)
        .await;

    // The provider observed a submit; the router dropped a hint.
    mock.put(
        "Sent",
        5,
        raw_message(1, 5, "sent-1@x.test", "Hi", "sent body", now),
    );
    harness.bus.publish(SyncSignal::MutationHint {
        account: "a@x.test".into(),
        channel: HintChannel::Mail,
    });

    harness
        .wait_for("sent copy", Duration::from_secs(10), |s| {
            s.mail_by_provider_id(
                "a@x.test",
                crate::modules::message::stable_hash64("sent-1@x.test"),
            )
            .is_some_and(|r| {
                r.folder == "Sent" && r.embedding.iter().any(|v| *v != 0.0)
            })
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_flag_changes_and_removals_are_observed() {
    let harness = Harness::new().await;
    let mock = Arc::new(MockImap::default());
    let now = utc_now!();
    mock.put(
        "INBOX",
        1,
        raw_message(1, 1, "keep@x.test", "keep", "body", now - DAY_MS),
    );
    mock.put(
        "INBOX",
        1,
        raw_message(2, 1, "drop@x.test", "drop", "body", now - DAY_MS),
    );
    harness
        .add_account("a@x.test", mock.clone(), Arc::new(MockCalDav::default()))
        .await;
    harness
        .wait_for("primed", Duration::from_secs(10), |s| s.mail_count() == 2)
        .await;

    // First incremental pass records the flag fingerprints.
    harness.bus.publish(SyncSignal::Wake {
        account: Some("a@x.test".into()),
    });
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The server marks one message read and expunges the other.
    let mut seen = raw_message(1, 1, "keep@x.test", "keep", "body", now - DAY_MS);
    seen.flags = vec!["\\Seen".into()];
    mock.put("INBOX", 1, seen);
    mock.remove_message("INBOX", 2);
    harness.bus.publish(SyncSignal::Wake {
        account: Some("a@x.test".into()),
    });

    harness
        .wait_for("flag + removal sync", Duration::from_secs(10), |s| {
            s.mail_count() == 1
                && s.mail_by_provider_id(
                    "a@x.test",
                    crate::modules::message::stable_hash64("keep@x.test"),
                )
                .is_some_and(|r| r.flags.contains(&"\\Seen".to_string()))
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calendar_delta_ingests_events() {
    let harness = Harness::new().await;
    let mock_cal = Arc::new(MockCalDav::default());
    mock_cal.seed_event(
        "/events/ev1.ics",
        "\"etag-1\"",
        crate::modules::caldav::ical::testing::sample_ical("uid-1", "Standup", "20250301T100000Z"),
    );
    let mock = Arc::new(MockImap::default());
    mock.put(
        "INBOX",
        1,
        raw_message(1, 1, "seed@x.test", "seed", "body", utc_now!() - DAY_MS),
    );
    harness.add_account("a@x.test", mock, mock_cal.clone()).await;

    harness
        .wait_for("calendar item", Duration::from_secs(10), |s| {
            s.calendar_count() == 1
        })
        .await;
    let reader = harness.reader();
    let snapshot = reader.snapshot();
    let ids = snapshot.filter_scan(
        crate::modules::store::reader::Table::Calendar,
        &Default::default(),
        10,
    );
    let event = snapshot.calendar(ids[0]).unwrap();
    assert_eq!(event.summary, "Standup");
    assert!(event.embedding.iter().any(|v| *v != 0.0));
}
