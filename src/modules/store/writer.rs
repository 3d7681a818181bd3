// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::store::fragment::{fragment_name, write_fragment};
use crate::modules::store::manifest::{collect_garbage, Manifest, WriterLock};
use crate::modules::store::schema::{
    AccountRecord, CalendarRecord, MailRecord, EMBEDDING_DIM,
};
use crate::modules::store::snapshot::TableState;
use crate::raise_error;
use crate::utc_now;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Live fragments tolerated before the writer folds them into one.
const COMPACTION_THRESHOLD: usize = 64;

/// Unreferenced files younger than this survive garbage collection so
/// lagging readers keep the snapshot they opened.
const GC_GRACE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub enum WriteOp {
    UpsertMail(MailRecord),
    UpsertCalendar(CalendarRecord),
    UpsertAccount(AccountRecord),
    DeleteMail {
        account_id: String,
        gmail_message_id: u64,
    },
    /// Removal observed as a vanished UID; the row is found by its folder
    /// position.
    DeleteMailByUid {
        account_id: String,
        folder: String,
        uid: u32,
    },
    DeleteCalendar {
        account_id: String,
        event_id: String,
    },
    /// Cascades to every item row keyed by the address.
    DeleteAccount { email: String },
    /// UID-validity rollover: after this commit's upserts are applied, any
    /// row still carrying a different validity in this folder is dropped.
    InvalidateFolderUids {
        account_id: String,
        folder: String,
        uid_validity: u32,
    },
}

impl WriteOp {
    fn is_delete(&self) -> bool {
        matches!(
            self,
            WriteOp::DeleteMail { .. }
                | WriteOp::DeleteMailByUid { .. }
                | WriteOp::DeleteCalendar { .. }
                | WriteOp::DeleteAccount { .. }
                | WriteOp::InvalidateFolderUids { .. }
        )
    }
}

/// The single writer: owns the lock, the authoritative in-memory table
/// state, and the manifest chain. All mutation funnels through
/// [`StoreWriter::commit`]; a commit either publishes in full or not at all.
pub struct StoreWriter {
    store_dir: PathBuf,
    _lock: WriterLock,
    state: TableState,
    manifest: Manifest,
}

impl StoreWriter {
    pub fn open(store_dir: PathBuf) -> GroundEffectResult<Self> {
        std::fs::create_dir_all(&store_dir)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        let lock = WriterLock::acquire(&store_dir)?;
        let (state, manifest) = match Manifest::load_current(&store_dir)? {
            Some((manifest, _)) => (TableState::replay(&store_dir, &manifest)?, manifest),
            None => (TableState::default(), Manifest::default()),
        };
        info!(
            version = manifest.version,
            mail = state.mail.len(),
            calendar = state.calendar.len(),
            accounts = state.accounts.len(),
            "store writer opened"
        );
        Ok(Self {
            store_dir,
            _lock: lock,
            state,
            manifest,
        })
    }

    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Applies a batch and publishes a new manifest. Operations are applied
    /// upserts-first, deletes-last, so a UID-validity invalidation in the
    /// same batch as its re-mapped rows keeps the re-observed rows.
    pub fn commit(&mut self, ops: Vec<WriteOp>) -> GroundEffectResult<u64> {
        if ops.is_empty() {
            return Ok(self.manifest.version);
        }
        let version = self.manifest.version + 1;

        let mut touched_mail: Vec<u64> = Vec::new();
        let mut touched_calendar: Vec<u64> = Vec::new();
        let mut touched_accounts = false;

        let (upserts, deletes): (Vec<WriteOp>, Vec<WriteOp>) =
            ops.into_iter().partition(|op| !op.is_delete());

        for op in upserts {
            match op {
                WriteOp::UpsertMail(record) => {
                    if let Some(id) = self.upsert_mail(record)? {
                        touched_mail.push(id);
                    }
                }
                WriteOp::UpsertCalendar(record) => {
                    if let Some(id) = self.upsert_calendar(record)? {
                        touched_calendar.push(id);
                    }
                }
                WriteOp::UpsertAccount(record) => {
                    self.state.accounts.insert(record.email.clone(), record);
                    touched_accounts = true;
                }
                _ => unreachable!("partitioned"),
            }
        }

        for op in deletes {
            match op {
                WriteOp::DeleteMail {
                    account_id,
                    gmail_message_id,
                } => {
                    if let Some(id) = self.state.remove_mail(&account_id, gmail_message_id) {
                        self.manifest.deleted_mail.push(id);
                    }
                }
                WriteOp::DeleteMailByUid {
                    account_id,
                    folder,
                    uid,
                } => {
                    if let Some(id) = self.state.remove_mail_by_uid(&account_id, &folder, uid) {
                        self.manifest.deleted_mail.push(id);
                    }
                }
                WriteOp::DeleteCalendar { account_id, event_id } => {
                    if let Some(id) = self.state.remove_calendar(&account_id, &event_id) {
                        self.manifest.deleted_calendar.push(id);
                    }
                }
                WriteOp::DeleteAccount { email } => {
                    let (mail, calendar) = self.state.remove_account(&email);
                    self.manifest.deleted_mail.extend(mail);
                    self.manifest.deleted_calendar.extend(calendar);
                    touched_accounts = true;
                }
                WriteOp::InvalidateFolderUids {
                    account_id,
                    folder,
                    uid_validity,
                } => {
                    let stale = self
                        .state
                        .remove_stale_uids(&account_id, &folder, uid_validity);
                    if !stale.is_empty() {
                        info!(
                            account = %account_id,
                            folder = %folder,
                            dropped = stale.len(),
                            "uid-validity rollover dropped stale rows"
                        );
                    }
                    self.manifest.deleted_mail.extend(stale);
                }
                _ => unreachable!("partitioned"),
            }
        }

        // Fragments carry the rows touched this commit; replay order makes
        // the newest observation win.
        if !touched_mail.is_empty() {
            let rows: Vec<MailRecord> = touched_mail
                .iter()
                .filter_map(|id| self.state.mail.get(id).cloned())
                .collect();
            let name = fragment_name("mail", version, 0);
            write_fragment(&self.store_dir, &name, &rows)?;
            self.manifest.mail_fragments.push(name);
        }
        if !touched_calendar.is_empty() {
            let rows: Vec<CalendarRecord> = touched_calendar
                .iter()
                .filter_map(|id| self.state.calendar.get(id).cloned())
                .collect();
            let name = fragment_name("calendar", version, 0);
            write_fragment(&self.store_dir, &name, &rows)?;
            self.manifest.calendar_fragments.push(name);
        }
        if touched_accounts {
            // The accounts table is small; each touching commit rewrites it
            // whole so the manifest lists exactly one account fragment.
            let rows: Vec<AccountRecord> = self.state.accounts.values().cloned().collect();
            let name = fragment_name("accounts", version, 0);
            write_fragment(&self.store_dir, &name, &rows)?;
            self.manifest.account_fragments = vec![name];
        }

        self.manifest.version = version;
        self.manifest.committed_at = utc_now!();
        self.manifest.publish(&self.store_dir)?;
        debug!(version, "store commit published");

        if self.manifest.fragment_count() > COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(self.manifest.version)
    }

    fn validate_embedding(embedding: &[f32]) -> GroundEffectResult<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(raise_error!(
                format!(
                    "embedding width {} violates the fixed schema width {EMBEDDING_DIM}",
                    embedding.len()
                ),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(())
    }

    fn upsert_mail(&mut self, mut record: MailRecord) -> GroundEffectResult<Option<u64>> {
        Self::validate_embedding(&record.embedding)?;
        if !self.state.accounts.contains_key(&record.account_id) {
            warn!(
                account = %record.account_id,
                message = record.gmail_message_id,
                "dropping mail row for unknown account"
            );
            return Ok(None);
        }
        let key = (record.account_id.clone(), record.gmail_message_id);
        if let Some(existing_id) = self.state.mail_keys.get(&key) {
            // Duplicate observation of the same logical item: update in
            // place, keeping the internal id stable.
            record.id = *existing_id;
        }
        let id = record.id;
        self.state.mail_keys.insert(key, id);
        self.state.mail.insert(id, record);
        Ok(Some(id))
    }

    fn upsert_calendar(&mut self, mut record: CalendarRecord) -> GroundEffectResult<Option<u64>> {
        Self::validate_embedding(&record.embedding)?;
        if !self.state.accounts.contains_key(&record.account_id) {
            warn!(
                account = %record.account_id,
                event = %record.event_id,
                "dropping calendar row for unknown account"
            );
            return Ok(None);
        }
        let key = (record.account_id.clone(), record.event_id.clone());
        if let Some(existing_id) = self.state.calendar_keys.get(&key) {
            record.id = *existing_id;
        }
        let id = record.id;
        self.state.calendar_keys.insert(key, id);
        self.state.calendar.insert(id, record);
        Ok(Some(id))
    }

    /// Folds every live row into one fragment per table and resets the
    /// tombstone lists. Superseded files stay on disk until the GC grace
    /// window passes.
    fn compact(&mut self) -> GroundEffectResult<()> {
        let version = self.manifest.version + 1;
        info!(version, "compacting store fragments");

        let mail: Vec<MailRecord> = self.state.mail.values().cloned().collect();
        let calendar: Vec<CalendarRecord> = self.state.calendar.values().cloned().collect();
        let accounts: Vec<AccountRecord> = self.state.accounts.values().cloned().collect();

        let mail_name = fragment_name("mail", version, 0);
        let calendar_name = fragment_name("calendar", version, 0);
        let accounts_name = fragment_name("accounts", version, 0);
        write_fragment(&self.store_dir, &mail_name, &mail)?;
        write_fragment(&self.store_dir, &calendar_name, &calendar)?;
        write_fragment(&self.store_dir, &accounts_name, &accounts)?;

        self.manifest = Manifest {
            version,
            committed_at: utc_now!(),
            mail_fragments: vec![mail_name],
            calendar_fragments: vec![calendar_name],
            account_fragments: vec![accounts_name],
            deleted_mail: Vec::new(),
            deleted_calendar: Vec::new(),
        };
        self.manifest.publish(&self.store_dir)?;
        let removed = collect_garbage(&self.store_dir, GC_GRACE)?;
        if removed > 0 {
            debug!(removed, "store garbage collection removed files");
        }
        Ok(())
    }
}

pub struct CommitRequest {
    pub ops: Vec<WriteOp>,
    pub ack: Option<oneshot::Sender<GroundEffectResult<u64>>>,
}

/// Cloneable handle for submitting write operations to the commit queue.
#[derive(Clone)]
pub struct CommitHandle {
    tx: mpsc::Sender<CommitRequest>,
}

impl CommitHandle {
    /// Fire-and-forget enqueue; the batch publishes within the commit
    /// policy window.
    pub async fn submit(&self, ops: Vec<WriteOp>) -> GroundEffectResult<()> {
        self.tx
            .send(CommitRequest { ops, ack: None })
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))
    }

    /// Enqueue and wait for the batch containing these ops to publish.
    /// Per-account ordering leans on this: an orchestrator awaiting the ack
    /// knows its writes are visible before it issues dependent ones.
    pub async fn submit_and_wait(&self, ops: Vec<WriteOp>) -> GroundEffectResult<u64> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(CommitRequest {
                ops,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        ack_rx
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?
    }
}

/// Commit policy: publish after `batch_size` pending items or `batch_secs`
/// of wall-clock time, whichever comes first. Returns the submit handle and
/// the queue task; the task drains pending work before exiting on shutdown.
pub fn spawn_commit_queue(
    mut writer: StoreWriter,
    batch_size: usize,
    batch_window: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> (CommitHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CommitRequest>(1024);
    let handle = tokio::spawn(async move {
        let mut pending_ops: Vec<WriteOp> = Vec::new();
        let mut pending_acks: Vec<oneshot::Sender<GroundEffectResult<u64>>> = Vec::new();
        let mut closed = false;
        while !closed {
            // Block until the batch has a first item; the window clock
            // starts there.
            tokio::select! {
                request = rx.recv() => match request {
                    Some(CommitRequest { ops, ack }) => {
                        pending_ops.extend(ops);
                        if let Some(ack) = ack {
                            pending_acks.push(ack);
                        }
                    }
                    None => closed = true,
                },
                _ = shutdown.recv() => closed = true,
            }

            let deadline = tokio::time::sleep(batch_window);
            tokio::pin!(deadline);
            while !closed && !pending_ops.is_empty() && pending_ops.len() < batch_size {
                tokio::select! {
                    request = rx.recv() => match request {
                        Some(CommitRequest { ops, ack }) => {
                            pending_ops.extend(ops);
                            if let Some(ack) = ack {
                                pending_acks.push(ack);
                            }
                        }
                        None => closed = true,
                    },
                    _ = &mut deadline => break,
                    _ = shutdown.recv() => closed = true,
                }
            }

            if !pending_ops.is_empty() {
                let ops = std::mem::take(&mut pending_ops);
                let result = writer.commit(ops);
                if let Err(e) = &result {
                    warn!("store commit failed: {:#?}", e);
                }
                for ack in pending_acks.drain(..) {
                    let _ = ack.send(match &result {
                        Ok(version) => Ok(*version),
                        Err(e) => Err(raise_error!(e.message().to_string(), e.code())),
                    });
                }
            }
        }
        info!("commit queue drained, releasing writer lock");
    });
    (CommitHandle { tx }, handle)
}
