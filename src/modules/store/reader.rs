// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use crate::modules::store::index::{KeywordIndex, VectorIndex};
use crate::modules::store::manifest::Manifest;
use crate::modules::store::schema::{
    AccountRecord, CalendarRecord, MailRecord, Predicate, Searchable,
};
use crate::modules::store::snapshot::TableState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    Mail,
    Calendar,
}

/// One consistent view of the store. Everything a query touches lives in
/// this struct, so a request sees the manifest it opened for its whole
/// lifetime no matter what the writer publishes meanwhile.
pub struct Snapshot {
    pub version: u64,
    state: TableState,
    mail_keyword: KeywordIndex,
    mail_vector: VectorIndex,
    calendar_keyword: KeywordIndex,
    calendar_vector: VectorIndex,
}

impl Snapshot {
    fn build(version: u64, state: TableState) -> Self {
        let mail_keyword = KeywordIndex::build(
            state
                .mail
                .values()
                .map(|r| (r.doc_id(), r.weighted_text())),
        );
        let mail_vector = VectorIndex::build(
            state
                .mail
                .values()
                .map(|r| (r.doc_id(), r.embedding.clone())),
        );
        let calendar_keyword = KeywordIndex::build(
            state
                .calendar
                .values()
                .map(|r| (r.doc_id(), r.weighted_text())),
        );
        let calendar_vector = VectorIndex::build(
            state
                .calendar
                .values()
                .map(|r| (r.doc_id(), r.embedding.clone())),
        );
        Self {
            version,
            state,
            mail_keyword,
            mail_vector,
            calendar_keyword,
            calendar_vector,
        }
    }

    pub fn mail(&self, id: u64) -> Option<&MailRecord> {
        self.state.mail.get(&id)
    }

    pub fn calendar(&self, id: u64) -> Option<&CalendarRecord> {
        self.state.calendar.get(&id)
    }

    pub fn account(&self, email: &str) -> Option<&AccountRecord> {
        self.state.accounts.get(email)
    }

    pub fn accounts(&self) -> Vec<&AccountRecord> {
        let mut accounts: Vec<&AccountRecord> = self.state.accounts.values().collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        accounts
    }

    pub fn mail_count(&self) -> usize {
        self.state.mail.len()
    }

    pub fn calendar_count(&self) -> usize {
        self.state.calendar.len()
    }

    /// Keyword ranking under the predicate; (id, BM25 score), best first.
    pub fn keyword_query(
        &self,
        table: Table,
        query: &str,
        predicate: &Predicate,
        limit: usize,
    ) -> GroundEffectResult<Vec<(u64, f32)>> {
        let results = match table {
            Table::Mail => self.mail_keyword.search(query, limit, |id| {
                self.state
                    .mail
                    .get(&id)
                    .is_some_and(|r| r.matches(predicate))
            }),
            Table::Calendar => self.calendar_keyword.search(query, limit, |id| {
                self.state
                    .calendar
                    .get(&id)
                    .is_some_and(|r| r.matches(predicate))
            }),
        };
        Ok(results)
    }

    /// Vector ranking under the predicate; (id, cosine similarity).
    pub fn vector_query(
        &self,
        table: Table,
        query: &[f32],
        predicate: &Predicate,
        limit: usize,
    ) -> GroundEffectResult<Vec<(u64, f32)>> {
        let results = match table {
            Table::Mail => self.mail_vector.search(query, limit, |id| {
                self.state
                    .mail
                    .get(&id)
                    .is_some_and(|r| r.matches(predicate))
            }),
            Table::Calendar => self.calendar_vector.search(query, limit, |id| {
                self.state
                    .calendar
                    .get(&id)
                    .is_some_and(|r| r.matches(predicate))
            }),
        };
        Ok(results)
    }

    /// Predicate-only scan for empty-query searches: newest first, id as
    /// the stable tie-break.
    pub fn filter_scan(&self, table: Table, predicate: &Predicate, limit: usize) -> Vec<u64> {
        let mut rows: Vec<(i64, u64)> = match table {
            Table::Mail => self
                .state
                .mail
                .values()
                .filter(|r| r.matches(predicate))
                .map(|r| (r.sort_date(), r.doc_id()))
                .collect(),
            Table::Calendar => self
                .state
                .calendar
                .values()
                .filter(|r| r.matches(predicate))
                .map(|r| (r.sort_date(), r.doc_id()))
                .collect(),
        };
        rows.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        rows.truncate(limit);
        rows.into_iter().map(|(_, id)| id).collect()
    }

    /// Rows matching the predicate, before any limit.
    pub fn filter_count(&self, table: Table, predicate: &Predicate) -> usize {
        match table {
            Table::Mail => self
                .state
                .mail
                .values()
                .filter(|r| r.matches(predicate))
                .count(),
            Table::Calendar => self
                .state
                .calendar
                .values()
                .filter(|r| r.matches(predicate))
                .count(),
        }
    }

    /// Thread reconstruction: range scan over (account_id, thread_id),
    /// ordered by date.
    pub fn thread(&self, account_id: &str, thread_id: u64) -> Vec<&MailRecord> {
        let mut rows: Vec<&MailRecord> = self
            .state
            .mail
            .values()
            .filter(|r| r.account_id == account_id && r.gmail_thread_id == thread_id)
            .collect();
        rows.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        rows
    }

    pub fn folders(&self, account_id: &str) -> Vec<(String, usize)> {
        let mut counts: ahash::AHashMap<String, usize> = ahash::AHashMap::new();
        for record in self.state.mail.values() {
            if record.account_id == account_id {
                *counts.entry(record.folder.clone()).or_default() += 1;
            }
        }
        let mut folders: Vec<(String, usize)> = counts.into_iter().collect();
        folders.sort_by(|a, b| a.0.cmp(&b.0));
        folders
    }

    pub fn calendars(&self, account_id: &str) -> Vec<(String, usize)> {
        let mut counts: ahash::AHashMap<String, usize> = ahash::AHashMap::new();
        for record in self.state.calendar.values() {
            if record.account_id == account_id {
                *counts.entry(record.calendar_id.clone()).or_default() += 1;
            }
        }
        let mut calendars: Vec<(String, usize)> = counts.into_iter().collect();
        calendars.sort_by(|a, b| a.0.cmp(&b.0));
        calendars
    }

    pub fn mail_by_provider_id(&self, account_id: &str, gmail_message_id: u64) -> Option<&MailRecord> {
        let id = self
            .state
            .mail_keys
            .get(&(account_id.to_string(), gmail_message_id))?;
        self.state.mail.get(id)
    }
}

/// Read-only handle on the store. `open` pins the latest published
/// manifest; `refresh` advances to a newer one if the writer has committed
/// since. Never blocks, and never observes a partial commit.
pub struct StoreReader {
    store_dir: PathBuf,
    snapshot: Arc<Snapshot>,
}

impl StoreReader {
    pub fn open(store_dir: PathBuf) -> GroundEffectResult<Self> {
        let snapshot = Self::load(&store_dir)?;
        Ok(Self {
            store_dir,
            snapshot: Arc::new(snapshot),
        })
    }

    fn load(store_dir: &PathBuf) -> GroundEffectResult<Snapshot> {
        match Manifest::load_current(store_dir)? {
            Some((manifest, _)) => {
                let state = TableState::replay(store_dir, &manifest)?;
                debug!(version = manifest.version, "reader snapshot loaded");
                Ok(Snapshot::build(manifest.version, state))
            }
            None => Ok(Snapshot::build(0, TableState::default())),
        }
    }

    /// The pinned snapshot; clone the Arc to keep a view alive across
    /// refreshes for the lifetime of one query.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.clone()
    }

    /// Re-opens at the latest manifest. Existing snapshot handles are
    /// untouched. Returns true when a newer version was picked up.
    pub fn refresh(&mut self) -> GroundEffectResult<bool> {
        let current = Manifest::load_current(&self.store_dir)?
            .map(|(m, _)| m.version)
            .unwrap_or(0);
        if current == self.snapshot.version {
            return Ok(false);
        }
        self.snapshot = Arc::new(Self::load(&self.store_dir)?);
        Ok(true)
    }
}
