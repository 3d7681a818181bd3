// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use crate::modules::store::fragment::read_fragment;
use crate::modules::store::manifest::Manifest;
use crate::modules::store::schema::{AccountRecord, CalendarRecord, MailRecord};
use ahash::{AHashMap, AHashSet};
use std::path::Path;

/// Materialised view of one manifest: fragments replayed in order (newest
/// observation of a row wins), tombstones applied last. Internal ids are
/// never reused, so cumulative tombstones cannot swallow a re-observed
/// item.
#[derive(Default)]
pub struct TableState {
    pub mail: AHashMap<u64, MailRecord>,
    pub mail_keys: AHashMap<(String, u64), u64>,
    pub calendar: AHashMap<u64, CalendarRecord>,
    pub calendar_keys: AHashMap<(String, String), u64>,
    pub accounts: AHashMap<String, AccountRecord>,
}

impl TableState {
    pub fn replay(store_dir: &Path, manifest: &Manifest) -> GroundEffectResult<Self> {
        let mut state = Self::default();

        for name in &manifest.account_fragments {
            for record in read_fragment::<AccountRecord>(store_dir, name)? {
                state.accounts.insert(record.email.clone(), record);
            }
        }

        let deleted_mail: AHashSet<u64> = manifest.deleted_mail.iter().copied().collect();
        for name in &manifest.mail_fragments {
            for record in read_fragment::<MailRecord>(store_dir, name)? {
                if deleted_mail.contains(&record.id) {
                    continue;
                }
                state
                    .mail_keys
                    .insert((record.account_id.clone(), record.gmail_message_id), record.id);
                state.mail.insert(record.id, record);
            }
        }

        let deleted_calendar: AHashSet<u64> =
            manifest.deleted_calendar.iter().copied().collect();
        for name in &manifest.calendar_fragments {
            for record in read_fragment::<CalendarRecord>(store_dir, name)? {
                if deleted_calendar.contains(&record.id) {
                    continue;
                }
                state
                    .calendar_keys
                    .insert((record.account_id.clone(), record.event_id.clone()), record.id);
                state.calendar.insert(record.id, record);
            }
        }

        Ok(state)
    }

    pub fn remove_mail(&mut self, account_id: &str, gmail_message_id: u64) -> Option<u64> {
        let id = self
            .mail_keys
            .remove(&(account_id.to_string(), gmail_message_id))?;
        self.mail.remove(&id);
        Some(id)
    }

    pub fn remove_mail_by_uid(&mut self, account_id: &str, folder: &str, uid: u32) -> Option<u64> {
        let id = self
            .mail
            .values()
            .find(|r| {
                r.account_id == account_id && r.uid == uid && r.folder.eq_ignore_ascii_case(folder)
            })
            .map(|r| r.id)?;
        let record = self.mail.remove(&id)?;
        self.mail_keys
            .remove(&(record.account_id, record.gmail_message_id));
        Some(id)
    }

    pub fn remove_calendar(&mut self, account_id: &str, event_id: &str) -> Option<u64> {
        let id = self
            .calendar_keys
            .remove(&(account_id.to_string(), event_id.to_string()))?;
        self.calendar.remove(&id);
        Some(id)
    }

    /// Cascade delete: returns the internal ids of every removed item row.
    pub fn remove_account(&mut self, email: &str) -> (Vec<u64>, Vec<u64>) {
        self.accounts.remove(email);
        let mail: Vec<u64> = self
            .mail
            .values()
            .filter(|r| r.account_id == email)
            .map(|r| r.id)
            .collect();
        for id in &mail {
            if let Some(record) = self.mail.remove(id) {
                self.mail_keys
                    .remove(&(record.account_id, record.gmail_message_id));
            }
        }
        let calendar: Vec<u64> = self
            .calendar
            .values()
            .filter(|r| r.account_id == email)
            .map(|r| r.id)
            .collect();
        for id in &calendar {
            if let Some(record) = self.calendar.remove(id) {
                self.calendar_keys
                    .remove(&(record.account_id, record.event_id));
            }
        }
        (mail, calendar)
    }

    /// Drops mail rows in `folder` whose uid_validity differs from the new
    /// epoch. Rows re-mapped in the same commit already carry the new value
    /// and survive.
    pub fn remove_stale_uids(
        &mut self,
        account_id: &str,
        folder: &str,
        uid_validity: u32,
    ) -> Vec<u64> {
        let stale: Vec<u64> = self
            .mail
            .values()
            .filter(|r| {
                r.account_id == account_id
                    && r.folder.eq_ignore_ascii_case(folder)
                    && r.uid_validity != uid_validity
            })
            .map(|r| r.id)
            .collect();
        for id in &stale {
            if let Some(record) = self.mail.remove(id) {
                self.mail_keys
                    .remove(&(record.account_id, record.gmail_message_id));
            }
        }
        stale
    }
}
