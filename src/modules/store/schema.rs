// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use serde::{Deserialize, Serialize};

/// Vector width is fixed by the schema; no row may carry anything else.
pub const EMBEDDING_DIM: usize = 768;

/// Relative index weight of subject-like fields over body text.
pub const SUBJECT_FIELD_WEIGHT: f32 = 2.0;
pub const BODY_FIELD_WEIGHT: f32 = 1.0;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Addr {
    pub name: Option<String>,
    pub email: String,
}

impl Addr {
    pub fn new(name: Option<String>, email: impl Into<String>) -> Self {
        Self {
            name,
            email: email.into(),
        }
    }

    fn haystack(&self) -> String {
        match &self.name {
            Some(name) => format!("{} {}", name.to_lowercase(), self.email.to_lowercase()),
            None => self.email.to_lowercase(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub content_id: Option<String>,
    /// Set once the attachment worker has downloaded the payload.
    pub local_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MailRecord {
    pub id: u64,
    pub account_id: String,
    pub gmail_message_id: u64,
    pub gmail_thread_id: u64,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub folder: String,
    pub uid: u32,
    pub uid_validity: u32,
    pub labels: Vec<String>,
    pub flags: Vec<String>,
    pub from: Addr,
    pub to: Vec<Addr>,
    pub cc: Vec<Addr>,
    pub bcc: Vec<Addr>,
    pub subject: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub date: i64,
    pub body_text: String,
    pub body_html: Option<String>,
    pub snippet: String,
    pub attachments: Vec<AttachmentMeta>,
    pub embedding: Vec<f32>,
    pub needs_embedding: bool,
    pub synced_at: i64,
    pub size: u64,
}

impl MailRecord {
    pub fn is_unread(&self) -> bool {
        !self.flags.iter().any(|f| f == "\\Seen")
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Flagged")
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transparency {
    #[default]
    Busy,
    Free,
}

/// A point in time or a whole date, as iCalendar DTSTART/DTEND allow.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    /// Milliseconds since the Unix epoch, UTC.
    Instant(i64),
    /// A date without a time component, `YYYY-MM-DD`.
    WholeDate(String),
}

impl Default for EventTime {
    fn default() -> Self {
        EventTime::Instant(0)
    }
}

impl EventTime {
    /// Millisecond timestamp used for range filtering and ordering; whole
    /// dates sort at their midnight UTC.
    pub fn sort_key(&self) -> i64 {
        match self {
            EventTime::Instant(millis) => *millis,
            EventTime::WholeDate(date) => chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis())
                .unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarRecord {
    pub id: u64,
    pub account_id: String,
    pub event_id: String,
    pub ical_uid: String,
    pub etag: String,
    pub calendar_id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    pub time_zone: Option<String>,
    pub all_day: bool,
    pub rrule: Option<String>,
    /// Set on exception instances of a recurring master.
    pub recurrence_id: Option<String>,
    pub organizer: Option<Addr>,
    pub attendees: Vec<Addr>,
    pub status: EventStatus,
    pub transparency: Transparency,
    /// Reminder offsets in minutes before the start.
    pub reminders: Vec<i64>,
    pub embedding: Vec<f32>,
    pub needs_embedding: bool,
    pub synced_at: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccountStatus {
    #[default]
    Active,
    Syncing,
    NeedsReauth,
    Disabled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Canonical address; the primary key.
    pub email: String,
    pub alias: Option<String>,
    pub display_name: String,
    pub status: AccountStatus,
    pub added_at: i64,
    pub last_email_sync: Option<i64>,
    pub last_calendar_sync: Option<i64>,
    pub email_sync_enabled: bool,
    pub calendar_sync_enabled: bool,
    /// Folder allowlist; None means every folder.
    pub folders: Option<Vec<String>>,
    pub sync_attachments: bool,
}

/// Structured filters translated from a search request. A record matches
/// iff it satisfies every populated field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    /// Canonical addresses; None searches all accounts.
    pub accounts: Option<Vec<String>>,
    pub folder: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub sender_contains: Option<String>,
    pub recipient_contains: Option<String>,
    pub has_attachment: Option<bool>,
    pub calendar_id: Option<String>,
}

impl Predicate {
    fn account_matches(&self, account_id: &str) -> bool {
        match &self.accounts {
            Some(accounts) => accounts.iter().any(|a| a == account_id),
            None => true,
        }
    }

    fn date_matches(&self, date: i64) -> bool {
        if let Some(from) = self.date_from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if date > to {
                return false;
            }
        }
        true
    }
}

/// The two item tables behind one searchable interface; the hybrid
/// searcher is parameterised over this.
pub trait Searchable: Clone + Send + Sync + 'static {
    fn doc_id(&self) -> u64;
    fn account(&self) -> &str;
    fn sort_date(&self) -> i64;
    fn embedding(&self) -> &[f32];
    /// (weight, text) pairs feeding the keyword index.
    fn weighted_text(&self) -> Vec<(f32, String)>;
    fn matches(&self, predicate: &Predicate) -> bool;
}

impl Searchable for MailRecord {
    fn doc_id(&self) -> u64 {
        self.id
    }

    fn account(&self) -> &str {
        &self.account_id
    }

    fn sort_date(&self) -> i64 {
        self.date
    }

    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn weighted_text(&self) -> Vec<(f32, String)> {
        let mut fields = vec![
            (SUBJECT_FIELD_WEIGHT, self.subject.clone()),
            (SUBJECT_FIELD_WEIGHT, self.from.haystack()),
            (BODY_FIELD_WEIGHT, self.body_text.clone()),
        ];
        let filenames: String = self
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if !filenames.is_empty() {
            fields.push((BODY_FIELD_WEIGHT, filenames));
        }
        fields
    }

    fn matches(&self, predicate: &Predicate) -> bool {
        if !predicate.account_matches(&self.account_id) || !predicate.date_matches(self.date) {
            return false;
        }
        if let Some(folder) = &predicate.folder {
            if !self.folder.eq_ignore_ascii_case(folder) {
                return false;
            }
        }
        if let Some(needle) = &predicate.sender_contains {
            if !self.from.haystack().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(needle) = &predicate.recipient_contains {
            let needle = needle.to_lowercase();
            let hit = self
                .to
                .iter()
                .chain(self.cc.iter())
                .chain(self.bcc.iter())
                .any(|addr| addr.haystack().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(wanted) = predicate.has_attachment {
            if self.attachments.is_empty() == wanted {
                return false;
            }
        }
        if predicate.calendar_id.is_some() {
            return false;
        }
        true
    }
}

impl Searchable for CalendarRecord {
    fn doc_id(&self) -> u64 {
        self.id
    }

    fn account(&self) -> &str {
        &self.account_id
    }

    fn sort_date(&self) -> i64 {
        self.start.sort_key()
    }

    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn weighted_text(&self) -> Vec<(f32, String)> {
        let mut fields = vec![(SUBJECT_FIELD_WEIGHT, self.summary.clone())];
        if let Some(description) = &self.description {
            fields.push((BODY_FIELD_WEIGHT, description.clone()));
        }
        if let Some(location) = &self.location {
            fields.push((BODY_FIELD_WEIGHT, location.clone()));
        }
        let attendees: String = self
            .attendees
            .iter()
            .map(|a| a.haystack())
            .collect::<Vec<_>>()
            .join(" ");
        if !attendees.is_empty() {
            fields.push((BODY_FIELD_WEIGHT, attendees));
        }
        fields
    }

    fn matches(&self, predicate: &Predicate) -> bool {
        if !predicate.account_matches(&self.account_id)
            || !predicate.date_matches(self.start.sort_key())
        {
            return false;
        }
        if let Some(calendar_id) = &predicate.calendar_id {
            if &self.calendar_id != calendar_id {
                return false;
            }
        }
        if let Some(needle) = &predicate.sender_contains {
            let needle = needle.to_lowercase();
            match &self.organizer {
                Some(organizer) if organizer.haystack().contains(&needle) => {}
                _ => return false,
            }
        }
        if let Some(needle) = &predicate.recipient_contains {
            let needle = needle.to_lowercase();
            if !self.attendees.iter().any(|a| a.haystack().contains(&needle)) {
                return false;
            }
        }
        // Mail-only filters exclude calendar rows outright.
        if predicate.folder.is_some() || predicate.has_attachment.is_some() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail(account: &str, folder: &str, date: i64) -> MailRecord {
        MailRecord {
            id: 1,
            account_id: account.into(),
            folder: folder.into(),
            date,
            from: Addr::new(Some("Alice Example".into()), "alice@x.test"),
            to: vec![Addr::new(None, "bob@y.test")],
            subject: "Quarterly invoice".into(),
            ..Default::default()
        }
    }

    #[test]
    fn predicate_matches_iff_all_filters_hold() {
        let record = mail("a@x.test", "INBOX", 1_000);
        let mut predicate = Predicate {
            accounts: Some(vec!["a@x.test".into()]),
            folder: Some("inbox".into()),
            date_from: Some(500),
            date_to: Some(2_000),
            sender_contains: Some("alice".into()),
            ..Default::default()
        };
        assert!(record.matches(&predicate));

        predicate.date_from = Some(1_500);
        assert!(!record.matches(&predicate));

        predicate.date_from = Some(500);
        predicate.sender_contains = Some("mallory".into());
        assert!(!record.matches(&predicate));
    }

    #[test]
    fn has_attachment_filter() {
        let mut record = mail("a@x.test", "INBOX", 1_000);
        let predicate = Predicate {
            has_attachment: Some(true),
            ..Default::default()
        };
        assert!(!record.matches(&predicate));
        record.attachments.push(AttachmentMeta {
            id: "1".into(),
            filename: "report.pdf".into(),
            mime: "application/pdf".into(),
            size: 10,
            content_id: None,
            local_path: None,
        });
        assert!(record.matches(&predicate));
    }

    #[test]
    fn whole_date_sort_key_is_midnight_utc() {
        let time = EventTime::WholeDate("2025-03-01".into());
        assert_eq!(time.sort_key(), 1_740_787_200_000);
    }

    #[test]
    fn recipient_filter_spans_cc_and_bcc() {
        let mut record = mail("a@x.test", "INBOX", 1_000);
        record.cc = vec![Addr::new(None, "carol@z.test")];
        let predicate = Predicate {
            recipient_contains: Some("carol".into()),
            ..Default::default()
        };
        assert!(record.matches(&predicate));
    }
}
