// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::store::reader::Snapshot;
use crate::modules::store::schema::{Addr, CalendarRecord, EventTime, MailRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub fn iso8601(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone, Debug, Serialize)]
pub struct AddressEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
}

impl From<&Addr> for AddressEnvelope {
    fn from(addr: &Addr) -> Self {
        Self {
            name: addr.name.clone(),
            email: addr.email.clone(),
        }
    }
}

/// The stable mail result shape of the tool surface.
#[derive(Clone, Debug, Serialize)]
pub struct MailItemEnvelope {
    pub id: u64,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_alias: Option<String>,
    pub message_id: String,
    pub thread_id: u64,
    pub from: AddressEnvelope,
    pub to: Vec<AddressEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<AddressEnvelope>>,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub has_attachments: bool,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_body_chars: Option<usize>,
}

impl MailItemEnvelope {
    pub fn from_record(record: &MailRecord, snapshot: &Snapshot, score: Option<f64>) -> Self {
        let account_alias = snapshot
            .account(&record.account_id)
            .and_then(|a| a.alias.clone());
        Self {
            id: record.id,
            account_id: record.account_id.clone(),
            account_alias,
            message_id: record.message_id.clone(),
            thread_id: record.gmail_thread_id,
            from: AddressEnvelope::from(&record.from),
            to: record.to.iter().map(AddressEnvelope::from).collect(),
            cc: (!record.cc.is_empty())
                .then(|| record.cc.iter().map(AddressEnvelope::from).collect()),
            subject: record.subject.clone(),
            date: iso8601(record.date),
            snippet: record.snippet.clone(),
            has_attachments: !record.attachments.is_empty(),
            labels: record.labels.clone(),
            score,
            body: None,
            truncated: None,
            total_body_chars: None,
        }
    }

    /// Attaches the body, truncated to `max_chars`.
    pub fn with_body(mut self, record: &MailRecord, max_chars: usize) -> Self {
        let total = record.body_text.chars().count();
        if total > max_chars {
            self.body = Some(record.body_text.chars().take(max_chars).collect());
            self.truncated = Some(true);
        } else {
            self.body = Some(record.body_text.clone());
            self.truncated = Some(false);
        }
        self.total_body_chars = Some(total);
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EventEnvelope {
    pub id: u64,
    pub account_id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: String,
    pub end: String,
    pub all_day: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizer: Option<AddressEnvelope>,
    pub attendees: Vec<AddressEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

fn event_time_string(time: &EventTime) -> String {
    match time {
        EventTime::Instant(millis) => iso8601(*millis),
        EventTime::WholeDate(date) => date.clone(),
    }
}

impl EventEnvelope {
    pub fn from_record(record: &CalendarRecord, score: Option<f64>) -> Self {
        Self {
            id: record.id,
            account_id: record.account_id.clone(),
            event_id: record.event_id.clone(),
            calendar_id: record.calendar_id.clone(),
            summary: record.summary.clone(),
            description: record.description.clone(),
            location: record.location.clone(),
            start: event_time_string(&record.start),
            end: event_time_string(&record.end),
            all_day: record.all_day,
            status: format!("{:?}", record.status).to_lowercase(),
            organizer: record.organizer.as_ref().map(AddressEnvelope::from),
            attendees: record.attendees.iter().map(AddressEnvelope::from).collect(),
            recurrence: record.rrule.clone(),
            etag: Some(record.etag.clone()),
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_are_iso8601_utc() {
        assert_eq!(iso8601(1_740_787_200_000), "2025-03-01T00:00:00Z");
    }
}
