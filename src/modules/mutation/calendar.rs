// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::caldav::CalendarProvider;
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::store::schema::CalendarRecord;
use crate::raise_error;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use icalendar::{Calendar, Component, Event, EventLike};
use serde::{Deserialize, Serialize};
use tracing::info;

/// An event write request; also the structured preview shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventDraft {
    pub calendar_id: Option<String>,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    /// RFC 3339 instant, or `YYYY-MM-DD` for all-day events.
    pub start: String,
    pub end: String,
    pub attendees: Vec<String>,
    #[serde(default)]
    pub all_day: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventWriteResult {
    pub event_id: String,
    pub etag: String,
}

fn render_time(value: &str, all_day: bool) -> GroundEffectResult<String> {
    if all_day {
        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
            raise_error!(
                format!("'{value}' is not a YYYY-MM-DD date: {e}"),
                ErrorCode::InvalidParameter
            )
        })?;
        return Ok(date.format("%Y%m%d").to_string());
    }
    let instant: DateTime<Utc> = DateTime::parse_from_rfc3339(value)
        .map_err(|e| {
            raise_error!(
                format!("'{value}' is not an RFC 3339 instant: {e}"),
                ErrorCode::InvalidParameter
            )
        })?
        .with_timezone(&Utc);
    Ok(instant.format("%Y%m%dT%H%M%SZ").to_string())
}

/// Renders the draft as an iCalendar object. The DTSTART/DTEND literals
/// are written by hand so all-day events carry `VALUE=DATE`.
pub fn draft_to_ical(uid: &str, draft: &EventDraft) -> GroundEffectResult<String> {
    let start = render_time(&draft.start, draft.all_day)?;
    let end = render_time(&draft.end, draft.all_day)?;

    let mut event = Event::new();
    event.uid(uid).summary(&draft.summary);
    if let Some(description) = &draft.description {
        event.description(description);
    }
    if let Some(location) = &draft.location {
        event.location(location);
    }
    for attendee in &draft.attendees {
        crate::modules::utils::validate_email(attendee)?;
        event.add_property("ATTENDEE", &format!("mailto:{attendee}"));
    }
    if draft.all_day {
        event.add_property("DTSTART;VALUE=DATE", &start);
        event.add_property("DTEND;VALUE=DATE", &end);
    } else {
        event.add_property("DTSTART", &start);
        event.add_property("DTEND", &end);
    }
    event.add_property(
        "DTSTAMP",
        &Utc.timestamp_millis_opt(crate::utc_now!())
            .single()
            .unwrap_or_default()
            .format("%Y%m%dT%H%M%SZ")
            .to_string(),
    );

    let mut calendar = Calendar::new();
    calendar.push(event.done());
    Ok(calendar.to_string())
}

pub async fn create_event(
    provider: &dyn CalendarProvider,
    account: &str,
    draft: EventDraft,
) -> GroundEffectResult<EventWriteResult> {
    let calendar_id = draft
        .calendar_id
        .clone()
        .unwrap_or_else(|| account.to_string());
    let event_id = format!("ge-{}", crate::modules::utils::generate_id());
    let ical = draft_to_ical(&event_id, &draft)?;
    let etag = provider
        .put_event(&calendar_id, &event_id, &ical, None)
        .await?;
    info!(account, event_id = %event_id, "event created");
    Ok(EventWriteResult { event_id, etag })
}

pub async fn update_event(
    provider: &dyn CalendarProvider,
    record: &CalendarRecord,
    draft: EventDraft,
) -> GroundEffectResult<EventWriteResult> {
    let ical = draft_to_ical(&record.ical_uid, &draft)?;
    let etag = provider
        .put_event(
            &record.calendar_id,
            &record.event_id,
            &ical,
            Some(&record.etag),
        )
        .await?;
    info!(event_id = %record.event_id, "event updated");
    Ok(EventWriteResult {
        event_id: record.event_id.clone(),
        etag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> EventDraft {
        EventDraft {
            calendar_id: None,
            summary: "Planning".into(),
            description: Some("Q3 planning".into()),
            location: None,
            start: "2025-03-01T10:00:00Z".into(),
            end: "2025-03-01T11:00:00Z".into(),
            attendees: vec!["guest@y.test".into()],
            all_day: false,
        }
    }

    #[test]
    fn renders_a_timed_event() {
        let ical = draft_to_ical("uid-1", &draft()).unwrap();
        assert!(ical.contains("BEGIN:VEVENT"));
        assert!(ical.contains("UID:uid-1"));
        assert!(ical.contains("DTSTART:20250301T100000Z"));
        assert!(ical.contains("SUMMARY:Planning"));
        assert!(ical.contains("ATTENDEE:mailto:guest@y.test"));
    }

    #[test]
    fn renders_an_all_day_event() {
        let mut d = draft();
        d.all_day = true;
        d.start = "2025-03-01".into();
        d.end = "2025-03-02".into();
        let ical = draft_to_ical("uid-2", &d).unwrap();
        assert!(ical.contains("DTSTART;VALUE=DATE:20250301"));
        assert!(ical.contains("DTEND;VALUE=DATE:20250302"));
    }

    #[test]
    fn rejects_malformed_times() {
        let mut d = draft();
        d.start = "March first".into();
        assert!(draft_to_ical("uid-3", &d).is_err());
    }

    #[test]
    fn round_trips_through_the_parser() {
        let ical = draft_to_ical("uid-4", &draft()).unwrap();
        let records = crate::modules::caldav::ical::parse_calendar_objects(
            "a@x.test",
            "a@x.test",
            "uid-4",
            "\"etag\"",
            &ical,
        )
        .unwrap();
        assert_eq!(records[0].summary, "Planning");
        assert_eq!(records[0].attendees[0].email, "guest@y.test");
    }
}
