// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::store::schema::{
    Addr, CalendarRecord, EventStatus, EventTime, Transparency, EMBEDDING_DIM,
};
use crate::raise_error;
use crate::utc_now;
use icalendar::{Calendar, CalendarComponent, Component, DatePerhapsTime, EventLike};
use rrule::RRule;
use tracing::warn;

/// Parses an iCalendar payload into store rows: the master VEVENT plus any
/// recurrence-id exception instances it carries. Unparseable payloads are
/// poison: the caller quarantines the event id.
pub fn parse_calendar_objects(
    account_id: &str,
    calendar_id: &str,
    event_id: &str,
    etag: &str,
    ical: &str,
) -> GroundEffectResult<Vec<CalendarRecord>> {
    let calendar: Calendar = ical.parse().map_err(|e: String| {
        raise_error!(
            format!("unparseable iCalendar for '{event_id}': {e}"),
            ErrorCode::MalformedEvent
        )
    })?;

    let mut records = Vec::new();
    for component in &calendar.components {
        let CalendarComponent::Event(event) = component else {
            continue;
        };
        let recurrence_id = event.property_value("RECURRENCE-ID").map(str::to_string);
        let ical_uid = event
            .get_uid()
            .map(str::to_string)
            .unwrap_or_else(|| event_id.to_string());

        // Exception instances get their own row keyed by recurrence-id.
        let provider_id = match &recurrence_id {
            Some(instant) => format!("{event_id}#{instant}"),
            None => event_id.to_string(),
        };

        let rrule = event.property_value("RRULE").and_then(|raw| {
            if raw.parse::<RRule<rrule::Unvalidated>>().is_ok() {
                Some(raw.to_string())
            } else {
                warn!(event = %event_id, "discarding unparseable RRULE '{raw}'");
                None
            }
        });

        let (start, all_day, time_zone) = convert_time(event.get_start());
        let (end, _, _) = convert_time(event.get_end());

        let status = match event.property_value("STATUS") {
            Some("TENTATIVE") => EventStatus::Tentative,
            Some("CANCELLED") => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        };
        let transparency = match event.property_value("TRANSP") {
            Some("TRANSPARENT") => Transparency::Free,
            _ => Transparency::Busy,
        };

        let organizer = event.property_value("ORGANIZER").map(addr_from_caladdress);
        let attendees: Vec<Addr> = event
            .multi_properties()
            .get("ATTENDEE")
            .map(|props| {
                props
                    .iter()
                    .map(|p| addr_from_caladdress(p.value()))
                    .collect()
            })
            .unwrap_or_default();

        records.push(CalendarRecord {
            id: crate::modules::utils::generate_id(),
            account_id: account_id.to_string(),
            event_id: provider_id,
            ical_uid,
            etag: etag.to_string(),
            calendar_id: calendar_id.to_string(),
            summary: event.get_summary().unwrap_or_default().to_string(),
            description: event.get_description().map(str::to_string),
            location: event.get_location().map(str::to_string),
            start,
            end,
            time_zone,
            all_day,
            rrule,
            recurrence_id,
            organizer,
            attendees,
            status,
            transparency,
            reminders: parse_reminders(ical),
            embedding: vec![0.0; EMBEDDING_DIM],
            needs_embedding: true,
            synced_at: utc_now!(),
        });
    }

    if records.is_empty() {
        return Err(raise_error!(
            format!("payload for '{event_id}' contains no VEVENT"),
            ErrorCode::MalformedEvent
        ));
    }
    Ok(records)
}

fn convert_time(time: Option<DatePerhapsTime>) -> (EventTime, bool, Option<String>) {
    match time {
        Some(DatePerhapsTime::Date(date)) => (
            EventTime::WholeDate(date.format("%Y-%m-%d").to_string()),
            true,
            None,
        ),
        Some(DatePerhapsTime::DateTime(dt)) => match dt {
            icalendar::CalendarDateTime::Utc(instant) => {
                (EventTime::Instant(instant.timestamp_millis()), false, None)
            }
            icalendar::CalendarDateTime::Floating(naive) => (
                EventTime::Instant(naive.and_utc().timestamp_millis()),
                false,
                None,
            ),
            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => (
                // Stored at its floating UTC reading; the original zone is
                // kept alongside for display.
                EventTime::Instant(date_time.and_utc().timestamp_millis()),
                false,
                Some(tzid),
            ),
        },
        None => (EventTime::Instant(0), false, None),
    }
}

fn addr_from_caladdress(value: &str) -> Addr {
    Addr {
        name: None,
        email: value
            .strip_prefix("mailto:")
            .unwrap_or(value)
            .to_string(),
    }
}

/// Reminder offsets (minutes before start) from VALARM TRIGGER lines, e.g.
/// `TRIGGER:-PT30M` or `TRIGGER:-PT1H`.
fn parse_reminders(ical: &str) -> Vec<i64> {
    let mut reminders = Vec::new();
    for line in ical.lines() {
        let line = line.trim();
        let Some(value) = line
            .strip_prefix("TRIGGER:")
            .or_else(|| line.strip_prefix("TRIGGER;VALUE=DURATION:"))
        else {
            continue;
        };
        let negative = value.starts_with('-');
        let duration = value.trim_start_matches('-').trim_start_matches("PT");
        let minutes = if let Some(h) = duration.strip_suffix('H') {
            h.parse::<i64>().ok().map(|h| h * 60)
        } else if let Some(m) = duration.strip_suffix('M') {
            m.parse::<i64>().ok()
        } else if let Some(d) = duration.trim_start_matches('P').strip_suffix('D') {
            d.parse::<i64>().ok().map(|d| d * 24 * 60)
        } else {
            None
        };
        if let Some(minutes) = minutes {
            if negative {
                reminders.push(minutes);
            }
        }
    }
    reminders.sort_unstable();
    reminders.dedup();
    reminders
}

#[cfg(test)]
pub mod testing {
    /// iCalendar fixture with one VEVENT.
    pub fn sample_ical(uid: &str, summary: &str, start_utc: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\n\
             VERSION:2.0\r\n\
             PRODID:-//test//EN\r\n\
             BEGIN:VEVENT\r\n\
             UID:{uid}\r\n\
             DTSTAMP:20250101T000000Z\r\n\
             DTSTART:{start_utc}\r\n\
             DTEND:{start_utc}\r\n\
             SUMMARY:{summary}\r\n\
             ORGANIZER:mailto:host@x.test\r\n\
             ATTENDEE:mailto:guest@y.test\r\n\
             BEGIN:VALARM\r\n\
             ACTION:DISPLAY\r\n\
             TRIGGER:-PT30M\r\n\
             END:VALARM\r\n\
             END:VEVENT\r\n\
             END:VCALENDAR\r\n"
        )
    }
}
