// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;
use async_trait::async_trait;

pub mod client;
pub mod ical;
pub mod xml;

pub use xml::delta_from_multistatus;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CalendarInfo {
    pub id: String,
    pub display_name: String,
}

/// One entry of a sync-collection report: a change or a removal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeltaItem {
    pub href: String,
    pub etag: Option<String>,
    pub is_deleted: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CalendarDelta {
    pub sync_token: Option<String>,
    pub items: Vec<DeltaItem>,
}

/// A fetched calendar object: href, etag, raw iCalendar payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CalendarObject {
    pub href: String,
    pub etag: String,
    pub ical: String,
}

/// Capability surface of the calendar provider (CalDAV with RFC 6578
/// sync-collection). Tests substitute an in-memory fake.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_calendars(&self) -> GroundEffectResult<Vec<CalendarInfo>>;
    /// Changes since `sync_token`; None means a full (initial) listing.
    async fn sync_delta(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
    ) -> GroundEffectResult<CalendarDelta>;
    /// Batched multiget of the given hrefs.
    async fn fetch_events(
        &self,
        calendar_id: &str,
        hrefs: &[String],
    ) -> GroundEffectResult<Vec<CalendarObject>>;
    /// PUT; returns the new etag.
    async fn put_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        ical: &str,
        if_match: Option<&str>,
    ) -> GroundEffectResult<String>;
    async fn delete_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        if_match: Option<&str>,
    ) -> GroundEffectResult<()>;
}

/// Event id from a DAV href: the last path segment, `.ics` stripped.
pub fn event_id_from_href(href: &str) -> String {
    let segment = href.trim_end_matches('/').rsplit('/').next().unwrap_or(href);
    segment.trim_end_matches(".ics").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_come_from_the_last_href_segment() {
        assert_eq!(
            event_id_from_href("/caldav/v2/a%40x.test/events/abc123.ics"),
            "abc123"
        );
        assert_eq!(event_id_from_href("abc123.ics"), "abc123");
    }
}
