// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::caldav::{CalendarDelta, DeltaItem};
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use quick_xml::events::Event;
use quick_xml::Reader;

pub fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn sync_collection_body(sync_token: Option<&str>) -> String {
    let mut body = String::from(
        r#"<D:sync-collection xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">"#,
    );
    match sync_token {
        Some(token) => {
            body.push_str("<D:sync-token>");
            body.push_str(&escape_xml(token));
            body.push_str("</D:sync-token>");
        }
        None => body.push_str("<D:sync-token/>"),
    }
    body.push_str("<D:sync-level>1</D:sync-level>");
    body.push_str("<D:prop><D:getetag/></D:prop>");
    body.push_str("</D:sync-collection>");
    body
}

pub fn multiget_body(hrefs: &[String]) -> String {
    let mut body = String::from(
        r#"<C:calendar-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav"><D:prop><D:getetag/><C:calendar-data/></D:prop>"#,
    );
    for href in hrefs {
        body.push_str("<D:href>");
        body.push_str(&escape_xml(href));
        body.push_str("</D:href>");
    }
    body.push_str("</C:calendar-multiget>");
    body
}

pub fn calendar_list_body() -> String {
    r#"<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav"><D:prop><D:resourcetype/><D:displayname/></D:prop></D:propfind>"#
        .to_string()
}

/// One `<D:response>` of a multistatus body.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MultiStatusItem {
    pub href: String,
    pub etag: Option<String>,
    pub status: Option<String>,
    pub calendar_data: Option<String>,
    pub display_name: Option<String>,
    pub is_calendar: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MultiStatus {
    pub sync_token: Option<String>,
    pub items: Vec<MultiStatusItem>,
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(':').next().unwrap_or(&name).to_ascii_lowercase()
}

/// Streaming parse of a WebDAV multistatus document. Namespace prefixes
/// vary by server, so elements are matched on their local names.
pub fn parse_multistatus(body: &str) -> GroundEffectResult<MultiStatus> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut result = MultiStatus::default();
    let mut current: Option<MultiStatusItem> = None;
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = local_name(start.name().as_ref());
                if name == "response" {
                    current = Some(MultiStatusItem::default());
                }
                path.push(name);
            }
            Ok(Event::Empty(empty)) => {
                let name = local_name(empty.name().as_ref());
                if name == "calendar" {
                    if let Some(item) = current.as_mut() {
                        item.is_calendar = true;
                    }
                }
            }
            Ok(Event::End(end)) => {
                let name = local_name(end.name().as_ref());
                if name == "response" {
                    if let Some(item) = current.take() {
                        result.items.push(item);
                    }
                }
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .decode()
                    .map_err(|e| raise_error!(format!("{e}"), ErrorCode::CalDavReportFailed))?;
                let value = quick_xml::escape::unescape(&decoded)
                    .map_err(|e| raise_error!(format!("{e}"), ErrorCode::CalDavReportFailed))?
                    .into_owned();
                let Some(element) = path.last().map(String::as_str) else {
                    continue;
                };
                match (element, current.as_mut()) {
                    ("href", Some(item)) => item.href = value,
                    ("getetag", Some(item)) => item.etag = Some(value.trim_matches('"').to_string()),
                    ("status", Some(item)) => item.status = Some(value),
                    ("calendar-data", Some(item)) => item.calendar_data = Some(value),
                    ("displayname", Some(item)) => item.display_name = Some(value),
                    ("calendar", Some(item)) => item.is_calendar = true,
                    ("sync-token", maybe_item) => {
                        // The collection-level token sits outside any
                        // response element.
                        if maybe_item.is_none() || result.sync_token.is_none() {
                            result.sync_token = Some(value);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(raise_error!(
                    format!("multistatus parse error: {e}"),
                    ErrorCode::CalDavReportFailed
                ))
            }
            _ => {}
        }
    }
    Ok(result)
}

/// Maps a sync-collection multistatus into adds/updates/deletes. A 404/410
/// status marks a removal.
pub fn delta_from_multistatus(multistatus: MultiStatus) -> CalendarDelta {
    let mut items = Vec::new();
    for item in multistatus.items {
        if item.href.is_empty() {
            continue;
        }
        let is_deleted = item
            .status
            .as_deref()
            .map(|s| s.contains("404") || s.contains("410"))
            .unwrap_or(false);
        if !is_deleted && item.etag.is_none() {
            // A response with neither etag nor removal status is the
            // collection itself.
            continue;
        }
        items.push(DeltaItem {
            href: item.href,
            etag: item.etag,
            is_deleted,
        });
    }
    CalendarDelta {
        sync_token: multistatus.sync_token,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC_RESPONSE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <D:multistatus xmlns:D="DAV:">
          <D:response>
            <D:href>/caldav/v2/a%40x.test/events/ev1.ics</D:href>
            <D:propstat>
              <D:prop><D:getetag>"etag-1"</D:getetag></D:prop>
              <D:status>HTTP/1.1 200 OK</D:status>
            </D:propstat>
          </D:response>
          <D:response>
            <D:href>/caldav/v2/a%40x.test/events/gone.ics</D:href>
            <D:status>HTTP/1.1 404 Not Found</D:status>
          </D:response>
          <D:sync-token>token-42</D:sync-token>
        </D:multistatus>"#;

    #[test]
    fn parses_sync_collection_response() {
        let multistatus = parse_multistatus(SYNC_RESPONSE).unwrap();
        assert_eq!(multistatus.sync_token.as_deref(), Some("token-42"));
        let delta = delta_from_multistatus(multistatus);
        assert_eq!(delta.items.len(), 2);
        assert_eq!(delta.items[0].etag.as_deref(), Some("etag-1"));
        assert!(!delta.items[0].is_deleted);
        assert!(delta.items[1].is_deleted);
    }

    #[test]
    fn body_builders_embed_the_token() {
        let body = sync_collection_body(Some("tok<1>"));
        assert!(body.contains("<D:sync-token>tok&lt;1&gt;</D:sync-token>"));
        assert!(sync_collection_body(None).contains("<D:sync-token/>"));
        let multiget = multiget_body(&["/a/b.ics".to_string()]);
        assert!(multiget.contains("<D:href>/a/b.ics</D:href>"));
    }
}
