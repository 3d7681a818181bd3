// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::caldav::xml::{
    calendar_list_body, multiget_body, parse_multistatus, sync_collection_body,
};
use crate::modules::caldav::{
    delta_from_multistatus, CalendarDelta, CalendarInfo, CalendarObject, CalendarProvider,
};
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::oauth2::TokenRefresher;
use crate::raise_error;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const GOOGLE_CALDAV_BASE: &str = "https://apidata.googleusercontent.com/caldav/v2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Google Calendar over CalDAV: sync-collection reports for deltas,
/// multiget for payloads, conditional PUT/DELETE for mutations. Bearer
/// tokens come from the shared refresher, so a mid-sync expiry heals
/// itself on the next request.
pub struct GoogleCalDav {
    email: String,
    base_url: String,
    refresher: Arc<TokenRefresher>,
    http: reqwest::Client,
}

impl GoogleCalDav {
    pub fn new(email: String, base_url: impl Into<String>, refresher: Arc<TokenRefresher>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to construct reqwest client");
        Self {
            email,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresher,
            http,
        }
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/{}/events",
            self.base_url,
            urlencode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!("{}/{}.ics", self.events_url(calendar_id), event_id)
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        depth: Option<&str>,
        body: Option<String>,
        if_match: Option<&str>,
        content_type: &str,
    ) -> GroundEffectResult<reqwest::Response> {
        let tokens = self.refresher.current_tokens(&self.email).await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&tokens.access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type);
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }
        if let Some(etag) = if_match {
            request = request.header(reqwest::header::IF_MATCH, etag);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::NetworkError))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(raise_error!(
                format!("CalDAV auth rejected for '{}'", self.email),
                ErrorCode::CalDavAuthenticationFailed
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let mut message = "CalDAV rate limited".to_string();
                if let Some(secs) = retry_after {
                    message.push_str(&format!(", retry after {secs}s"));
                }
                Err(raise_error!(message, ErrorCode::TooManyRequest))
            }
            status if status.is_server_error() => Err(raise_error!(
                format!("CalDAV server error {status}"),
                ErrorCode::HttpResponseError
            )),
            _ => Ok(response),
        }
    }

    async fn report(&self, url: &str, body: String) -> GroundEffectResult<String> {
        let method = Method::from_bytes(b"REPORT")
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        let response = self
            .request(
                method,
                url,
                Some("1"),
                Some(body),
                None,
                "application/xml; charset=utf-8",
            )
            .await?;
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("REPORT on {url} failed with {}", response.status()),
                ErrorCode::CalDavReportFailed
            ));
        }
        response
            .text()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::HttpResponseError))
    }
}

fn urlencode(input: &str) -> String {
    // Calendar ids are email-shaped; '@' is the only character needing care
    // in this position.
    input.replace('@', "%40")
}

#[async_trait]
impl CalendarProvider for GoogleCalDav {
    async fn list_calendars(&self) -> GroundEffectResult<Vec<CalendarInfo>> {
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        let url = format!("{}/{}/user", self.base_url, urlencode(&self.email));
        let primary = CalendarInfo {
            id: self.email.clone(),
            display_name: "Primary".to_string(),
        };
        let response = self
            .request(
                method,
                &url,
                Some("1"),
                Some(calendar_list_body()),
                None,
                "application/xml; charset=utf-8",
            )
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(
                    status = %response.status(),
                    "calendar home listing unavailable, using the primary calendar"
                );
                return Ok(vec![primary]);
            }
            Err(e) if e.code() == ErrorCode::CalDavAuthenticationFailed => return Err(e),
            Err(e) => {
                warn!("calendar home listing failed: {}", e.message());
                return Ok(vec![primary]);
            }
        };
        let body = response
            .text()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::HttpResponseError))?;
        let multistatus = parse_multistatus(&body)?;
        let mut calendars: Vec<CalendarInfo> = multistatus
            .items
            .into_iter()
            .filter(|item| item.is_calendar)
            .map(|item| CalendarInfo {
                id: super::event_id_from_href(&item.href),
                display_name: item.display_name.unwrap_or_default(),
            })
            .collect();
        if calendars.is_empty() {
            calendars.push(primary);
        }
        calendars.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(calendars)
    }

    async fn sync_delta(
        &self,
        calendar_id: &str,
        sync_token: Option<&str>,
    ) -> GroundEffectResult<CalendarDelta> {
        let body = self
            .report(
                &self.events_url(calendar_id),
                sync_collection_body(sync_token),
            )
            .await?;
        Ok(delta_from_multistatus(parse_multistatus(&body)?))
    }

    async fn fetch_events(
        &self,
        calendar_id: &str,
        hrefs: &[String],
    ) -> GroundEffectResult<Vec<CalendarObject>> {
        if hrefs.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .report(&self.events_url(calendar_id), multiget_body(hrefs))
            .await?;
        let multistatus = parse_multistatus(&body)?;
        Ok(multistatus
            .items
            .into_iter()
            .filter_map(|item| {
                let ical = item.calendar_data?;
                Some(CalendarObject {
                    href: item.href,
                    etag: item.etag.unwrap_or_default(),
                    ical,
                })
            })
            .collect())
    }

    async fn put_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        ical: &str,
        if_match: Option<&str>,
    ) -> GroundEffectResult<String> {
        let url = self.event_url(calendar_id, event_id);
        let response = self
            .request(
                Method::PUT,
                &url,
                None,
                Some(ical.to_string()),
                if_match,
                "text/calendar; charset=utf-8",
            )
            .await?;
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("PUT {url} failed with {}", response.status()),
                ErrorCode::CalDavReportFailed
            ));
        }
        Ok(response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .unwrap_or_default())
    }

    async fn delete_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        if_match: Option<&str>,
    ) -> GroundEffectResult<()> {
        let url = self.event_url(calendar_id, event_id);
        let response = self
            .request(Method::DELETE, &url, None, None, if_match, "text/plain")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Already gone; sync will reconcile.
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("DELETE {url} failed with {}", response.status()),
                ErrorCode::CalDavReportFailed
            ));
        }
        Ok(())
    }
}
