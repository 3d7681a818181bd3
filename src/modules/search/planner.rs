// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::settings::config::Config;
use crate::modules::store::reader::Snapshot;
use crate::modules::store::schema::Predicate;
use crate::raise_error;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

/// A search request as the tool surface receives it. Dates accept either
/// RFC 3339 instants or bare `YYYY-MM-DD` days.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    /// Aliases or canonical addresses; None (or null) searches every
    /// account.
    pub accounts: Option<Vec<String>>,
    pub folder: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub has_attachment: Option<bool>,
    pub calendar_id: Option<String>,
    pub limit: Option<usize>,
}

/// The validated, store-ready form of a request.
#[derive(Clone, Debug)]
pub struct PlannedSearch {
    pub query: String,
    pub predicate: Predicate,
    pub limit: usize,
    /// Canonical addresses actually searched, echoed in the response.
    pub accounts_searched: Vec<String>,
}

/// Resolves one alias-or-address against the accounts table and the
/// configured alias map. Unknown names are a validation error: the store
/// is never touched with a filter that cannot match.
fn resolve_account(
    snapshot: &Snapshot,
    config: &Config,
    name: &str,
) -> GroundEffectResult<String> {
    if snapshot.account(name).is_some() {
        return Ok(name.to_string());
    }
    if let Some(target) = config.accounts.aliases.get(name) {
        return Ok(target.clone());
    }
    if let Some(record) = snapshot
        .accounts()
        .into_iter()
        .find(|a| a.alias.as_deref() == Some(name))
    {
        return Ok(record.email.clone());
    }
    Err(raise_error!(
        format!("unknown account or alias '{name}'"),
        ErrorCode::UnknownAlias
    ))
}

fn parse_instant(value: &str, end_of_day: bool) -> GroundEffectResult<i64> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_milli_opt(23, 59, 59, 999).unwrap()
        } else {
            date.and_hms_opt(0, 0, 0).unwrap()
        };
        return Ok(time.and_utc().timestamp_millis());
    }
    Err(raise_error!(
        format!("'{value}' is neither an RFC 3339 instant nor a YYYY-MM-DD date"),
        ErrorCode::InvalidParameter
    ))
}

pub fn plan(
    snapshot: &Snapshot,
    config: &Config,
    request: &SearchRequest,
) -> GroundEffectResult<PlannedSearch> {
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(raise_error!(
            format!("limit {limit} outside the 1-{MAX_LIMIT} range"),
            ErrorCode::InvalidParameter
        ));
    }

    let accounts = match &request.accounts {
        None => None,
        Some(names) => {
            let mut resolved = Vec::with_capacity(names.len());
            for name in names {
                let canonical = resolve_account(snapshot, config, name)?;
                if !resolved.contains(&canonical) {
                    resolved.push(canonical);
                }
            }
            Some(resolved)
        }
    };
    let accounts_searched = match &accounts {
        Some(list) => list.clone(),
        None => snapshot
            .accounts()
            .into_iter()
            .map(|a| a.email.clone())
            .collect(),
    };

    let predicate = Predicate {
        accounts,
        folder: request.folder.clone(),
        date_from: request
            .date_from
            .as_deref()
            .map(|v| parse_instant(v, false))
            .transpose()?,
        date_to: request
            .date_to
            .as_deref()
            .map(|v| parse_instant(v, true))
            .transpose()?,
        sender_contains: request.sender.clone(),
        recipient_contains: request.recipient.clone(),
        has_attachment: request.has_attachment,
        calendar_id: request.calendar_id.clone(),
    };

    Ok(PlannedSearch {
        query: request.query.trim().to_string(),
        predicate,
        limit,
        accounts_searched,
    })
}
