// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    // Validation errors (10000–10999): bad input, never touches the store
    InvalidParameter = 10000,
    MissingConfiguration = 10020,
    ExceedsLimitation = 10040,
    UnknownAccount = 10050,
    UnknownAlias = 10060,
    ConfirmationRequired = 10070,

    // Authentication errors (20000–20999): account -> NeedsReauth
    OAuth2RefreshFailed = 20000,
    MissingRefreshToken = 20010,
    ImapAuthenticationFailed = 20020,
    CalDavAuthenticationFailed = 20030,
    AccountDisabled = 20040,

    // Resource errors (30000–30999)
    ResourceNotFound = 30000,
    AlreadyExists = 30010,
    TooManyRequest = 30020,

    // Transient errors (40000–40999): retried with backoff, never surfaced
    NetworkError = 40000,
    ConnectionTimeout = 40010,
    ConnectionPoolTimeout = 40020,
    HttpResponseError = 40030,
    IdleDropped = 40040,
    RequestTimeout = 40050,
    Cancelled = 40060,

    // Provider errors (50000–50999)
    ImapCommandFailed = 50000,
    ImapUnexpectedResult = 50020,
    SmtpCommandFailed = 50030,
    CalDavReportFailed = 50040,
    UidValidityChanged = 50050,

    // Poison errors (60000–60999): quarantine the id, log once, continue
    MalformedMessage = 60000,
    MalformedEvent = 60010,

    // Fatal errors (70000–70999): the daemon exits non-zero
    InternalError = 70000,
    StoreCorrupted = 70010,
    WriterLockHeld = 70020,
    EmbedderUnavailable = 70030,
}

impl ErrorCode {
    /// Transient failures are absorbed by the orchestrator and re-queued
    /// with backoff instead of being surfaced to callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionPoolTimeout
                | ErrorCode::HttpResponseError
                | ErrorCode::IdleDropped
                | ErrorCode::RequestTimeout
                | ErrorCode::TooManyRequest
        )
    }

    /// Auth failures move the owning account to NeedsReauth.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ErrorCode::OAuth2RefreshFailed
                | ErrorCode::MissingRefreshToken
                | ErrorCode::ImapAuthenticationFailed
                | ErrorCode::CalDavAuthenticationFailed
        )
    }

    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            ErrorCode::MalformedMessage | ErrorCode::MalformedEvent
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::StoreCorrupted
                | ErrorCode::WriterLockHeld
                | ErrorCode::EmbedderUnavailable
        )
    }

    /// Stable wire name used in the query server's error envelope.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "bad_request",
            ErrorCode::MissingConfiguration => "missing_configuration",
            ErrorCode::ExceedsLimitation => "exceeds_limitation",
            ErrorCode::UnknownAccount => "unknown_account",
            ErrorCode::UnknownAlias => "bad_request",
            ErrorCode::ConfirmationRequired => "confirmation_required",
            ErrorCode::OAuth2RefreshFailed
            | ErrorCode::MissingRefreshToken
            | ErrorCode::ImapAuthenticationFailed
            | ErrorCode::CalDavAuthenticationFailed => "needs_reauth",
            ErrorCode::AccountDisabled => "account_disabled",
            ErrorCode::ResourceNotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::TooManyRequest => "rate_limited",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NetworkError
            | ErrorCode::ConnectionTimeout
            | ErrorCode::ConnectionPoolTimeout
            | ErrorCode::HttpResponseError
            | ErrorCode::IdleDropped
            | ErrorCode::RequestTimeout => "transient",
            ErrorCode::ImapCommandFailed
            | ErrorCode::ImapUnexpectedResult
            | ErrorCode::SmtpCommandFailed
            | ErrorCode::CalDavReportFailed
            | ErrorCode::UidValidityChanged => "provider_error",
            ErrorCode::MalformedMessage | ErrorCode::MalformedEvent => "poison",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::StoreCorrupted => "store_corrupted",
            ErrorCode::WriterLockHeld => "writer_lock_held",
            ErrorCode::EmbedderUnavailable => "embedder_unavailable",
        }
    }
}
