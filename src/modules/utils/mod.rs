// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

pub mod shutdown;

#[macro_export]
macro_rules! groundeffect_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

#[macro_export]
macro_rules! utc_now {
    () => {{
        use chrono::Utc;
        Utc::now().timestamp_millis()
    }};
}

#[macro_export]
macro_rules! base64_encode {
    ($bytes:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.encode($bytes)
    }};
}

#[macro_export]
macro_rules! base64_decode {
    ($key:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.decode($key)
    }};
}

#[macro_export]
macro_rules! raise_error {
    ($msg:expr, $code:expr) => {
        $crate::modules::error::GroundEffectError::Generic {
            message: $msg,
            location: snafu::Location::default(),
            code: $code,
        }
    };
}

#[macro_export]
macro_rules! encode_mailbox_name {
    ($name:expr) => {{
        utf7_imap::encode_utf7_imap($name.to_string())
    }};
}

#[macro_export]
macro_rules! decode_mailbox_name {
    ($name:expr) => {{
        utf7_imap::decode_utf7_imap($name.to_string())
    }};
}

#[macro_export]
macro_rules! run_with_timeout {
    ($duration:expr, $task:expr, $err_msg:expr) => {{
        match tokio::time::timeout($duration, $task).await {
            Ok(result) => Ok(result),
            Err(_) => Err($err_msg),
        }
    }};
}

static ID_SEQUENCE: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(rand::rng().random_range(0..0x4000)));

/// Monotonically-increasing id: millisecond timestamp in the high bits, a
/// per-process sequence in the low bits. The sequence is seeded randomly so
/// two daemon restarts within the same millisecond cannot mint the same id.
pub fn generate_id() -> u64 {
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let millis = crate::utc_now!() as u64;
    (millis << 14) | (seq & 0x3FFF)
}

pub fn validate_email(input: &str) -> GroundEffectResult<()> {
    if email_address::EmailAddress::is_valid(input) {
        return Ok(());
    }
    Err(raise_error!(
        format!("'{input}' is not a valid email address"),
        ErrorCode::InvalidParameter
    ))
}

/// Backoff schedule for degraded accounts and re-queued fetches: 1, 2, 4,
/// 8, ... seconds, capped at 60.
pub fn backoff_secs(attempt: u32) -> u64 {
    let shift = attempt.min(6);
    (1u64 << shift).min(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(6), 60);
        assert_eq!(backoff_secs(40), 60);
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("a@x.test").is_ok());
        assert!(validate_email("not-an-address").is_err());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }
}
