// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::raise_error;
use bb8::RunError;
use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GroundEffectError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type GroundEffectResult<T, E = GroundEffectError> = std::result::Result<T, E>;

impl GroundEffectError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GroundEffectError::Generic { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GroundEffectError::Generic { message, .. } => message,
        }
    }
}

impl From<RunError<GroundEffectError>> for GroundEffectError {
    fn from(e: RunError<GroundEffectError>) -> Self {
        match e {
            RunError::User(inner) => inner,
            RunError::TimedOut => raise_error!(
                "connection pool checkout timed out".into(),
                ErrorCode::ConnectionPoolTimeout
            ),
        }
    }
}

impl From<std::io::Error> for GroundEffectError {
    fn from(e: std::io::Error) -> Self {
        raise_error!(format!("{e}"), ErrorCode::InternalError)
    }
}
