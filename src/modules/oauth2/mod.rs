// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod refresh;
pub mod token;

pub use refresh::TokenRefresher;
pub use token::{CredentialVault, FileVault, TokenBundle};
