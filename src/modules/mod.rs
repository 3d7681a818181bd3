// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod account;
pub mod caldav;
pub mod common;
pub mod embedder;
pub mod error;
pub mod imap;
pub mod logger;
pub mod message;
pub mod mutation;
pub mod oauth2;
pub mod ratelimit;
pub mod rpc;
pub mod search;
pub mod settings;
pub mod store;
pub mod sync;
pub mod utils;
