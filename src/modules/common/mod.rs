// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::GroundEffectResult;

pub mod signal;

/// Startup hook for process-scoped components; the daemon and query server
/// call these in a fixed order from main.
pub trait Initialize {
    fn initialize() -> impl std::future::Future<Output = GroundEffectResult<()>> + Send;
}
