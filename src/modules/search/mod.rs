// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod envelope;
pub mod hybrid;
pub mod planner;

pub use hybrid::{HybridSearcher, SearchOutcome};
pub use planner::{plan, PlannedSearch, SearchRequest};
