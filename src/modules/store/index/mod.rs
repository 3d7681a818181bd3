// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod keyword;
pub mod vector;

pub use keyword::KeywordIndex;
pub use vector::VectorIndex;
