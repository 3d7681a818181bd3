// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::store::manifest::{write_atomically, FRAGMENT_DIR};
use crate::raise_error;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// One immutable fragment file: a bincode-encoded row batch. Fragments are
/// only ever created and deleted whole, never rewritten.
pub fn write_fragment<T: Serialize>(
    store_dir: &Path,
    name: &str,
    rows: &[T],
) -> GroundEffectResult<()> {
    let bytes = bincode::serialize(rows)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    let dir = store_dir.join(FRAGMENT_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    write_atomically(&dir.join(name), &bytes)
}

pub fn read_fragment<T: DeserializeOwned>(
    store_dir: &Path,
    name: &str,
) -> GroundEffectResult<Vec<T>> {
    let path = store_dir.join(FRAGMENT_DIR).join(name);
    let bytes = std::fs::read(&path).map_err(|e| {
        raise_error!(
            format!("fragment {} unreadable: {e}", path.display()),
            ErrorCode::StoreCorrupted
        )
    })?;
    bincode::deserialize(&bytes).map_err(|e| {
        raise_error!(
            format!("fragment {} undecodable: {e}", path.display()),
            ErrorCode::StoreCorrupted
        )
    })
}

pub fn fragment_name(table: &str, version: u64, sequence: usize) -> String {
    format!("{table}-{version:012}-{sequence}.frag")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::store::schema::MailRecord;
    use tempfile::TempDir;

    #[test]
    fn fragment_round_trip() {
        let dir = TempDir::new().unwrap();
        let rows = vec![
            MailRecord {
                id: 1,
                subject: "first".into(),
                ..Default::default()
            },
            MailRecord {
                id: 2,
                subject: "second".into(),
                ..Default::default()
            },
        ];
        let name = fragment_name("mail", 1, 0);
        write_fragment(dir.path(), &name, &rows).unwrap();
        let loaded: Vec<MailRecord> = read_fragment(dir.path(), &name).unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn missing_fragment_is_store_corruption() {
        let dir = TempDir::new().unwrap();
        let err = read_fragment::<MailRecord>(dir.path(), "mail-000000000001-0.frag").unwrap_err();
        assert_eq!(
            err.code(),
            crate::modules::error::code::ErrorCode::StoreCorrupted
        );
    }
}
