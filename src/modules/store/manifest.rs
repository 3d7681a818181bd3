// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_FILE: &str = "CURRENT";
pub const FRAGMENT_DIR: &str = "fragments";
const MANIFEST_PREFIX: &str = "manifest";

/// Indirection record naming the live fragments of one snapshot.
///
/// Fragments are replayed in order; a row observed in a later fragment
/// supersedes the same key in an earlier one. Tombstones are cumulative and
/// reset by compaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub committed_at: i64,
    pub mail_fragments: Vec<String>,
    pub calendar_fragments: Vec<String>,
    pub account_fragments: Vec<String>,
    pub deleted_mail: Vec<u64>,
    pub deleted_calendar: Vec<u64>,
}

impl Manifest {
    pub fn file_name(version: u64) -> String {
        format!("{MANIFEST_PREFIX}-{version:012}.json")
    }

    pub fn fragment_count(&self) -> usize {
        self.mail_fragments.len() + self.calendar_fragments.len() + self.account_fragments.len()
    }

    /// Reads the manifest the `CURRENT` pointer names, or None on a store
    /// that has never committed.
    pub fn load_current(store_dir: &Path) -> GroundEffectResult<Option<(Manifest, PathBuf)>> {
        let pointer = store_dir.join(CURRENT_FILE);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = fs::read_to_string(&pointer)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::StoreCorrupted))?;
        let manifest_path = store_dir.join(name.trim());
        let raw = fs::read_to_string(&manifest_path)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::StoreCorrupted))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::StoreCorrupted))?;
        Ok(Some((manifest, manifest_path)))
    }

    /// Atomic publish: the manifest body and the `CURRENT` pointer are both
    /// written to temporaries and renamed into place, so a reader sees
    /// either the previous snapshot or this one in full.
    pub fn publish(&self, store_dir: &Path) -> GroundEffectResult<()> {
        let name = Self::file_name(self.version);
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
        write_atomically(&store_dir.join(&name), &body)?;
        write_atomically(&store_dir.join(CURRENT_FILE), name.as_bytes())?;
        Ok(())
    }
}

pub fn write_atomically(target: &Path, bytes: &[u8]) -> GroundEffectResult<()> {
    let tmp = target.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    let file = fs::File::open(&tmp)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    file.sync_all()
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    fs::rename(&tmp, target)
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;
    Ok(())
}

/// Removes manifests and fragments no longer referenced by the current
/// snapshot, sparing anything younger than the grace window so lagging
/// readers keep their files.
pub fn collect_garbage(store_dir: &Path, grace: std::time::Duration) -> GroundEffectResult<usize> {
    let Some((manifest, current_path)) = Manifest::load_current(store_dir)? else {
        return Ok(0);
    };
    let mut live: ahash::AHashSet<PathBuf> = manifest
        .mail_fragments
        .iter()
        .chain(manifest.calendar_fragments.iter())
        .chain(manifest.account_fragments.iter())
        .map(|f| store_dir.join(FRAGMENT_DIR).join(f))
        .collect();
    live.insert(current_path);

    let mut removed = 0;
    let patterns = [
        format!("{}/{MANIFEST_PREFIX}-*.json", store_dir.display()),
        format!("{}/{FRAGMENT_DIR}/*.frag", store_dir.display()),
    ];
    for pattern in patterns {
        for entry in glob::glob(&pattern)
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?
            .flatten()
        {
            if live.contains(&entry) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime.elapsed().unwrap_or_default() >= grace)
                .unwrap_or(false);
            if old_enough && fs::remove_file(&entry).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Exclusive writer lock: a lock file created with `create_new`, holding the
/// owner pid. Acquiring it is the daemon's first action; releasing it the
/// last.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(store_dir: &Path) -> GroundEffectResult<Self> {
        let path = store_dir.join("writer.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                let holder_pid: Option<u32> = holder.trim().parse().ok();
                if let Some(pid) = holder_pid {
                    if !process_alive(pid) {
                        fs::remove_file(&path).map_err(|e| {
                            raise_error!(format!("{e}"), ErrorCode::WriterLockHeld)
                        })?;
                        return Self::acquire(store_dir);
                    }
                }
                Err(raise_error!(
                    format!(
                        "store writer lock at {} is held by pid {}",
                        path.display(),
                        holder.trim()
                    ),
                    ErrorCode::WriterLockHeld
                ))
            }
            Err(e) => Err(raise_error!(format!("{e}"), ErrorCode::InternalError)),
        }
    }

    pub fn release(self) {
        // Drop handles the removal.
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe the lock is honoured as-is.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn publish_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load_current(dir.path()).unwrap().is_none());

        let manifest = Manifest {
            version: 1,
            committed_at: 42,
            mail_fragments: vec!["mail-000001.frag".into()],
            ..Default::default()
        };
        manifest.publish(dir.path()).unwrap();

        let (loaded, _) = Manifest::load_current(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.mail_fragments, vec!["mail-000001.frag"]);
    }

    #[test]
    fn newer_manifest_supersedes_older() {
        let dir = TempDir::new().unwrap();
        Manifest {
            version: 1,
            ..Default::default()
        }
        .publish(dir.path())
        .unwrap();
        Manifest {
            version: 2,
            ..Default::default()
        }
        .publish(dir.path())
        .unwrap();
        let (loaded, _) = Manifest::load_current(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _lock = WriterLock::acquire(dir.path()).unwrap();
        let second = WriterLock::acquire(dir.path());
        assert!(second.is_err());
        let err = second.unwrap_err();
        assert_eq!(err.code(), crate::modules::error::code::ErrorCode::WriterLockHeld);
        assert!(err.message().contains(&std::process::id().to_string()));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = WriterLock::acquire(dir.path()).unwrap();
        }
        let _second = WriterLock::acquire(dir.path()).unwrap();
    }
}
