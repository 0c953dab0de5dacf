//! Manifest snapshots.
//!
//! Before the first mutation of a run the manifest is copied next to itself
//! as `<manifest>.bak.<YYYYmmdd-HHMMSS>`. Snapshots are never cleaned up
//! automatically; `restore` copies one back over the manifest.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::errors::BackupError;
use crate::models::BackupRecord;
use crate::project::Project;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const MAX_COLLISIONS: u32 = 1000;

/// Creates, lists and restores manifest snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupManager;

impl BackupManager {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot the project manifest and verify the copy's digest.
    #[instrument(skip(self, project), fields(manifest = %project.manifest_path.display()))]
    pub fn create(&self, project: &Project) -> Result<BackupRecord, BackupError> {
        self.create_at(project, Utc::now())
    }

    pub(crate) fn create_at(&self, project: &Project, now: DateTime<Utc>) -> Result<BackupRecord, BackupError> {
        // Second precision, matching what `list_backups` recovers from the name.
        let now = now.trunc_subsecs(0);
        let manifest = &project.manifest_path;
        let contents = std::fs::read(manifest).map_err(|e| failed(manifest, format!("cannot read manifest: {}", e)))?;
        let expected = sha256_hex(&contents);

        let base = format!("{}.bak.{}", file_name(manifest), now.format(STAMP_FORMAT));
        let backup_path = write_new(manifest, &base, &contents)?;

        let written = std::fs::read(&backup_path)
            .map_err(|e| failed(manifest, format!("cannot re-read {}: {}", backup_path.display(), e)))?;
        let actual = sha256_hex(&written);
        if actual != expected {
            return Err(failed(
                manifest,
                format!("digest mismatch for {}: expected {}, got {}", backup_path.display(), expected, actual),
            ));
        }

        info!(backup = %backup_path.display(), sha256 = %expected, "manifest backed up");
        Ok(BackupRecord {
            backup_path,
            timestamp: now,
            original_path: manifest.clone(),
            sha256: expected,
        })
    }

    /// Existing snapshots of the project manifest, newest first.
    pub fn list_backups(&self, project: &Project) -> Result<Vec<BackupRecord>, BackupError> {
        let manifest = &project.manifest_path;
        let dir = manifest.parent().unwrap_or(&project.root);
        let prefix = format!("{}.bak.", file_name(manifest));

        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(timestamp) = parse_stamp(suffix) else {
                debug!(file = %name, "ignoring file with unparseable backup stamp");
                continue;
            };
            let contents = std::fs::read(entry.path())?;
            records.push(BackupRecord {
                backup_path: entry.path(),
                timestamp,
                original_path: manifest.clone(),
                sha256: sha256_hex(&contents),
            });
        }

        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.backup_path.cmp(&a.backup_path))
        });
        Ok(records)
    }

    /// Copy a snapshot back over its original manifest.
    #[instrument(skip(self, record), fields(backup = %record.backup_path.display()))]
    pub fn restore(&self, record: &BackupRecord) -> Result<(), BackupError> {
        if !record.backup_path.is_file() {
            return Err(BackupError::NotFound(record.backup_path.clone()));
        }
        let contents = std::fs::read(&record.backup_path)?;
        let digest = sha256_hex(&contents);
        if digest != record.sha256 {
            warn!(expected = %record.sha256, actual = %digest, "snapshot changed since it was recorded");
        }
        std::fs::write(&record.original_path, &contents)?;
        info!(manifest = %record.original_path.display(), "manifest restored");
        Ok(())
    }

    /// Restore the newest snapshot, if any.
    pub fn restore_latest(&self, project: &Project) -> Result<BackupRecord, BackupError> {
        let latest = self
            .list_backups(project)?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NotFound(project.manifest_path.with_extension("bak")))?;
        self.restore(&latest)?;
        Ok(latest)
    }

    /// Record for an arbitrary snapshot file, used by `restore <PATH>`.
    pub fn record_for(&self, project: &Project, backup_path: &Path) -> Result<BackupRecord, BackupError> {
        if !backup_path.is_file() {
            return Err(BackupError::NotFound(backup_path.to_path_buf()));
        }
        let contents = std::fs::read(backup_path)?;
        let timestamp = backup_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.rsplit_once(".bak.").map(|(_, s)| s.to_string()))
            .and_then(|s| parse_stamp(&s))
            .unwrap_or_else(Utc::now);
        Ok(BackupRecord {
            backup_path: backup_path.to_path_buf(),
            timestamp,
            original_path: project.manifest_path.clone(),
            sha256: sha256_hex(&contents),
        })
    }
}

/// Write `contents` to a fresh file named `base` (or `base.N` on collision)
/// beside `manifest`.
fn write_new(manifest: &Path, base: &str, contents: &[u8]) -> Result<PathBuf, BackupError> {
    let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
    for n in 0..MAX_COLLISIONS {
        let name = if n == 0 { base.to_string() } else { format!("{}.{}", base, n) };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| failed(manifest, format!("cannot write {}: {}", path.display(), e)))?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(failed(manifest, format!("cannot create {}: {}", path.display(), e))),
        }
    }
    Err(failed(manifest, format!("too many backups named {}", base)))
}

/// Parse `YYYYmmdd-HHMMSS` with an optional `.N` collision suffix.
fn parse_stamp(suffix: &str) -> Option<DateTime<Utc>> {
    let stamp = suffix.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn failed(path: &Path, detail: String) -> BackupError {
    BackupError::BackupFailed {
        path: path.to_path_buf(),
        detail,
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn project_with(manifest: &str) -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pubspec.yaml"), manifest).unwrap();
        let project = Project::at(dir.path(), &Default::default());
        (dir, project)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_create_names_and_verifies() {
        let (_dir, project) = project_with("name: app\n");
        let record = BackupManager.create_at(&project, at(10, 20, 30)).unwrap();

        assert!(record.backup_path.ends_with("pubspec.yaml.bak.20260301-102030"));
        assert_eq!(std::fs::read_to_string(&record.backup_path).unwrap(), "name: app\n");
        assert_eq!(record.sha256, sha256_hex(b"name: app\n"));
        assert_eq!(record.original_path, project.manifest_path);
    }

    #[test]
    fn test_collision_gets_suffix() {
        let (_dir, project) = project_with("name: app\n");
        let first = BackupManager.create_at(&project, at(10, 0, 0)).unwrap();
        let second = BackupManager.create_at(&project, at(10, 0, 0)).unwrap();
        assert_ne!(first.backup_path, second.backup_path);
        assert!(second.backup_path.to_string_lossy().ends_with(".bak.20260301-100000.1"));
    }

    #[test]
    fn test_missing_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::at(dir.path(), &Default::default());
        let err = BackupManager.create(&project).unwrap_err();
        assert!(matches!(err, BackupError::BackupFailed { .. }));
    }

    #[test]
    fn test_list_newest_first_and_restore() {
        let (_dir, project) = project_with("name: app\nversion: 1\n");
        BackupManager.create_at(&project, at(9, 0, 0)).unwrap();
        std::fs::write(&project.manifest_path, "name: app\nversion: 2\n").unwrap();
        BackupManager.create_at(&project, at(11, 0, 0)).unwrap();
        std::fs::write(project.root.join("pubspec.yaml.bak.garbage"), "x").unwrap();

        let list = BackupManager.list_backups(&project).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].timestamp, at(11, 0, 0));
        assert_eq!(list[1].timestamp, at(9, 0, 0));

        std::fs::write(&project.manifest_path, "broken").unwrap();
        BackupManager.restore(&list[1]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&project.manifest_path).unwrap(),
            "name: app\nversion: 1\n"
        );

        let latest = BackupManager.restore_latest(&project).unwrap();
        assert_eq!(latest.timestamp, at(11, 0, 0));
        assert_eq!(
            std::fs::read_to_string(&project.manifest_path).unwrap(),
            "name: app\nversion: 2\n"
        );
    }

    #[test]
    fn test_restore_missing_snapshot() {
        let (_dir, project) = project_with("name: app\n");
        let err = BackupManager
            .record_for(&project, &project.root.join("pubspec.yaml.bak.20200101-000000"))
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
        assert!(matches!(BackupManager.restore_latest(&project), Err(BackupError::NotFound(_))));
    }
}
