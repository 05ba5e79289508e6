// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Offline integrity sweep (§12 supplemented `check` subcommand).
//!
//! Unlike `dir::scan::recover_incomplete`, which runs automatically against
//! a hot database on startup, this is a manual, read-mostly pass meant to be
//! run against a stopped instance: SQLite's own consistency check, the
//! applied schema version, and a walk comparing `recordings` rows against
//! the sample file directory in both directions.

use crate::dir::SampleFileDir;
use crate::model::{RecordingSortField, SortDir};
use crate::schema;
use crate::store::Database;
use base::clock::Clocks;
use base::Error;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{error, info, warn};

pub struct Options {
    /// Trash sample files with no matching `recordings` row.
    pub trash_orphan_sample_files: bool,
    /// Delete `recordings` rows whose file is missing on disk.
    pub delete_orphan_rows: bool,
}

#[derive(Default, Debug)]
pub struct Report {
    pub integrity_errors: Vec<String>,
    pub schema_version_mismatch: Option<String>,
    pub orphan_files: Vec<PathBuf>,
    pub orphan_rows: Vec<i64>,
    pub trashed_files: usize,
    pub deleted_rows: usize,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.integrity_errors.is_empty()
            && self.schema_version_mismatch.is_none()
            && self.orphan_files.is_empty()
            && self.orphan_rows.is_empty()
    }
}

pub fn run<C: Clocks>(db: &Database<C>, dir: &SampleFileDir, opts: &Options) -> Result<Report, Error> {
    let mut report = Report::default();

    info!("checking SQLite integrity...");
    report.integrity_errors = db.integrity_check()?;
    for e in &report.integrity_errors {
        error!(err = %e, "sqlite integrity error");
    }

    let expected = schema::embedded_migrations()
        .last()
        .map(|m| m.version.to_string());
    let actual = db.schema_version()?;
    if actual != expected {
        warn!(?actual, ?expected, "schema version mismatch");
        report.schema_version_mismatch = actual.or_else(|| Some("<none>".to_string()));
    } else {
        info!(version = ?actual, "schema at expected version");
    }

    // Walk recordings rows, checking each file exists.
    let mut known_paths: HashSet<PathBuf> = HashSet::new();
    let mut offset = 0i64;
    loop {
        let page = db.list_recordings_page(None, RecordingSortField::StartTime, SortDir::Asc, 500, offset)?;
        for rec in &page.items {
            let path = PathBuf::from(&rec.file_path);
            known_paths.insert(path.clone());
            if rec.is_complete && !path.exists() {
                warn!(recording_id = rec.id, path = %rec.file_path, "recording row missing its file");
                report.orphan_rows.push(rec.id);
            }
        }
        offset += page.items.len() as i64;
        if !page.has_more {
            break;
        }
    }
    if opts.delete_orphan_rows {
        for id in &report.orphan_rows {
            db.delete_recording(*id)?;
            report.deleted_rows += 1;
        }
    }

    // Walk the sample file tree, checking every file has a row.
    for entry in walk_files(dir.root())? {
        if !known_paths.contains(&entry) {
            warn!(path = %entry.display(), "sample file has no matching recording row");
            report.orphan_files.push(entry);
        }
    }
    if opts.trash_orphan_sample_files {
        for path in &report.orphan_files {
            match dir.unlink_recording(path) {
                Ok(()) => report.trashed_files += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to trash orphan file"),
            }
        }
    }

    if report.is_clean() {
        info!("check passed: no issues found");
    }
    Ok(report)
}

fn walk_files(root: &std::path::Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_stream, test_db};

    #[test]
    fn clean_database_and_empty_dir_report_no_issues() {
        let db = test_db();
        let dir = SampleFileDir::open(tempfile::tempdir().unwrap().path()).unwrap();
        let report = run(&db, &dir, &Options { trash_orphan_sample_files: false, delete_orphan_rows: false }).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn orphan_row_detected_when_file_missing() {
        let db = test_db();
        db.insert_stream(&sample_stream("front_door")).unwrap();
        let dir = SampleFileDir::open(tempfile::tempdir().unwrap().path()).unwrap();
        let id = db
            .insert_recording(
                "front_door",
                "/tmp/definitely-does-not-exist-vigil-check-test.mp4",
                "2024-01-01T00:00:00+00:00",
                crate::model::TriggerType::Manual,
            )
            .unwrap();
        db.finalize_recording(id, "2024-01-01T00:01:00+00:00", 1024, 640, 480, 30.0, "h264")
            .unwrap();

        let report = run(&db, &dir, &Options { trash_orphan_sample_files: false, delete_orphan_rows: false }).unwrap();
        assert_eq!(report.orphan_rows, vec![id]);
        assert_eq!(report.deleted_rows, 0);

        let report = run(&db, &dir, &Options { trash_orphan_sample_files: false, delete_orphan_rows: true }).unwrap();
        assert_eq!(report.deleted_rows, 1);
        assert!(db.get_recording(id).is_err());
    }

    #[test]
    fn orphan_file_detected_and_trashed() {
        let db = test_db();
        let tmp = tempfile::tempdir().unwrap();
        let dir = SampleFileDir::open(tmp.path()).unwrap();
        let stray = tmp.path().join("stray.mp4");
        std::fs::write(&stray, b"not tracked").unwrap();

        let report = run(&db, &dir, &Options { trash_orphan_sample_files: false, delete_orphan_rows: false }).unwrap();
        assert_eq!(report.orphan_files, vec![stray.clone()]);

        let report = run(&db, &dir, &Options { trash_orphan_sample_files: true, delete_orphan_rows: false }).unwrap();
        assert_eq!(report.trashed_files, 1);
        assert!(!stray.exists());
    }
}
