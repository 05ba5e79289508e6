// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Crash-recovery sweep (§4.D, scenario S5): on startup, every recording row
//! still `is_complete=false` means the process died mid-write. Its file is
//! either salvageable (non-empty, just missing its moov finalization record)
//! or not; either way the row must be resolved before normal operation
//! resumes, since the storage controller and API both assume completed
//! recordings have an accurate `size_bytes`/`end_time`.

use super::SampleFileDir;
use crate::store::Database;
use base::clock::Clocks;
use base::Error;
use std::path::Path;
use tracing::{info, warn};

pub struct RecoveryReport {
    pub recovered: usize,
    pub deleted: usize,
    pub marked_corrupt: usize,
}

/// Walks every incomplete recording and resolves it:
///
/// * file missing or zero bytes: the recording never produced usable media,
///   delete the row.
/// * file present and non-empty: best-effort finalize using the file's
///   current size and mtime, flagged `corrupt` since its trailing GOP may be
///   truncated (no proper remux is attempted here; that's `segment_writer`'s
///   job during normal operation, not startup recovery).
pub fn recover_incomplete<C: Clocks>(
    dir: &SampleFileDir,
    db: &Database<C>,
) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport {
        recovered: 0,
        deleted: 0,
        marked_corrupt: 0,
    };
    for rec in db.list_incomplete_recordings()? {
        let path = Path::new(&rec.file_path);
        match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(recording_id = rec.id, path = %rec.file_path, "incomplete recording missing on disk, dropping row");
                db.delete_recording(rec.id)?;
                report.deleted += 1;
            }
            Err(e) => return Err(e.into()),
            Ok(m) if m.len() == 0 => {
                warn!(recording_id = rec.id, path = %rec.file_path, "incomplete recording is zero bytes, dropping row and file");
                dir.unlink_recording(path)?;
                db.delete_recording(rec.id)?;
                report.deleted += 1;
            }
            Ok(m) => {
                let end_time = m
                    .modified()
                    .ok()
                    .and_then(|t| jiff::Timestamp::try_from(t).ok())
                    .unwrap_or_else(jiff::Timestamp::now)
                    .to_string();
                info!(recording_id = rec.id, size_bytes = m.len(), "recovering incomplete recording as corrupt");
                db.mark_recovered(rec.id, &end_time, m.len() as i64, true)?;
                report.recovered += 1;
                report.marked_corrupt += 1;
            }
        }
    }
    Ok(report)
}
