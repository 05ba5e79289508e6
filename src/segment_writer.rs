// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Segment writer (§4.D): owns one open MP4 file per `(stream,
//! trigger_type)` recording session, rotates on duration/size at keyframe
//! boundaries, and keeps the metadata store's `recordings` row in sync.

use crate::mp4writer::{Mp4Writer, Sample, TrackParams};
use base::clock::Clocks;
use base::{bail, Error};
use db::dir::SampleFileDir;
use db::model::TriggerType;
use db::ring::Packet;
use db::store::Database;
use std::fs::BufWriter;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

/// How often `(size_bytes, end_time)` is persisted for an open recording.
const PROGRESS_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Ceiling that forces a rotation even before `segment_duration` elapses, so
/// a misbehaving high-bitrate stream can't grow one file unboundedly.
const FILE_SIZE_CEILING_BYTES: u64 = 1 << 30;

pub struct OpenSegment {
    recording_id: i64,
    writer: Mp4Writer<BufWriter<std::fs::File>>,
    path: std::path::PathBuf,
    start_pts: base::time::Time,
    last_progress_write: std::time::Instant,
    width: u16,
    height: u16,
}

/// Drives one recording session's file lifecycle. One `SegmentWriter` per
/// active `(stream, trigger_type)` session; the recording controller (§4.E)
/// creates and drops these as it moves through its state machine.
pub struct SegmentWriter<C: Clocks> {
    stream_name: String,
    segment_duration_secs: i64,
    dir: Arc<SampleFileDir>,
    db: Arc<Database<C>>,
    open: Option<OpenSegment>,
}

impl<C: Clocks> SegmentWriter<C> {
    pub fn new(stream_name: String, segment_duration_secs: i64, dir: Arc<SampleFileDir>, db: Arc<Database<C>>) -> Self {
        SegmentWriter {
            stream_name,
            segment_duration_secs,
            dir,
            db,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The `recordings` row id backing the currently open session, if any.
    /// Used by the recording controller to upgrade `trigger_type` in place
    /// when an overlapping trigger arrives (§8.6 overlap rule) without the
    /// controller needing its own handle into the open segment.
    pub fn open_recording_id(&self) -> Option<i64> {
        self.open.as_ref().map(|seg| seg.recording_id)
    }

    /// Opens a new file for `trigger`, optionally splicing `prepend` packets
    /// (the ring buffer's pre-event snapshot, §4.B) ahead of live packets.
    /// The first packet written -- prepended if present, else the first
    /// live one -- must be a keyframe; `NotDecodable` otherwise so the
    /// recording controller can fall back to starting at the next live
    /// keyframe (§4.D pre-roll splice).
    pub fn open(
        &mut self,
        trigger: TriggerType,
        params: &TrackParams,
        prepend: &[Packet],
    ) -> Result<(), Error> {
        if self.open.is_some() {
            bail!(FailedPrecondition, msg("segment writer already has an open file"));
        }
        let first = prepend.first();
        if let Some(p) = first {
            if !p.is_key {
                bail!(FailedPrecondition, msg("NotDecodable: first prepended packet is not a keyframe"));
            }
        }
        let now = self.db.clocks().realtime();
        let zoned = jiff::Zoned::new(now, base::time::global_zone());
        let path = self.dir.recording_path(&self.stream_name, &zoned, trigger.as_str());
        self.dir.ensure_parent_dirs(&path)?;

        let mut writer = Mp4Writer::create(&path, params)?;
        let start_time = jiff::Zoned::new(now, base::time::global_zone())
            .strftime("%FT%T%:z")
            .to_string();
        let recording_id = self
            .db
            .insert_recording(&self.stream_name, &path.to_string_lossy(), &start_time, trigger)?;

        let mut start_pts = None;
        for packet in prepend {
            if start_pts.is_none() {
                start_pts = Some(packet.pts);
            }
            let rel = (packet.pts.0 - start_pts.unwrap().0).max(0) as u64;
            writer.write_sample(rel, &Sample {
                data: packet.data.as_ref().clone(),
                duration: 0,
                is_sync: packet.is_key,
            })?;
        }

        self.open = Some(OpenSegment {
            recording_id,
            writer,
            path,
            start_pts: start_pts.unwrap_or(base::time::Time(0)),
            last_progress_write: std::time::Instant::now(),
            width: params.width,
            height: params.height,
        });
        debug!(stream = %self.stream_name, recording_id, "opened recording file");
        Ok(())
    }

    /// Appends a live packet. Returns `true` if a rotation boundary was
    /// reached and the caller should reopen on the *next* keyframe (rotation
    /// never drops the inter-frames in between; the controller buffers them
    /// until the boundary keyframe arrives).
    pub fn write_packet(&mut self, packet: &Packet) -> Result<bool, Error> {
        let Some(seg) = self.open.as_mut() else {
            bail!(FailedPrecondition, msg("no open segment"));
        };
        let rel = (packet.pts.0 - seg.start_pts.0).max(0) as u64;
        seg.writer.write_sample(rel, &Sample {
            data: packet.data.as_ref().clone(),
            duration: 0,
            is_sync: packet.is_key,
        })?;

        if seg.last_progress_write.elapsed() >= PROGRESS_INTERVAL {
            self.flush_progress()?;
        }

        let seg = self.open.as_ref().unwrap();
        let elapsed_secs = (packet.pts.0 - seg.start_pts.0) / base::time::TIME_UNITS_PER_SEC;
        let hit_duration = elapsed_secs >= self.segment_duration_secs;
        let hit_size = seg.writer.bytes_written() >= FILE_SIZE_CEILING_BYTES;
        Ok(packet.is_key && (hit_duration || hit_size))
    }

    fn flush_progress(&mut self) -> Result<(), Error> {
        let Some(seg) = self.open.as_mut() else {
            return Ok(());
        };
        seg.last_progress_write = std::time::Instant::now();
        let size_bytes = seg.writer.bytes_written() as i64;
        let end_time = jiff::Zoned::new(self.db.clocks().realtime(), base::time::global_zone())
            .strftime("%FT%T%:z")
            .to_string();
        self.db.update_recording_progress(seg.recording_id, size_bytes, &end_time)
    }

    /// Closes the current file, finalizing the moov/index and the metadata
    /// row. A zero-byte close (no packets ever written) deletes the row and
    /// file rather than leaving a bogus zero-length recording.
    pub fn close(&mut self, fps: f64, codec: &str) -> Result<(), Error> {
        let Some(seg) = self.open.take() else {
            return Ok(());
        };
        let size_bytes = seg.writer.bytes_written();
        if size_bytes == 0 {
            seg.writer.finish()?;
            let _ = std::fs::remove_file(&seg.path);
            self.db.delete_recording(seg.recording_id)?;
            warn!(stream = %self.stream_name, "discarded zero-byte recording");
            return Ok(());
        }
        seg.writer.finish()?;
        let end_time = jiff::Zoned::new(self.db.clocks().realtime(), base::time::global_zone())
            .strftime("%FT%T%:z")
            .to_string();
        self.db.finalize_recording(
            seg.recording_id,
            &end_time,
            size_bytes as i64,
            seg.width as i64,
            seg.height as i64,
            fps,
            codec,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::testutil::test_db;
    use std::sync::Arc;

    fn params() -> TrackParams {
        TrackParams {
            width: 640,
            height: 480,
            timescale: 90_000,
            sequence_parameter_set: vec![0x67],
            picture_parameter_set: vec![0x68],
        }
    }

    fn packet(pts: i64, is_key: bool) -> Packet {
        Packet {
            pts: base::time::Time(pts),
            dts: base::time::Time(pts),
            is_key,
            data: Arc::new(vec![0u8; 32]),
        }
    }

    #[test]
    fn rejects_non_keyframe_prepend() {
        let db = Arc::new(test_db());
        let dir = Arc::new(SampleFileDir::open(tempfile::tempdir().unwrap().path()).unwrap());
        let mut w = SegmentWriter::new("front_door".into(), 60, dir, db);
        let err = w
            .open(TriggerType::Manual, &params(), &[packet(0, false)])
            .unwrap_err();
        assert!(format!("{err}").contains("NotDecodable") || format!("{err:?}").contains("NotDecodable"));
    }

    #[test]
    fn rotates_at_keyframe_once_duration_elapsed() {
        let db = Arc::new(test_db());
        let tmp = tempfile::tempdir().unwrap();
        let dir = Arc::new(SampleFileDir::open(tmp.path()).unwrap());
        let mut w = SegmentWriter::new("front_door".into(), 1, dir, db);
        w.open(TriggerType::Manual, &params(), &[]).unwrap();
        w.write_packet(&packet(0, true)).unwrap();
        let units_per_sec = base::time::TIME_UNITS_PER_SEC;
        let rotate = w.write_packet(&packet(units_per_sec + 1, true)).unwrap();
        assert!(rotate);
        w.close(30.0, "h264").unwrap();
    }

    #[test]
    fn zero_byte_close_deletes_the_row() {
        let db = Arc::new(test_db());
        let tmp = tempfile::tempdir().unwrap();
        let dir = Arc::new(SampleFileDir::open(tmp.path()).unwrap());
        let mut w = SegmentWriter::new("front_door".into(), 60, dir, db.clone());
        w.open(TriggerType::Manual, &params(), &[]).unwrap();
        w.close(30.0, "h264").unwrap();
        assert!(!w.is_open());
    }
}
