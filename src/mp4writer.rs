// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Thin wrapper around the `mp4` crate's writer, giving the segment writer
//! (§4.D) a small surface: open a file with a header written immediately
//! (crash safety), append samples, and finalize the `moov`/index on close.
//!
//! The teacher's own `server/src/mp4.rs` serves *existing* recordings over
//! HTTP byte ranges; it has no write path. This module is grounded instead
//! on the real writer API the `mp4` crate (the teacher's `moonfire` branch)
//! exposes for producing new files.

use base::{err, Error};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

/// One H.264/H.265 track's fixed parameters, known from the first keyframe.
pub struct TrackParams {
    pub width: u16,
    pub height: u16,
    pub timescale: u32,
    pub sequence_parameter_set: Vec<u8>,
    pub picture_parameter_set: Vec<u8>,
}

/// A single encoded sample to append to the open track.
pub struct Sample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub is_sync: bool,
}

/// An open MP4 file being written. Exactly one exists per `(stream,
/// trigger_type)` recording session (§4.D); owns the file handle until
/// `finish()` or `abort()` consumes it.
pub struct Mp4Writer<W: Write + Seek> {
    inner: mp4::Mp4Writer<W>,
    track_id: u32,
    bytes_written: u64,
}

impl Mp4Writer<BufWriter<File>> {
    /// Creates (or truncates) the file at `path` and writes the MP4 header
    /// immediately, so a crash mid-recording still leaves a file with a
    /// valid (if short) `ftyp`/`moov` stub for the crash-recovery sweep
    /// (§4.D) to find.
    pub fn create(path: &Path, params: &TrackParams) -> Result<Self, Error> {
        let file = File::create(path)
            .map_err(|e| err!(Internal, msg("creating {}", path.display()), source(e)))?;
        let writer = BufWriter::new(file);
        Self::start(writer, params)
    }
}

impl<W: Write + Seek> Mp4Writer<W> {
    fn start(writer: W, params: &TrackParams) -> Result<Self, Error> {
        let config = mp4::Mp4Config {
            major_brand: str::parse("isom").unwrap(),
            minor_version: 512,
            compatible_brands: vec![
                str::parse("isom").unwrap(),
                str::parse("iso2").unwrap(),
                str::parse("avc1").unwrap(),
                str::parse("mp41").unwrap(),
            ],
            timescale: params.timescale,
        };
        let mut inner = mp4::Mp4Writer::write_start(writer, &config)
            .map_err(|e| err!(Internal, msg("writing mp4 header"), source(e)))?;
        let track_config = mp4::TrackConfig {
            track_type: mp4::TrackType::Video,
            timescale: params.timescale,
            language: "und".to_string(),
            media_conf: mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
                width: params.width,
                height: params.height,
                seq_param_set: params.sequence_parameter_set.clone(),
                pic_param_set: params.picture_parameter_set.clone(),
            }),
        };
        inner
            .add_track(&track_config)
            .map_err(|e| err!(Internal, msg("adding video track"), source(e)))?;
        Ok(Mp4Writer {
            inner,
            track_id: 1,
            bytes_written: 0,
        })
    }

    /// Appends one sample. The very first sample of a session must be a
    /// keyframe (§4.D pre-roll splice invariant); callers are responsible
    /// for enforcing that before the first call.
    pub fn write_sample(&mut self, start_time: u64, sample: &Sample) -> Result<(), Error> {
        let mp4_sample = mp4::Mp4Sample {
            start_time,
            duration: sample.duration,
            rendering_offset: 0,
            is_sync: sample.is_sync,
            bytes: sample.data.clone().into(),
        };
        self.inner
            .write_sample(self.track_id, &mp4_sample)
            .map_err(|e| err!(Internal, msg("writing sample"), source(e)))?;
        self.bytes_written += sample.data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finalizes the moov/index and flushes to disk. Consumes `self`: a
    /// writer can only be finished once.
    pub fn finish(self) -> Result<(), Error> {
        self.inner
            .write_end()
            .map_err(|e| err!(Internal, msg("finalizing mp4"), source(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TrackParams {
        TrackParams {
            width: 1280,
            height: 720,
            timescale: 90_000,
            sequence_parameter_set: vec![0x67, 0x42],
            picture_parameter_set: vec![0x68, 0xce],
        }
    }

    #[test]
    fn create_write_finish_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.mp4");
        let mut w = Mp4Writer::create(&path, &params()).unwrap();
        w.write_sample(
            0,
            &Sample {
                data: vec![0u8; 128],
                duration: 3_000,
                is_sync: true,
            },
        )
        .unwrap();
        w.write_sample(
            3_000,
            &Sample {
                data: vec![0u8; 64],
                duration: 3_000,
                is_sync: false,
            },
        )
        .unwrap();
        assert_eq!(w.bytes_written(), 192);
        w.finish().unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }
}
