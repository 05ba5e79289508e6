// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! HLS publisher (§4.F): a rolling N-segment `.m3u8` playlist per stream,
//! independent of whether the segment writer (§4.D) is recording. Segments
//! beyond the window are deleted as new ones roll in.

use base::{err, Error};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Default window: 6 segments x 2s target duration = 12s of live latency (§4.F).
pub const DEFAULT_WINDOW: usize = 6;
pub const DEFAULT_SEGMENT_SECS: f64 = 2.0;

struct Segment {
    index: u64,
    path: PathBuf,
    duration_secs: f64,
}

/// One stream's rolling playlist. Segment files are written by the caller
/// (the same muxer code path the segment writer uses, in fragmented form);
/// this type only tracks the window and renders `index.m3u8`.
pub struct HlsPublisher {
    root: PathBuf,
    window: usize,
    next_index: u64,
    segments: VecDeque<Segment>,
}

impl HlsPublisher {
    /// Creates (or clears) `<hls_root>/<stream>/`, per §10.2's "HLS
    /// directories are cleaned on startup".
    pub fn new(hls_root: &Path, stream_name: &str, window: usize) -> Result<Self, Error> {
        let root = hls_root.join(stream_name);
        if root.exists() {
            std::fs::remove_dir_all(&root)
                .map_err(|e| err!(Internal, msg("clearing {}", root.display()), source(e)))?;
        }
        std::fs::create_dir_all(&root)
            .map_err(|e| err!(Internal, msg("creating {}", root.display()), source(e)))?;
        Ok(HlsPublisher {
            root,
            window,
            next_index: 0,
            segments: VecDeque::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a caller should write the next fragmented segment to.
    pub fn next_segment_path(&self) -> PathBuf {
        self.root.join(format!("seg{:010}.m4s", self.next_index))
    }

    /// Registers a just-written segment, evicts old ones beyond the window,
    /// and rewrites the playlist.
    pub fn publish_segment(&mut self, duration_secs: f64) -> Result<(), Error> {
        let path = self.next_segment_path();
        self.segments.push_back(Segment {
            index: self.next_index,
            path,
            duration_secs,
        });
        self.next_index += 1;
        while self.segments.len() > self.window {
            let stale = self.segments.pop_front().unwrap();
            let _ = std::fs::remove_file(&stale.path);
        }
        self.write_playlist()
    }

    fn write_playlist(&self) -> Result<(), Error> {
        let target_duration = self
            .segments
            .iter()
            .map(|s| s.duration_secs.ceil() as u64)
            .max()
            .unwrap_or(DEFAULT_SEGMENT_SECS.ceil() as u64);
        let media_sequence = self.segments.front().map(|s| s.index).unwrap_or(self.next_index);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:7");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
        for seg in &self.segments {
            let _ = writeln!(out, "#EXTINF:{:.3},", seg.duration_secs);
            let _ = writeln!(out, "{}", seg.path.file_name().unwrap().to_string_lossy());
        }

        let tmp = self.root.join("index.m3u8.tmp");
        let dest = self.root.join("index.m3u8");
        std::fs::write(&tmp, out).map_err(|e| err!(Internal, msg("writing playlist"), source(e)))?;
        std::fs::rename(&tmp, &dest).map_err(|e| err!(Internal, msg("renaming playlist"), source(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_stale_segments_and_their_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsPublisher::new(tmp.path(), "front_door", 3).unwrap();
        let mut written = Vec::new();
        for _ in 0..5 {
            let path = hls.next_segment_path();
            std::fs::write(&path, b"fake segment").unwrap();
            written.push(path);
            hls.publish_segment(2.0).unwrap();
        }
        assert_eq!(hls.segments.len(), 3);
        assert!(!written[0].exists());
        assert!(!written[1].exists());
        assert!(written[4].exists());
        let playlist = std::fs::read_to_string(hls.root().join("index.m3u8")).unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert_eq!(playlist.matches("#EXTINF").count(), 3);
    }

    #[test]
    fn startup_clears_previous_directory_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let stream_dir = tmp.path().join("front_door");
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(stream_dir.join("stale.m4s"), b"old").unwrap();
        let hls = HlsPublisher::new(tmp.path(), "front_door", DEFAULT_WINDOW).unwrap();
        assert!(!hls.root().join("stale.m4s").exists());
    }
}
