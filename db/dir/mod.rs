// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Sample file directory management (§4.D, §4.G).
//!
//! The storage root holds one subdirectory per stream, each bucketed by
//! `YYYY/MM/DD`. This module opens and `fsync`s those directories, computes
//! a recording's on-disk path, and reports free-space statistics for the
//! storage controller's disk-pressure heartbeat.

pub mod scan;

use base::{err, Error};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// An open directory file descriptor, closed on drop.
///
/// Holding the fd (rather than re-opening by path on every `fsync`) means a
/// rename or unlink race outside our control can't redirect us to the wrong
/// directory.
#[derive(Debug)]
pub struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.0);
    }
}

impl Fd {
    pub fn open(path: &Path, mkdir: bool) -> Result<Fd, Error> {
        if mkdir {
            match std::fs::create_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        let fd = nix::fcntl::open(
            path,
            nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|e| err!(Internal, msg("open directory {}", path.display()), source(e)))?;
        Ok(Fd(fd))
    }

    /// Locks the directory with the specified `flock` operation, so only one
    /// process at a time touches a given storage root or db dir.
    pub fn lock(&self, arg: nix::fcntl::FlockArg) -> Result<(), Error> {
        nix::fcntl::flock(self.0, arg)
            .map_err(|e| err!(Internal, msg("flock"), source(e)))
    }

    /// Commits all file creations/renames/deletions within this directory to
    /// durable storage (§4.D: a recording isn't considered durable until its
    /// directory entry is synced, not just its data).
    pub fn sync(&self) -> Result<(), Error> {
        nix::unistd::fsync(self.0)
            .map_err(|e| err!(Internal, msg("fsync directory"), source(e)))
    }
}

/// One storage root: typically one per physical disk, holding every stream's
/// recordings in `<root>/<stream>/YYYY/MM/DD/`.
#[derive(Debug)]
pub struct SampleFileDir {
    root: PathBuf,
    fd: Fd,
}

impl SampleFileDir {
    pub fn open(root: &Path) -> Result<Self, Error> {
        let fd = Fd::open(root, true)?;
        Ok(SampleFileDir {
            root: root.to_path_buf(),
            fd,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The literal on-disk path for a new recording (§4.D naming contract):
    /// `<root>/<stream>/YYYY/MM/DD/YYYYMMDD_HHMMSS_<trigger>.mp4`.
    pub fn recording_path(
        &self,
        stream_name: &str,
        start: &jiff::Zoned,
        trigger: &str,
    ) -> PathBuf {
        self.root
            .join(stream_name)
            .join(format!("{:04}", start.year()))
            .join(format!("{:02}", start.month()))
            .join(format!("{:02}", start.day()))
            .join(format!(
                "{:04}{:02}{:02}_{:02}{:02}{:02}_{}.mp4",
                start.year(),
                start.month(),
                start.day(),
                start.hour(),
                start.minute(),
                start.second(),
                trigger,
            ))
    }

    /// Creates every ancestor directory of `path` (within the storage root)
    /// that doesn't already exist, and syncs each newly created one along
    /// with its parent so the directory tree survives a crash (§4.D).
    pub fn ensure_parent_dirs(&self, path: &Path) -> Result<(), Error> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let mut cur = self.root.clone();
        for component in rel
            .parent()
            .into_iter()
            .flat_map(|p| p.components())
        {
            cur.push(component);
            match std::fs::create_dir(&cur) {
                Ok(()) => {
                    let fd = Fd::open(&cur, false)?;
                    fd.sync()?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.fd.sync()
    }

    /// `statvfs`-based free-space percentage, for disk-pressure classification
    /// (`DiskPressure::classify`, §4.G).
    pub fn free_space_pct(&self) -> Result<f64, Error> {
        let stat = nix::sys::statvfs::fstatvfs(&self.fd)
            .map_err(|e| err!(Internal, msg("statvfs"), source(e)))?;
        let total = stat.blocks() as f64;
        if total == 0.0 {
            return Ok(100.0);
        }
        let free = stat.blocks_available() as f64;
        Ok(free / total * 100.0)
    }

    /// Total bytes free, for absolute-threshold checks alongside the percentage.
    pub fn free_bytes(&self) -> Result<u64, Error> {
        let stat = nix::sys::statvfs::fstatvfs(&self.fd)
            .map_err(|e| err!(Internal, msg("statvfs"), source(e)))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    /// Removes a recording's file from disk. Missing files are not an error
    /// (a prior crash may have left the db row without a file, or vice versa).
    pub fn unlink_recording(&self, path: &Path) -> Result<(), Error> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_path_matches_naming_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SampleFileDir::open(tmp.path()).unwrap();
        let tz = jiff::tz::TimeZone::fixed(jiff::tz::Offset::from_seconds(0).unwrap());
        let start = jiff::civil::date(2026, 3, 7)
            .at(13, 5, 9, 0)
            .to_zoned(tz)
            .unwrap();
        let path = dir.recording_path("front_door", &start, "motion");
        assert_eq!(
            path,
            tmp.path()
                .join("front_door")
                .join("2026")
                .join("03")
                .join("07")
                .join("20260307_130509_motion.mp4")
        );
    }

    #[test]
    fn ensure_parent_dirs_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SampleFileDir::open(tmp.path()).unwrap();
        let path = dir.root().join("cam1").join("2026").join("03").join("07").join("x.mp4");
        dir.ensure_parent_dirs(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn free_space_pct_is_in_range() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SampleFileDir::open(tmp.path()).unwrap();
        let pct = dir.free_space_pct().unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn unlink_missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SampleFileDir::open(tmp.path()).unwrap();
        dir.unlink_recording(&tmp.path().join("nope.mp4")).unwrap();
    }
}
