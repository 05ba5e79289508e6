// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime bootstrap configuration (`/etc/vigil-nvr.conf` by default).
//!
//! The REST config-management surface is out of scope (spec §1); this is
//! just enough to point the engine at its database, storage roots, and an
//! initial set of streams to import on first run.

use base::{err, Error};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_db_path() -> PathBuf {
    "/var/lib/vigil-nvr/db.sqlite3".into()
}

fn default_storage_root() -> PathBuf {
    "/var/lib/vigil-nvr/storage".into()
}

fn default_hls_root() -> PathBuf {
    "/var/lib/vigil-nvr/hls".into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Path to the embedded SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding on-disk migrations that override/extend the
    /// embedded set (`db/migrations/`), mirroring the teacher's layout.
    #[serde(default)]
    pub migrations_dir: Option<PathBuf>,

    /// Root directory under which `<stream>/YYYY/MM/DD/...` recordings live.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Root directory for HLS playlists and segments.
    #[serde(default = "default_hls_root")]
    pub hls_root: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Streams to insert if the database has none yet (first-run bootstrap
    /// only; subsequent runs leave existing rows alone).
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub record: bool,
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub schedule: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_segment_duration() -> i64 {
    60
}

fn default_retention_days() -> i64 {
    30
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| err!(Internal, msg("reading config {}", path.display()), source(e)))?;
        toml::from_str(&raw)
            .map_err(|e| err!(InvalidArgument, msg("parsing config {}", path.display()), source(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(cfg.db_path, default_db_path());
        assert_eq!(cfg.storage_root, default_storage_root());
        assert!(cfg.streams.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let toml_src = r#"
            dbPath = "/tmp/test.db"
            storageRoot = "/tmp/storage"
            hlsRoot = "/tmp/hls"

            [[streams]]
            name = "front_door"
            sourceUrl = "rtsp://cam.invalid/main"
            retentionDays = 14
        "#;
        let cfg: ConfigFile = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(cfg.streams.len(), 1);
        assert_eq!(cfg.streams[0].name, "front_door");
        assert_eq!(cfg.streams[0].retention_days, 14);
        assert_eq!(cfg.streams[0].segment_duration_secs, 60);
    }
}
