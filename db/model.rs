// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Row types for every entity in the metadata store.
//!
//! Each type's `from_row` reads a `rusqlite::Row` by column name (never by
//! position), since `Database::open` always applies every pending migration
//! before any query runs -- the column set is fixed for the lifetime of the
//! connection.

use base::{bail, err, Error};
use rusqlite::Row;
use std::fmt;

/// Reason a recording session exists. Ordered by priority for the overlap
/// upgrade rule in §4.E: manual > detection > motion > scheduled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TriggerType {
    Scheduled,
    Motion,
    Detection,
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Motion => "motion",
            TriggerType::Detection => "detection",
            TriggerType::Manual => "manual",
        }
    }

    /// Folds a newly observed trigger into the session's current trigger,
    /// keeping the higher-priority of the two (§4.E overlap rule).
    pub fn upgrade(self, incoming: TriggerType) -> TriggerType {
        std::cmp::max(self, incoming)
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "scheduled" => TriggerType::Scheduled,
            "motion" => TriggerType::Motion,
            "detection" => TriggerType::Detection,
            "manual" => TriggerType::Manual,
            _ => bail!(InvalidArgument, msg("unknown trigger_type {s:?}")),
        })
    }
}

/// Retention class modifying a recording's effective retention days (§4.G).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetentionTier {
    Critical,
    Important,
    Ephemeral,
}

impl RetentionTier {
    /// Default multiplier applied to a stream's base retention days.
    pub fn default_multiplier(self) -> f64 {
        match self {
            RetentionTier::Critical => 3.0,
            RetentionTier::Important => 2.0,
            RetentionTier::Ephemeral => 0.25,
        }
    }
}

impl TryFrom<i64> for RetentionTier {
    type Error = Error;

    fn try_from(v: i64) -> Result<Self, Error> {
        Ok(match v {
            1 => RetentionTier::Critical,
            2 => RetentionTier::Important,
            3 => RetentionTier::Ephemeral,
            _ => bail!(InvalidArgument, msg("unknown retention_tier {v}")),
        })
    }
}

impl From<RetentionTier> for i64 {
    fn from(t: RetentionTier) -> i64 {
        match t {
            RetentionTier::Critical => 1,
            RetentionTier::Important => 2,
            RetentionTier::Ephemeral => 3,
        }
    }
}

impl Default for RetentionTier {
    fn default() -> Self {
        RetentionTier::Important
    }
}

/// Classification of filesystem free-space state (§4.G heartbeat tier).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum DiskPressure {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl DiskPressure {
    pub fn classify(free_pct: f64) -> DiskPressure {
        if free_pct < 5.0 {
            DiskPressure::Emergency
        } else if free_pct < 10.0 {
            DiskPressure::Critical
        } else if free_pct < 20.0 {
            DiskPressure::Warning
        } else {
            DiskPressure::Normal
        }
    }
}

/// Pre-event ring buffer strategy (§4.B), selectable per stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferStrategy {
    Auto,
    None,
    Upstream,
    HlsSegment,
    MemoryPacket,
    MmapHybrid,
}

impl BufferStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferStrategy::Auto => "auto",
            BufferStrategy::None => "none",
            BufferStrategy::Upstream => "upstream",
            BufferStrategy::HlsSegment => "hls_segment",
            BufferStrategy::MemoryPacket => "memory_packet",
            BufferStrategy::MmapHybrid => "mmap_hybrid",
        }
    }
}

impl std::str::FromStr for BufferStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => BufferStrategy::Auto,
            "none" => BufferStrategy::None,
            "upstream" => BufferStrategy::Upstream,
            "hls_segment" => BufferStrategy::HlsSegment,
            "memory_packet" => BufferStrategy::MemoryPacket,
            "mmap_hybrid" => BufferStrategy::MmapHybrid,
            _ => bail!(InvalidArgument, msg("unknown buffer_strategy {s:?}")),
        })
    }
}

impl Default for BufferStrategy {
    fn default() -> Self {
        BufferStrategy::Auto
    }
}

/// Transport used to pull RTP from the source (or upstream aggregator).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => bail!(InvalidArgument, msg("unknown protocol {s:?}")),
        })
    }
}

/// A camera/source definition (§3 Stream).
#[derive(Clone, Debug)]
pub struct Stream {
    pub id: i64,
    pub name: String,
    pub source_url: String,
    pub codec_hint: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub priority: i64,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub enabled: bool,
    pub record: bool,
    pub segment_duration_secs: i64,
    pub detection_based_recording: bool,
    pub detection_model_ref: Option<String>,
    pub detection_threshold: f64,
    pub detection_interval_secs: i64,
    pub detection_object_filter: Vec<String>,
    pub pre_detection_buffer_secs: i64,
    pub post_detection_buffer_secs: i64,
    pub buffer_strategy: BufferStrategy,
    pub retention_days: i64,
    pub detection_retention_days: i64,
    pub max_storage_mb: Option<i64>,
    pub tier_multiplier_critical: f64,
    pub tier_multiplier_important: f64,
    pub tier_multiplier_ephemeral: f64,
    pub tags: Vec<String>,
    pub schedule: Option<String>,
    pub onvif_host: Option<String>,
    pub onvif_port: Option<i64>,
    pub onvif_username: Option<String>,
    pub onvif_password: Option<String>,
    pub onvif_profile_token: Option<String>,
    pub onvif_enabled: bool,
    pub backchannel: bool,
    pub storage_priority: i64,
}

impl Stream {
    /// Invariants from §3: name grammar, buffer caps, threshold range, positive multipliers.
    pub fn validate(&self) -> Result<(), Error> {
        if !base::strutil::is_valid_stream_name(&self.name) {
            bail!(
                InvalidArgument,
                msg("stream name {:?} must match [A-Za-z0-9_-]{{1,63}}", self.name)
            );
        }
        if self.pre_detection_buffer_secs + self.post_detection_buffer_secs > 600 {
            bail!(
                InvalidArgument,
                msg("pre+post detection buffer must be <= 600s")
            );
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            bail!(InvalidArgument, msg("detection_threshold must be in [0, 1]"));
        }
        for m in [
            self.tier_multiplier_critical,
            self.tier_multiplier_important,
            self.tier_multiplier_ephemeral,
        ] {
            if m <= 0.0 {
                bail!(InvalidArgument, msg("tier multipliers must be > 0"));
            }
        }
        Ok(())
    }

    /// This stream's configured override for `tier`, falling back to
    /// `RetentionTier::default_multiplier` only at row-construction time
    /// (`tier_multiplier_*` columns default to the same values), so callers
    /// should always read this rather than `RetentionTier::default_multiplier`
    /// directly once a `Stream` row is in hand.
    pub fn tier_multiplier(&self, tier: RetentionTier) -> f64 {
        match tier {
            RetentionTier::Critical => self.tier_multiplier_critical,
            RetentionTier::Important => self.tier_multiplier_important,
            RetentionTier::Ephemeral => self.tier_multiplier_ephemeral,
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let tags_raw: Option<String> = row.get("tags")?;
        let filter_raw: Option<String> = row.get("detection_object_filter")?;
        let protocol_raw: String = row.get("protocol")?;
        let buffer_raw: Option<String> = row.get("buffer_strategy")?;
        Ok(Stream {
            id: row.get("id")?,
            name: row.get("name")?,
            source_url: row.get("source_url")?,
            codec_hint: row.get("codec_hint")?,
            width: row.get("width")?,
            height: row.get("height")?,
            fps: row.get("fps")?,
            priority: row.get("priority")?,
            protocol: protocol_raw.parse().unwrap_or(Protocol::Tcp),
            username: row.get("username")?,
            password: row.get("password")?,
            enabled: row.get("enabled")?,
            record: row.get("record")?,
            segment_duration_secs: row.get("segment_duration_secs")?,
            detection_based_recording: row.get("detection_based_recording")?,
            detection_model_ref: row.get("detection_model_ref")?,
            detection_threshold: row.get("detection_threshold")?,
            detection_interval_secs: row.get("detection_interval_secs")?,
            detection_object_filter: split_csv(filter_raw.as_deref()),
            pre_detection_buffer_secs: row.get("pre_detection_buffer_secs")?,
            post_detection_buffer_secs: row.get("post_detection_buffer_secs")?,
            buffer_strategy: buffer_raw
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            retention_days: row.get("retention_days")?,
            detection_retention_days: row.get("detection_retention_days")?,
            max_storage_mb: row.get("max_storage_mb")?,
            tier_multiplier_critical: row.get("tier_multiplier_critical")?,
            tier_multiplier_important: row.get("tier_multiplier_important")?,
            tier_multiplier_ephemeral: row.get("tier_multiplier_ephemeral")?,
            tags: split_csv(tags_raw.as_deref()),
            schedule: row.get("schedule")?,
            onvif_host: row.get("onvif_host")?,
            onvif_port: row.get("onvif_port")?,
            onvif_username: row.get("onvif_username")?,
            onvif_password: row.get("onvif_password")?,
            onvif_profile_token: row.get("onvif_profile_token")?,
            onvif_enabled: row.get("onvif_enabled")?,
            backchannel: row.get("backchannel")?,
            storage_priority: row.get("storage_priority")?,
        })
    }
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    match raw {
        None => Vec::new(),
        Some(s) if s.is_empty() => Vec::new(),
        Some(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
    }
}

pub fn join_csv(items: &[String]) -> String {
    items.join(",")
}

/// One produced MP4 file (§3 Recording).
#[derive(Clone, Debug)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub size_bytes: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub codec: Option<String>,
    pub is_complete: bool,
    pub trigger_type: TriggerType,
    pub protected: bool,
    pub retention_override_days: Option<i64>,
    pub retention_tier: RetentionTier,
    pub disk_pressure_eligible: bool,
    pub corrupt: bool,
}

impl Recording {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let trigger_raw: String = row.get("trigger_type")?;
        let tier_raw: i64 = row.get("retention_tier")?;
        Ok(Recording {
            id: row.get("id")?,
            stream_name: row.get("stream_name")?,
            file_path: row.get("file_path")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            size_bytes: row.get("size_bytes")?,
            width: row.get("width")?,
            height: row.get("height")?,
            fps: row.get("fps")?,
            codec: row.get("codec")?,
            is_complete: row.get("is_complete")?,
            trigger_type: trigger_raw.parse().unwrap_or(TriggerType::Scheduled),
            protected: row.get("protected")?,
            retention_override_days: row.get("retention_override_days")?,
            retention_tier: RetentionTier::try_from(tier_raw).unwrap_or_default(),
            disk_pressure_eligible: row.get("disk_pressure_eligible")?,
            corrupt: row.get("corrupt")?,
        })
    }
}

/// A detected object event (§3 Detection).
#[derive(Clone, Debug)]
pub struct Detection {
    pub id: i64,
    pub stream_name: String,
    pub ts: String,
    pub label: String,
    pub confidence: f64,
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_w: f64,
    pub bbox_h: f64,
    pub recording_id: Option<i64>,
    pub track_id: Option<String>,
    pub zone_id: Option<i64>,
}

impl Detection {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!(InvalidArgument, msg("detection confidence must be in [0, 1]"));
        }
        for v in [self.bbox_x, self.bbox_y, self.bbox_w, self.bbox_h] {
            if !(0.0..=1.0).contains(&v) {
                bail!(InvalidArgument, msg("detection bbox must be normalized to [0, 1]"));
            }
        }
        Ok(())
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Detection {
            id: row.get("id")?,
            stream_name: row.get("stream_name")?,
            ts: row.get("ts")?,
            label: row.get("label")?,
            confidence: row.get("confidence")?,
            bbox_x: row.get("bbox_x")?,
            bbox_y: row.get("bbox_y")?,
            bbox_w: row.get("bbox_w")?,
            bbox_h: row.get("bbox_h")?,
            recording_id: row.get("recording_id")?,
            track_id: row.get("track_id")?,
            zone_id: row.get("zone_id")?,
        })
    }
}

/// Normalized polygon zone attached to a stream (§3 DetectionZone).
#[derive(Clone, Debug)]
pub struct DetectionZone {
    pub id: i64,
    pub stream_name: String,
    pub points: Vec<(f64, f64)>,
    pub color: Option<String>,
    pub class_filter: Vec<String>,
    pub min_confidence: f64,
}

impl DetectionZone {
    pub const MAX_POINTS: usize = 32;

    pub fn validate(&self) -> Result<(), Error> {
        if self.points.is_empty() || self.points.len() > Self::MAX_POINTS {
            bail!(
                InvalidArgument,
                msg("zone must have 1..={} points", Self::MAX_POINTS)
            );
        }
        for &(x, y) in &self.points {
            if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
                bail!(InvalidArgument, msg("zone points must be normalized to [0, 1]"));
            }
        }
        Ok(())
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let points_json: String = row.get("points_json")?;
        let filter_raw: Option<String> = row.get("class_filter")?;
        let points: Vec<(f64, f64)> = serde_json::from_str(&points_json).unwrap_or_default();
        Ok(DetectionZone {
            id: row.get("id")?,
            stream_name: row.get("stream_name")?,
            points,
            color: row.get("color")?,
            class_filter: split_csv(filter_raw.as_deref()),
            min_confidence: row.get("min_confidence")?,
        })
    }
}

/// Append-only audit-log row (§3 Event).
#[derive(Clone, Debug)]
pub struct Event {
    pub id: i64,
    pub ts: String,
    pub kind: String,
    pub message: String,
    pub stream_name: Option<String>,
}

impl Event {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Event {
            id: row.get("id")?,
            ts: row.get("ts")?,
            kind: row.get("kind")?,
            message: row.get("message")?,
            stream_name: row.get("stream_name")?,
        })
    }
}

/// A recorded, applied schema migration (§3 SchemaMigration).
#[derive(Clone, Debug)]
pub struct SchemaMigration {
    pub version: String,
    pub applied_at: String,
}

/// Per (date, stream, tier) storage rollup written by the deep wake-loop tier.
#[derive(Clone, Debug)]
pub struct DailyStorageStats {
    pub date: String,
    pub stream_name: String,
    pub retention_tier: RetentionTier,
    pub bytes: i64,
    pub recording_count: i64,
}

impl DailyStorageStats {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let tier_raw: i64 = row.get("retention_tier")?;
        Ok(DailyStorageStats {
            date: row.get("date")?,
            stream_name: row.get("stream_name")?,
            retention_tier: RetentionTier::try_from(tier_raw).unwrap_or_default(),
            bytes: row.get("bytes")?,
            recording_count: row.get("recording_count")?,
        })
    }
}

/// Sort field accepted by the paginated recordings list (§4.A).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordingSortField {
    StartTime,
    StreamName,
    SizeBytes,
}

impl RecordingSortField {
    pub fn column(self) -> &'static str {
        match self {
            RecordingSortField::StartTime => "start_time",
            RecordingSortField::StreamName => "stream_name",
            RecordingSortField::SizeBytes => "size_bytes",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_priority_upgrade() {
        assert_eq!(
            TriggerType::Scheduled.upgrade(TriggerType::Detection),
            TriggerType::Detection
        );
        assert_eq!(
            TriggerType::Manual.upgrade(TriggerType::Detection),
            TriggerType::Manual
        );
        assert_eq!(
            TriggerType::Motion.upgrade(TriggerType::Scheduled),
            TriggerType::Motion
        );
    }

    #[test]
    fn disk_pressure_thresholds() {
        assert_eq!(DiskPressure::classify(25.0), DiskPressure::Normal);
        assert_eq!(DiskPressure::classify(15.0), DiskPressure::Warning);
        assert_eq!(DiskPressure::classify(7.0), DiskPressure::Critical);
        assert_eq!(DiskPressure::classify(2.0), DiskPressure::Emergency);
    }

    #[test]
    fn csv_round_trip() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(split_csv(Some(&join_csv(&items))), items);
        assert!(split_csv(None).is_empty());
    }

    #[test]
    fn stream_validate_rejects_oversized_buffer() {
        let mut s = sample_stream();
        s.pre_detection_buffer_secs = 400;
        s.post_detection_buffer_secs = 300;
        s.validate().unwrap_err();
    }

    fn sample_stream() -> Stream {
        Stream {
            id: 1,
            name: "front_door".into(),
            source_url: "rtsp://example/1".into(),
            codec_hint: None,
            width: None,
            height: None,
            fps: None,
            priority: 5,
            protocol: Protocol::Tcp,
            username: None,
            password: None,
            enabled: true,
            record: true,
            segment_duration_secs: 60,
            detection_based_recording: false,
            detection_model_ref: None,
            detection_threshold: 0.5,
            detection_interval_secs: 1,
            detection_object_filter: Vec::new(),
            pre_detection_buffer_secs: 5,
            post_detection_buffer_secs: 10,
            buffer_strategy: BufferStrategy::Auto,
            retention_days: 30,
            detection_retention_days: 30,
            max_storage_mb: None,
            tier_multiplier_critical: 3.0,
            tier_multiplier_important: 2.0,
            tier_multiplier_ephemeral: 0.25,
            tags: Vec::new(),
            schedule: None,
            onvif_host: None,
            onvif_port: None,
            onvif_username: None,
            onvif_password: None,
            onvif_profile_token: None,
            onvif_enabled: false,
            backchannel: false,
            storage_priority: 0,
        }
    }
}
