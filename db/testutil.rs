// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared test fixtures for the `db` crate and its downstream consumers.

use crate::model::{BufferStrategy, Protocol, Stream};
use crate::store::Database;
use base::clock::SimulatedClocks;

/// An in-memory, fully migrated database backed by a simulated clock fixed
/// at an arbitrary instant, for tests that don't care about wall-clock time.
pub fn test_db() -> Database<SimulatedClocks> {
    let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
    Database::open_in_memory(clocks).expect("in-memory database should open")
}

/// A minimal, valid `Stream` row for tests that just need *a* stream to hang
/// recordings/detections off of.
pub fn sample_stream(name: &str) -> Stream {
    Stream {
        id: 0,
        name: name.to_string(),
        source_url: format!("rtsp://example.invalid/{name}"),
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
