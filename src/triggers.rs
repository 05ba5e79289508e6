// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection-consumption and manual-start/stop routing (§4.E "command API
//! on E"): the only paths, besides the continuous/scheduled trigger fired
//! inline from ingest, by which `RecordingController::on_trigger` is ever
//! called with `Trigger::Detection` or `Trigger::Manual`.
//!
//! The object-detection model and the REST layer are both out-of-process
//! collaborators (§1 Non-goals); they interact with this recorder only
//! through the metadata store (`Database::insert_detection`,
//! `request_manual_trigger`/`request_manual_stop` below inserting audit-log
//! `events` rows). `run_router` polls both tables per stream and replays
//! them into the live controller.

use crate::mp4writer::TrackParams;
use crate::recording_controller::{RecordingController, Trigger};
use crate::segment_writer::SegmentWriter;
use crate::shutdown_coordinator::Handle;
use base::clock::Clocks;
use base::Error;
use db::model::Stream;
use db::ring::RingBuffers;
use db::store::Database;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DETECTION_BATCH: i64 = 64;
const EVENT_BATCH: i64 = 16;

const MANUAL_START_KIND: &str = "manual_trigger_request";
const MANUAL_STOP_KIND: &str = "manual_stop_request";

/// Inserts the audit-log row a REST `POST /streams/{name}/record/start`
/// handler would write; `run_router` picks it up on its next poll and opens
/// (or extends) the stream's recording with `trigger_type=manual`.
pub fn request_manual_trigger<C: Clocks>(db: &Database<C>, stream_name: &str) -> Result<i64, Error> {
    db.insert_event(MANUAL_START_KIND, "manual recording start requested", Some(stream_name))
}

/// Inserts the audit-log row a REST `POST /streams/{name}/record/stop`
/// handler would write; `run_router` picks it up on its next poll and closes
/// the stream's recording regardless of schedule or pending post-roll.
pub fn request_manual_stop<C: Clocks>(db: &Database<C>, stream_name: &str) -> Result<i64, Error> {
    db.insert_event(MANUAL_STOP_KIND, "manual recording stop requested", Some(stream_name))
}

/// One poll cycle's cursors, so a restarted router never replays a request
/// already applied (detections/events are append-only and never reordered).
struct Cursors {
    detection_id: i64,
    manual_start_id: i64,
    manual_stop_id: i64,
}

/// Runs until the shutdown coordinator signals this component's tier,
/// polling `stream.name`'s new detections and manual start/stop events into
/// `controller` (§4.E S1 detection pre-roll, S2 manual overlap/override).
pub fn run_router<C: Clocks>(
    handle: Handle,
    stream: Stream,
    db: Arc<Database<C>>,
    controller: Arc<base::Mutex<RecordingController<C>>>,
    writer: Arc<base::Mutex<SegmentWriter<C>>>,
    rings: Arc<RingBuffers>,
    params: TrackParams,
    fps: f64,
    codec: String,
) {
    let mut cursors = Cursors {
        detection_id: 0,
        manual_start_id: 0,
        manual_stop_id: 0,
    };
    loop {
        if handle.wait_for(POLL_INTERVAL) {
            break;
        }
        poll_once(&stream, &db, &controller, &writer, &rings, &params, fps, &codec, &mut cursors);
    }
    handle.report_stopped();
}

#[allow(clippy::too_many_arguments)]
fn poll_once<C: Clocks>(
    stream: &Stream,
    db: &Database<C>,
    controller: &base::Mutex<RecordingController<C>>,
    writer: &base::Mutex<SegmentWriter<C>>,
    rings: &RingBuffers,
    params: &TrackParams,
    fps: f64,
    codec: &str,
    cursors: &mut Cursors,
) {
    if stream.detection_based_recording {
        poll_detections(stream, db, controller, writer, rings, params, cursors);
    }
    poll_manual_start(stream, db, controller, writer, rings, params, cursors);
    poll_manual_stop(stream, db, controller, writer, fps, codec, cursors);
}

fn poll_detections<C: Clocks>(
    stream: &Stream,
    db: &Database<C>,
    controller: &base::Mutex<RecordingController<C>>,
    writer: &base::Mutex<SegmentWriter<C>>,
    rings: &RingBuffers,
    params: &TrackParams,
    cursors: &mut Cursors,
) {
    let detections = match db.list_detections_since(&stream.name, cursors.detection_id, DETECTION_BATCH) {
        Ok(d) => d,
        Err(e) => {
            warn!(stream = %stream.name, error = %e, "failed to poll detections");
            return;
        }
    };
    for d in detections {
        cursors.detection_id = d.id;
        if d.confidence < stream.detection_threshold {
            continue;
        }
        if !stream.detection_object_filter.is_empty()
            && !stream.detection_object_filter.iter().any(|label| *label == d.label)
        {
            continue;
        }
        let opened_recording_id = {
            let mut ctrl = controller.lock();
            let mut w = writer.lock();
            if let Err(e) = ctrl.on_trigger(Trigger::Detection, &mut w, rings, params) {
                warn!(stream = %stream.name, error = %e, "failed to open recording on detection trigger");
                continue;
            }
            w.open_recording_id()
        };
        if let Some(recording_id) = opened_recording_id {
            if let Err(e) = db.link_detection_to_recording(d.id, recording_id) {
                warn!(stream = %stream.name, error = %e, "failed to link detection to recording");
            }
        }
    }
}

fn poll_manual_start<C: Clocks>(
    stream: &Stream,
    db: &Database<C>,
    controller: &base::Mutex<RecordingController<C>>,
    writer: &base::Mutex<SegmentWriter<C>>,
    rings: &RingBuffers,
    params: &TrackParams,
    cursors: &mut Cursors,
) {
    let events = match db.list_events_since(&stream.name, cursors.manual_start_id, MANUAL_START_KIND, EVENT_BATCH) {
        Ok(e) => e,
        Err(e) => {
            warn!(stream = %stream.name, error = %e, "failed to poll manual-start events");
            return;
        }
    };
    for ev in events {
        cursors.manual_start_id = ev.id;
        let mut ctrl = controller.lock();
        let mut w = writer.lock();
        if let Err(e) = ctrl.on_trigger(Trigger::Manual, &mut w, rings, params) {
            warn!(stream = %stream.name, error = %e, "failed to open recording on manual trigger");
        }
    }
}

fn poll_manual_stop<C: Clocks>(
    stream: &Stream,
    db: &Database<C>,
    controller: &base::Mutex<RecordingController<C>>,
    writer: &base::Mutex<SegmentWriter<C>>,
    fps: f64,
    codec: &str,
    cursors: &mut Cursors,
) {
    let events = match db.list_events_since(&stream.name, cursors.manual_stop_id, MANUAL_STOP_KIND, EVENT_BATCH) {
        Ok(e) => e,
        Err(e) => {
            warn!(stream = %stream.name, error = %e, "failed to poll manual-stop events");
            return;
        }
    };
    for ev in events {
        cursors.manual_stop_id = ev.id;
        let mut ctrl = controller.lock();
        let mut w = writer.lock();
        if let Err(e) = ctrl.manual_stop(fps, codec, &mut w) {
            warn!(stream = %stream.name, error = %e, "failed to apply manual stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::dir::SampleFileDir;
    use db::model::{BufferStrategy, Detection, TriggerType};
    use db::testutil::{sample_stream, test_db};

    fn params() -> TrackParams {
        TrackParams {
            width: 640,
            height: 480,
            timescale: 90_000,
            sequence_parameter_set: vec![0x67],
            picture_parameter_set: vec![0x68],
        }
    }

    fn make_stream(name: &str) -> Stream {
        let mut s = sample_stream(name);
        s.detection_based_recording = true;
        s.detection_threshold = 0.5;
        s.detection_object_filter = vec!["person".into()];
        s
    }

    fn make_fixture(
        stream: &Stream,
    ) -> (
        Arc<Database<SimulatedClocks>>,
        Arc<base::Mutex<RecordingController<SimulatedClocks>>>,
        Arc<base::Mutex<SegmentWriter<SimulatedClocks>>>,
        Arc<RingBuffers>,
    ) {
        let clocks = Arc::new(SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap()));
        let db = Arc::new(test_db());
        db.insert_stream(stream).unwrap();
        let dir = Arc::new(SampleFileDir::open(tempfile::tempdir().unwrap().path()).unwrap());
        let writer = Arc::new(base::Mutex::new(SegmentWriter::new(
            stream.name.clone(),
            60,
            dir,
            db.clone(),
        )));
        let rings = Arc::new(RingBuffers::new());
        rings.register(&stream.name, BufferStrategy::Auto);
        let controller = Arc::new(base::Mutex::new(RecordingController::new(
            stream.name.clone(),
            false,
            base::time::ScheduleGrid::always(),
            base::time::Duration(0),
            std::time::Duration::from_secs(2),
            clocks,
            db.clone(),
        )));
        controller.lock().arm();
        (db, controller, writer, rings)
    }

    #[test]
    fn low_confidence_detection_is_ignored() {
        let stream = make_stream("front_door");
        let (db, controller, writer, rings) = make_fixture(&stream);
        let mut cursors = Cursors { detection_id: 0, manual_start_id: 0, manual_stop_id: 0 };
        db.insert_detection(&Detection {
            id: 0,
            stream_name: stream.name.clone(),
            ts: "2024-01-01T00:00:00Z".into(),
            label: "person".into(),
            confidence: 0.2,
            bbox_x: 0.1,
            bbox_y: 0.1,
            bbox_w: 0.2,
            bbox_h: 0.2,
            recording_id: None,
            track_id: None,
            zone_id: None,
        })
        .unwrap();
        poll_detections(&stream, &db, &controller, &writer, &rings, &params(), &mut cursors);
        assert_eq!(controller.lock().state(), crate::recording_controller::ControllerState::Armed);
    }

    #[test]
    fn qualifying_detection_opens_and_links_recording() {
        let stream = make_stream("front_door");
        let (db, controller, writer, rings) = make_fixture(&stream);
        let mut cursors = Cursors { detection_id: 0, manual_start_id: 0, manual_stop_id: 0 };
        let detection_id = db
            .insert_detection(&Detection {
                id: 0,
                stream_name: stream.name.clone(),
                ts: "2024-01-01T00:00:00Z".into(),
                label: "person".into(),
                confidence: 0.82,
                bbox_x: 0.1,
                bbox_y: 0.1,
                bbox_w: 0.2,
                bbox_h: 0.2,
                recording_id: None,
                track_id: None,
                zone_id: None,
            })
            .unwrap();
        poll_detections(&stream, &db, &controller, &writer, &rings, &params(), &mut cursors);
        assert_eq!(controller.lock().state(), crate::recording_controller::ControllerState::Recording);
        let recording_id = writer.lock().open_recording_id().unwrap();
        let rec = db.get_recording(recording_id).unwrap();
        assert_eq!(rec.trigger_type, TriggerType::Detection);
        let linked = db.list_detections_for_recording(recording_id).unwrap();
        assert!(linked.iter().any(|d| d.id == detection_id));
        assert_eq!(cursors.detection_id, detection_id);
    }

    #[test]
    fn manual_request_then_stop_roundtrips_through_events() {
        let stream = make_stream("front_door");
        let (db, controller, writer, rings) = make_fixture(&stream);
        let mut cursors = Cursors { detection_id: 0, manual_start_id: 0, manual_stop_id: 0 };
        request_manual_trigger(&db, &stream.name).unwrap();
        poll_manual_start(&stream, &db, &controller, &writer, &rings, &params(), &mut cursors);
        assert_eq!(controller.lock().state(), crate::recording_controller::ControllerState::Recording);

        request_manual_stop(&db, &stream.name).unwrap();
        poll_manual_stop(&stream, &db, &controller, &writer, 30.0, "h264", &mut cursors);
        assert_eq!(controller.lock().state(), crate::recording_controller::ControllerState::Off);
        assert!(!writer.lock().is_open());
    }
}
