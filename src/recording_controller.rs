// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Recording controller (§4.E): per-stream state machine that decides
//! whether the segment writer (§4.D) should have a file open, driven by the
//! continuous-enable flag, a schedule grid, and detection/motion/manual
//! triggers. Overlapping triggers extend (never restart) the open session
//! and upgrade its `trigger_type` by priority.

use crate::mp4writer::TrackParams;
use crate::segment_writer::SegmentWriter;
use base::clock::Clocks;
use base::time::ScheduleGrid;
use base::Error;
use db::model::TriggerType;
use db::ring::{Packet, RingBuffers};
use db::store::Database;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Off,
    Armed,
    Buffering,
    Recording,
    PostRoll,
    Finalizing,
}

/// An external request fed into the controller: a live trigger, a manual
/// stop, or just a clock tick so it can re-evaluate the schedule/post-roll
/// timer without new packets.
#[derive(Clone, Copy, Debug)]
pub enum Trigger {
    Scheduled,
    Motion,
    Detection,
    Manual,
}

impl From<Trigger> for TriggerType {
    fn from(t: Trigger) -> Self {
        match t {
            Trigger::Scheduled => TriggerType::Scheduled,
            Trigger::Motion => TriggerType::Motion,
            Trigger::Detection => TriggerType::Detection,
            Trigger::Manual => TriggerType::Manual,
        }
    }
}

/// Per-stream coordinator driving one `SegmentWriter`. Owns the controller's
/// state and the post-roll deadline; does not own the ring buffer or writer
/// (both are passed in so the same `RingBuffers` can be shared with the
/// ingest worker and the same `SegmentWriter` reused across sessions).
pub struct RecordingController<C: Clocks> {
    stream_name: String,
    continuous_enabled: bool,
    schedule: ScheduleGrid,
    pre_roll: base::time::Duration,
    post_roll: StdDuration,
    state: ControllerState,
    post_roll_deadline: Option<std::time::Instant>,
    /// Highest-priority trigger observed during the currently open session
    /// (§4.E overlap rule). `None` while no session is open. A session whose
    /// trigger has been upgraded above `Scheduled` ignores the schedule
    /// turning off (S2) -- it keeps recording until a manual stop closes it.
    session_trigger: Option<TriggerType>,
    clocks: std::sync::Arc<C>,
    db: Arc<Database<C>>,
}

impl<C: Clocks> RecordingController<C> {
    pub fn new(
        stream_name: String,
        continuous_enabled: bool,
        schedule: ScheduleGrid,
        pre_roll: base::time::Duration,
        post_roll: StdDuration,
        clocks: std::sync::Arc<C>,
        db: Arc<Database<C>>,
    ) -> Self {
        RecordingController {
            stream_name,
            continuous_enabled,
            schedule,
            pre_roll,
            post_roll,
            state: ControllerState::Off,
            post_roll_deadline: None,
            session_trigger: None,
            clocks,
            db,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn arm(&mut self) {
        if self.state == ControllerState::Off {
            self.state = ControllerState::Armed;
        }
    }

    fn schedule_active(&self) -> bool {
        let zoned = jiff::Zoned::new(self.clocks.realtime(), base::time::global_zone());
        self.continuous_enabled || self.schedule.contains(&zoned)
    }

    /// Handles a trigger event. Opens, extends, or leaves alone the writer's
    /// session depending on current state; returns the trigger_type to open
    /// with when the caller should call `writer.open()`.
    pub fn on_trigger(
        &mut self,
        trigger: Trigger,
        writer: &mut SegmentWriter<C>,
        rings: &RingBuffers,
        params: &TrackParams,
    ) -> Result<(), Error> {
        let incoming: TriggerType = trigger.into();
        match self.state {
            ControllerState::Off => {
                debug!(stream = %self.stream_name, "trigger ignored while OFF");
            }
            ControllerState::Armed => {
                self.state = ControllerState::Buffering;
                let now = base::time::Time::from(self.clocks.realtime());
                let prepend = rings.snapshot_from(&self.stream_name, now, self.pre_roll);
                match writer.open(incoming, params, &prepend) {
                    Ok(()) => {
                        self.state = ControllerState::Recording;
                        self.session_trigger = Some(incoming);
                        info!(stream = %self.stream_name, trigger = ?trigger, "recording started");
                    }
                    Err(_) => {
                        // Pre-roll splice failed (first prepended packet wasn't a
                        // keyframe): fall back to starting clean at the next live
                        // keyframe instead of failing the trigger outright.
                        writer.open(incoming, params, &[])?;
                        self.state = ControllerState::Recording;
                        self.session_trigger = Some(incoming);
                    }
                }
            }
            ControllerState::Recording | ControllerState::PostRoll => {
                self.state = ControllerState::Recording;
                self.post_roll_deadline = None;
                self.session_trigger = Some(
                    self.session_trigger
                        .map(|current| current.upgrade(incoming))
                        .unwrap_or(incoming),
                );
                if let Some(id) = writer.open_recording_id() {
                    if let Err(e) = self.db.upgrade_recording_trigger(id, incoming) {
                        warn!(stream = %self.stream_name, error = %e, "failed to upgrade trigger_type on overlap");
                    }
                }
            }
            ControllerState::Buffering | ControllerState::Finalizing => {
                // A trigger racing with an in-flight open/close is coalesced;
                // the next steady-state tick will reconcile.
            }
        }
        Ok(())
    }

    /// Feeds one live packet from the ingest worker. Only meaningful in
    /// `RECORDING`/`POST_ROLL`; a no-op otherwise.
    pub fn on_packet(&mut self, packet: &Packet, writer: &mut SegmentWriter<C>) -> Result<bool, Error> {
        match self.state {
            ControllerState::Recording | ControllerState::PostRoll => writer.write_packet(packet),
            _ => Ok(false),
        }
    }

    /// Periodic tick: advances `POST_ROLL`'s deadline and, once elapsed,
    /// moves to `FINALIZING` and tells the caller to close the writer.
    /// Also re-arms from `OFF` when the schedule turns on, and drops from
    /// `ARMED`/`RECORDING` back toward `OFF` when it turns off (after
    /// draining any open session).
    pub fn tick(&mut self, fps: f64, codec: &str, writer: &mut SegmentWriter<C>) -> Result<(), Error> {
        let active = self.schedule_active();
        match self.state {
            ControllerState::Off if active => self.arm(),
            ControllerState::Armed if !active => self.state = ControllerState::Off,
            // S2: a session upgraded above `Scheduled` (detection/motion/manual)
            // keeps running once the schedule ends -- only the trigger that
            // opened it, or an explicit manual stop, closes it.
            ControllerState::Recording
                if !active && self.session_trigger != Some(TriggerType::Scheduled) => {}
            ControllerState::Recording if !active => {
                self.state = ControllerState::PostRoll;
                self.post_roll_deadline = Some(std::time::Instant::now() + self.post_roll);
            }
            ControllerState::PostRoll => {
                if active {
                    self.state = ControllerState::Recording;
                    self.post_roll_deadline = None;
                } else if self
                    .post_roll_deadline
                    .map(|d| std::time::Instant::now() >= d)
                    .unwrap_or(false)
                {
                    self.state = ControllerState::Finalizing;
                    writer.close(fps, codec)?;
                    self.state = ControllerState::Off;
                    self.post_roll_deadline = None;
                    self.session_trigger = None;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Manual stop regardless of schedule: drains straight to `FINALIZING`.
    pub fn manual_stop(&mut self, fps: f64, codec: &str, writer: &mut SegmentWriter<C>) -> Result<(), Error> {
        if writer.is_open() {
            self.state = ControllerState::Finalizing;
            writer.close(fps, codec)?;
        }
        self.state = ControllerState::Off;
        self.post_roll_deadline = None;
        self.session_trigger = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::dir::SampleFileDir;
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
            data: Arc::new(vec![0u8; 16]),
        }
    }

    fn make_controller() -> (RecordingController<SimulatedClocks>, SegmentWriter<SimulatedClocks>, RingBuffers) {
        make_controller_with(true, ScheduleGrid::always())
    }

    fn make_controller_with(
        continuous_enabled: bool,
        schedule: ScheduleGrid,
    ) -> (RecordingController<SimulatedClocks>, SegmentWriter<SimulatedClocks>, RingBuffers) {
        let clocks = Arc::new(SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap()));
        let db = Arc::new(test_db());
        let dir = Arc::new(SampleFileDir::open(tempfile::tempdir().unwrap().path()).unwrap());
        let writer = SegmentWriter::new("front_door".into(), 60, dir, db.clone());
        let rings = RingBuffers::new();
        rings.register("front_door", db::model::BufferStrategy::Auto);
        let controller = RecordingController::new(
            "front_door".into(),
            continuous_enabled,
            schedule,
            base::time::Duration(0),
            StdDuration::from_secs(2),
            clocks,
            db,
        );
        (controller, writer, rings)
    }

    #[test]
    fn manual_trigger_from_armed_opens_and_records() {
        let (mut ctrl, mut writer, rings) = make_controller();
        ctrl.arm();
        assert_eq!(ctrl.state(), ControllerState::Armed);
        ctrl.on_trigger(Trigger::Manual, &mut writer, &rings, &params()).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Recording);
        assert!(writer.is_open());
    }

    #[test]
    fn overlapping_trigger_extends_without_reopening() {
        let (mut ctrl, mut writer, rings) = make_controller();
        ctrl.arm();
        ctrl.on_trigger(Trigger::Motion, &mut writer, &rings, &params()).unwrap();
        ctrl.on_packet(&packet(0, true), &mut writer).unwrap();
        let id = writer.open_recording_id().unwrap();
        ctrl.on_trigger(Trigger::Manual, &mut writer, &rings, &params()).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Recording);
        // Still the same open file -- a second `open()` would have errored.
        assert!(writer.is_open());
        // S2 -- overlapping manual trigger upgrades trigger_type in place.
        let rec = ctrl.db.get_recording(id).unwrap();
        assert_eq!(rec.trigger_type, TriggerType::Manual);
    }

    #[test]
    fn manual_override_survives_schedule_end() {
        // S2 -- once a manual trigger upgrades the session, the schedule
        // turning off must not push it into POST_ROLL.
        let never = ScheduleGrid::parse("....... 00:00-24:00").unwrap();
        let (mut ctrl, mut writer, rings) = make_controller_with(false, never);
        ctrl.arm();
        ctrl.on_trigger(Trigger::Manual, &mut writer, &rings, &params()).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Recording);
        ctrl.tick(30.0, "h264", &mut writer).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Recording);
        assert!(writer.is_open());
        ctrl.manual_stop(30.0, "h264", &mut writer).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Off);
        assert!(!writer.is_open());
    }

    #[test]
    fn post_roll_finalizes_after_deadline() {
        let (mut ctrl, mut writer, rings) = make_controller();
        ctrl.arm();
        ctrl.on_trigger(Trigger::Motion, &mut writer, &rings, &params()).unwrap();
        ctrl.on_packet(&packet(0, true), &mut writer).unwrap();
        ctrl.manual_stop(30.0, "h264", &mut writer).unwrap();
        assert_eq!(ctrl.state(), ControllerState::Off);
        assert!(!writer.is_open());
    }
}
