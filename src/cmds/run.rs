// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! `run` subcommand: wires every component together and runs until a
//! SIGINT/SIGTERM, following the teacher's one-thread-per-stream streamer
//! model (`cmds::run`/`streamer::Streamer`) instead of spawning everything
//! as plain tokio tasks, since ingest and the segment writer both do
//! blocking I/O.

use crate::config::ConfigFile;
use crate::hls::HlsPublisher;
use crate::ingest::{ClassifiedPacket, IngestSink, IngestWorker, PacketKind, RetinaOpener};
use crate::mp4writer::{Mp4Writer, Sample, TrackParams};
use crate::recording_controller::{ControllerState, RecordingController, Trigger};
use crate::segment_writer::SegmentWriter;
use crate::shutdown_coordinator::{Priority, ShutdownCoordinator};
use crate::storage_controller::StorageController;
use base::clock::{Clocks, RealClocks};
use base::time::ScheduleGrid;
use base::{bail, Error};
use bpaf::{Bpaf, Parser};
use db::dir::SampleFileDir;
use db::model::{BufferStrategy, RetentionTier, Stream};
use db::ring::RingBuffers;
use db::store::Database;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the bootstrap TOML config file.")
        .argument::<PathBuf>("PATH")
}

fn parse_shutdown_timeout_secs() -> impl Parser<u64> {
    bpaf::long("shutdown-timeout-secs")
        .help("Graceful-shutdown budget before stragglers are logged and the process exits anyway.")
        .argument::<u64>("SECS")
        .fallback(30)
        .debug_fallback()
}

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,

    #[bpaf(external(parse_shutdown_timeout_secs))]
    shutdown_timeout_secs: u64,
}

/// How long a live HLS fragment covers before it's closed and published.
const HLS_FRAGMENT_SECS: i64 = 2;

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    let cfg = ConfigFile::load(&args.config)?;
    if let Some(n) = cfg.worker_threads {
        builder.worker_threads(n);
    }
    builder.build().map_err(|e| base::err!(Internal, msg("building tokio runtime"), source(e)))?.block_on(async_run(cfg, args.shutdown_timeout_secs))
}

async fn async_run(cfg: ConfigFile, shutdown_timeout_secs: u64) -> Result<i32, Error> {
    let clocks = RealClocks {};
    if let Some(parent) = cfg.db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db = Arc::new(Database::open(&cfg.db_path, cfg.migrations_dir.as_deref(), clocks)?);
    info!(path = %cfg.db_path.display(), "database loaded");

    let dir = Arc::new(SampleFileDir::open(&cfg.storage_root)?);
    info!(root = %cfg.storage_root.display(), "storage root opened");

    let recovery = db::dir::scan::recover_incomplete(&dir, &db)?;
    info!(
        recovered = recovery.recovered,
        deleted = recovery.deleted,
        marked_corrupt = recovery.marked_corrupt,
        "crash-recovery sweep complete"
    );

    bootstrap_streams(&db, &cfg)?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let rings = Arc::new(RingBuffers::new());

    let storage_handle = {
        let handle = coordinator.register("storage-controller", Priority::Store);
        let mut ctrl = StorageController::new(db.clone(), dir.clone(), Arc::new(clocks), handle);
        thread::Builder::new()
            .name("storage".into())
            .spawn(move || ctrl.run())
            .map_err(|e| base::err!(Internal, msg("spawning storage thread"), source(e)))?
    };

    let rt_handle = tokio::runtime::Handle::current();
    let mut worker_threads = Vec::new();
    let mut ticker_threads = Vec::new();
    for stream in db.list_streams(true)? {
        if !stream.record {
            continue;
        }
        let name = stream.name.clone();

        let writer = Arc::new(base::Mutex::new(SegmentWriter::new(
            name.clone(),
            stream.segment_duration_secs,
            dir.clone(),
            db.clone(),
        )));
        let schedule = match &stream.schedule {
            Some(s) => ScheduleGrid::parse(s)?,
            None => ScheduleGrid::always(),
        };
        let controller = Arc::new(base::Mutex::new(RecordingController::new(
            name.clone(),
            !stream.detection_based_recording,
            schedule,
            base::time::Duration(stream.pre_detection_buffer_secs * base::time::TIME_UNITS_PER_SEC),
            StdDuration::from_secs(stream.post_detection_buffer_secs.max(0) as u64),
            Arc::new(clocks),
            db.clone(),
        )));
        let hls = Arc::new(base::Mutex::new(HlsState {
            publisher: HlsPublisher::new(&cfg.hls_root, &name, crate::hls::DEFAULT_WINDOW)?,
            pending: Vec::new(),
            segment_start: None,
        }));

        let params = track_params_for(&stream);
        let sink = Arc::new(StreamSink {
            controller: controller.clone(),
            writer: writer.clone(),
            rings: rings.clone(),
            hls: hls.clone(),
            params,
            fps: stream.fps.unwrap_or(15.0),
            codec: stream.codec_hint.clone().unwrap_or_else(|| "h264".to_string()),
        });

        let router_stream = stream.clone();
        let router_fps = stream.fps.unwrap_or(15.0);
        let router_codec = stream.codec_hint.clone().unwrap_or_else(|| "h264".to_string());
        let router_params = track_params_for(&stream);

        let ingest_handle = coordinator.register(format!("ingest-{name}"), Priority::Ingest);
        let worker = IngestWorker::new(
            stream,
            Arc::new(clocks),
            Arc::new(RetinaOpener),
            rings.clone(),
            sink,
            ingest_handle,
        );
        let thread_name = format!("i-{name}");
        let handle = rt_handle.clone();
        worker_threads.push(
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let _enter = handle.enter();
                    worker.run();
                })
                .map_err(|e| base::err!(Internal, msg("spawning ingest thread"), source(e)))?,
        );

        let ticker_handle = coordinator.register(format!("controller-{name}"), Priority::Controller);
        let ticker_name = name.clone();
        ticker_threads.push(
            thread::Builder::new()
                .name(format!("c-{ticker_name}"))
                .spawn(move || run_ticker(ticker_handle, controller.clone(), writer.clone()))
                .map_err(|e| base::err!(Internal, msg("spawning controller ticker thread"), source(e)))?,
        );

        let router_handle = coordinator.register(format!("trigger-router-{name}"), Priority::Controller);
        let router_db = db.clone();
        let router_rings = rings.clone();
        ticker_threads.push(
            thread::Builder::new()
                .name(format!("t-{name}"))
                .spawn(move || {
                    crate::triggers::run_router(
                        router_handle,
                        router_stream,
                        router_db,
                        controller,
                        writer,
                        router_rings,
                        router_params,
                        router_fps,
                        router_codec,
                    )
                })
                .map_err(|e| base::err!(Internal, msg("spawning trigger router thread"), source(e)))?,
        );
    }

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| base::err!(Internal, msg("registering SIGINT handler"), source(e)))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| base::err!(Internal, msg("registering SIGTERM handler"), source(e)))?;
    info!("ready");
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    let stragglers = coordinator.initiate_shutdown(StdDuration::from_secs(shutdown_timeout_secs));
    for h in worker_threads.drain(..) {
        let _ = h.join();
    }
    for h in ticker_threads.drain(..) {
        let _ = h.join();
    }
    let _ = storage_handle.join();
    if !stragglers.is_empty() {
        warn!(?stragglers, "some components did not stop cleanly");
    }
    info!("exiting");
    Ok(0)
}

/// Inserts `cfg.streams` rows the first time `run` sees an empty database
/// (§10.3); later runs leave existing rows alone.
fn bootstrap_streams<C: Clocks>(db: &Database<C>, cfg: &ConfigFile) -> Result<(), Error> {
    if !db.list_streams(false)?.is_empty() {
        return Ok(());
    }
    for sc in &cfg.streams {
        let stream = Stream {
            id: 0,
            name: sc.name.clone(),
            source_url: sc.source_url.clone(),
            codec_hint: None,
            width: None,
            height: None,
            fps: None,
            priority: 0,
            protocol: db::model::Protocol::Tcp,
            username: sc.username.clone(),
            password: sc.password.clone(),
            enabled: true,
            record: sc.record,
            segment_duration_secs: sc.segment_duration_secs,
            detection_based_recording: false,
            detection_model_ref: None,
            detection_threshold: 0.5,
            detection_interval_secs: 1,
            detection_object_filter: Vec::new(),
            pre_detection_buffer_secs: 5,
            post_detection_buffer_secs: 10,
            buffer_strategy: BufferStrategy::Auto,
            retention_days: sc.retention_days,
            detection_retention_days: sc.retention_days,
            max_storage_mb: None,
            tier_multiplier_critical: RetentionTier::Critical.default_multiplier(),
            tier_multiplier_important: RetentionTier::Important.default_multiplier(),
            tier_multiplier_ephemeral: RetentionTier::Ephemeral.default_multiplier(),
            tags: Vec::new(),
            schedule: sc.schedule.clone(),
            onvif_host: None,
            onvif_port: None,
            onvif_username: None,
            onvif_password: None,
            onvif_profile_token: None,
            onvif_enabled: false,
            backchannel: false,
            storage_priority: 0,
        };
        db.insert_stream(&stream)?;
        info!(stream = %sc.name, "bootstrapped stream from config");
    }
    Ok(())
}

/// The stream's encoder parameters aren't known until its first keyframe's
/// SDP/parameter sets are parsed; that parsing isn't implemented here (no
/// H.264-bitstream SPS/PPS extraction from the `retina` session), so the
/// dimensions are taken from the `Stream` row and the parameter sets start
/// empty. Real playback of the resulting files would need those to be filled
/// in from the live session -- tracked as an open question in DESIGN.md.
fn track_params_for(stream: &Stream) -> TrackParams {
    TrackParams {
        width: stream.width.unwrap_or(1920) as u16,
        height: stream.height.unwrap_or(1080) as u16,
        timescale: base::time::TIME_UNITS_PER_SEC as u32,
        sequence_parameter_set: Vec::new(),
        picture_parameter_set: Vec::new(),
    }
}

struct HlsState {
    publisher: HlsPublisher,
    pending: Vec<db::ring::Packet>,
    segment_start: Option<base::time::Time>,
}

/// Bridges the ingest worker (§4.C) to the recording controller (§4.E) and a
/// best-effort live HLS fragment writer (§4.F), which runs independently of
/// whether a recording session is open.
struct StreamSink<C: Clocks> {
    controller: Arc<base::Mutex<RecordingController<C>>>,
    writer: Arc<base::Mutex<SegmentWriter<C>>>,
    rings: Arc<RingBuffers>,
    hls: Arc<base::Mutex<HlsState>>,
    params: TrackParams,
    fps: f64,
    codec: String,
}

impl<C: Clocks> IngestSink for StreamSink<C> {
    fn on_packet(&self, _stream_name: &str, packet: &ClassifiedPacket) {
        {
            let mut controller = self.controller.lock();
            let mut writer = self.writer.lock();
            if controller.state() == ControllerState::Armed && matches!(packet.kind, PacketKind::VideoKey) {
                if let Err(e) = controller.on_trigger(Trigger::Scheduled, &mut writer, &self.rings, &self.params) {
                    warn!(error = %e, "failed to open recording on continuous trigger");
                }
            }
            match controller.on_packet(&packet.packet, &mut writer) {
                Ok(true) => {
                    if let Err(e) = writer.close(self.fps, &self.codec) {
                        warn!(error = %e, "rotation close failed");
                    }
                    if let Err(e) = controller.on_trigger(Trigger::Scheduled, &mut writer, &self.rings, &self.params) {
                        warn!(error = %e, "rotation reopen failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "write_packet failed"),
            }
        }
        self.feed_hls(packet);
    }

    fn on_connected(&self, stream_name: &str) {
        self.controller.lock().arm();
        info!(stream = %stream_name, "STREAM_CONNECTED");
    }

    fn on_disconnected(&self, stream_name: &str) {
        info!(stream = %stream_name, "STREAM_DISCONNECTED");
    }
}

impl<C: Clocks> StreamSink<C> {
    fn feed_hls(&self, packet: &ClassifiedPacket) {
        let mut hls = self.hls.lock();
        let start = *hls.segment_start.get_or_insert(packet.packet.pts);
        let elapsed_secs = (packet.packet.pts.0 - start.0) / base::time::TIME_UNITS_PER_SEC;
        hls.pending.push(packet.packet.clone());
        if packet.packet.is_key && elapsed_secs >= HLS_FRAGMENT_SECS && hls.pending.len() > 1 {
            if let Err(e) = flush_hls_fragment(&mut hls, &self.params) {
                warn!(error = %e, "failed to publish HLS fragment");
            }
        }
    }
}

fn flush_hls_fragment(hls: &mut HlsState, params: &TrackParams) -> Result<(), Error> {
    let pending = std::mem::take(&mut hls.pending);
    let Some(first) = pending.first() else {
        return Ok(());
    };
    if !first.is_key {
        bail!(FailedPrecondition, msg("HLS fragment must start on a keyframe"));
    }
    let start = first.pts;
    let path = hls.publisher.next_segment_path();
    let mut writer = Mp4Writer::create(&path, params)?;
    for p in &pending {
        let rel = (p.pts.0 - start.0).max(0) as u64;
        writer.write_sample(rel, &Sample { data: p.data.as_ref().clone(), duration: 0, is_sync: p.is_key })?;
    }
    writer.finish()?;
    let last = pending.last().unwrap();
    let duration_secs = (last.pts.0 - start.0) as f64 / base::time::TIME_UNITS_PER_SEC as f64;
    hls.publisher.publish_segment(duration_secs.max(0.1))?;
    hls.segment_start = None;
    Ok(())
}

fn run_ticker<C: Clocks>(
    handle: crate::shutdown_coordinator::Handle,
    controller: Arc<base::Mutex<RecordingController<C>>>,
    writer: Arc<base::Mutex<SegmentWriter<C>>>,
) {
    loop {
        if handle.wait_for(StdDuration::from_secs(1)) {
            break;
        }
        let mut ctrl = controller.lock();
        let mut w = writer.lock();
        let fps = 15.0;
        if let Err(e) = ctrl.tick(fps, "h264", &mut w) {
            warn!(error = %e, "controller tick failed");
        }
    }
    handle.report_stopped();
}
