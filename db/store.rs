// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! The metadata store (§4.A): connection, transactions, migration runner,
//! and typed accessors for every entity in §3.
//!
//! The whole database is behind a single serialized accessor
//! ([`Database::conn`]); callers never hold the lock across a suspension
//! point (§5). Statements that hit `SQLITE_BUSY`/`SQLITE_LOCKED` are retried
//! with exponential backoff up to a 2 s cap before giving up.

use crate::model::{
    DailyStorageStats, Detection, DetectionZone, Event, Recording, RecordingSortField,
    RetentionTier, SortDir, Stream,
};
use crate::schema;
use base::clock::{Clocks, TimerGuard};
use base::{bail, err, Error};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// A page of results plus whether more rows exist beyond `limit`.
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

pub struct Database<C: Clocks> {
    conn: base::Mutex<rusqlite::Connection>,
    clocks: C,
    migrations_dir: Option<PathBuf>,
}

/// Target for any single transaction (§5); exceeding it logs a warning but
/// does not abort -- only a bug would make this a hard cap in practice.
const TX_WARN_THRESHOLD: Duration = Duration::from_millis(100);

const BUSY_RETRY_CAP: Duration = Duration::from_secs(2);

impl<C: Clocks> Database<C> {
    /// Opens (creating if absent) the database at `path`, sets WAL-equivalent
    /// pragmas, and applies every pending migration. Fails fast (§7 Schema
    /// errors are fatal) if any migration errors.
    pub fn open(path: &Path, migrations_dir: Option<&Path>, clocks: C) -> Result<Self, Error> {
        let mut conn = rusqlite::Connection::open(path)?;
        set_integrity_pragmas(&mut conn)?;
        let migrations = schema::load_migrations(migrations_dir)?;
        let applied = schema::apply_pending(&mut conn, &migrations)?;
        if !applied.is_empty() {
            info!(versions = ?applied, "applied schema migrations");
        }
        Ok(Database {
            conn: base::Mutex::new(conn),
            clocks,
            migrations_dir: migrations_dir.map(Path::to_path_buf),
        })
    }

    /// In-memory database for tests (`db/testutil.rs`).
    pub fn open_in_memory(clocks: C) -> Result<Self, Error> {
        let mut conn = rusqlite::Connection::open_in_memory()?;
        set_integrity_pragmas(&mut conn)?;
        let migrations = schema::embedded_migrations();
        schema::apply_pending(&mut conn, &migrations)?;
        Ok(Database {
            conn: base::Mutex::new(conn),
            clocks,
            migrations_dir: None,
        })
    }

    /// Rolls back the `n` most recently applied migrations (`migrate down N`).
    pub fn migrate_down(&self, n: usize) -> Result<Vec<String>, Error> {
        let migrations = schema::load_migrations(self.migrations_dir.as_deref())?;
        let mut conn = self.conn.lock();
        let result = schema::apply_down(&mut conn, &migrations, n)?;
        Ok(result)
    }

    /// Runs `f` against the connection with a transaction-duration warning
    /// and bounded-backoff retry on `SQLITE_BUSY`/`SQLITE_LOCKED` (§4.A, §5).
    fn with_tx<T>(
        &self,
        label: &'static str,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guard = TimerGuard::new(&self.clocks, TX_WARN_THRESHOLD, || label);
        let mut backoff = Duration::from_millis(10);
        loop {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            match f(&tx) {
                Ok(v) => {
                    tx.commit()?;
                    return Ok(v);
                }
                Err(e) if is_busy(&e) && backoff < BUSY_RETRY_CAP => {
                    drop(tx);
                    drop(conn);
                    self.clocks.sleep(backoff);
                    backoff = (backoff * 2).min(BUSY_RETRY_CAP);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---- streams -----------------------------------------------------

    pub fn insert_stream(&self, s: &Stream) -> Result<i64, Error> {
        s.validate()?;
        self.with_tx("insert_stream", |tx| {
            tx.execute(
                r#"insert into streams
                    (name, source_url, codec_hint, width, height, fps, priority, protocol,
                     username, password, enabled, record, segment_duration_secs,
                     detection_based_recording, detection_model_ref, detection_threshold,
                     detection_interval_secs, detection_object_filter,
                     pre_detection_buffer_secs, post_detection_buffer_secs,
                     retention_days, detection_retention_days, max_storage_mb,
                     tier_multiplier_critical, tier_multiplier_important, tier_multiplier_ephemeral,
                     tags, schedule, onvif_host, onvif_port, onvif_username, onvif_password,
                     onvif_profile_token, onvif_enabled, backchannel, storage_priority, buffer_strategy)
                   values
                    (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32,
                     ?33, ?34, ?35, ?36, ?37)"#,
                rusqlite::params![
                    s.name,
                    s.source_url,
                    s.codec_hint,
                    s.width,
                    s.height,
                    s.fps,
                    s.priority,
                    s.protocol.as_str(),
                    s.username,
                    s.password,
                    s.enabled,
                    s.record,
                    s.segment_duration_secs,
                    s.detection_based_recording,
                    s.detection_model_ref,
                    s.detection_threshold,
                    s.detection_interval_secs,
                    crate::model::join_csv(&s.detection_object_filter),
                    s.pre_detection_buffer_secs,
                    s.post_detection_buffer_secs,
                    s.retention_days,
                    s.detection_retention_days,
                    s.max_storage_mb,
                    s.tier_multiplier_critical,
                    s.tier_multiplier_important,
                    s.tier_multiplier_ephemeral,
                    crate::model::join_csv(&s.tags),
                    s.schedule,
                    s.onvif_host,
                    s.onvif_port,
                    s.onvif_username,
                    s.onvif_password,
                    s.onvif_profile_token,
                    s.onvif_enabled,
                    s.backchannel,
                    s.storage_priority,
                    s.buffer_strategy.as_str(),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn get_stream(&self, name: &str) -> Result<Stream, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from streams where name = ?1",
            rusqlite::params![name],
            Stream::from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                err!(NotFound, msg("no such stream {name:?}"))
            }
            e => e.into(),
        })
    }

    pub fn list_streams(&self, enabled_only: bool) -> Result<Vec<Stream>, Error> {
        let conn = self.conn.lock();
        let sql = if enabled_only {
            "select * from streams where enabled = 1 order by name"
        } else {
            "select * from streams order by name"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], Stream::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Soft-disables a stream, or hard-deletes it (cascading via FK) if `permanent`.
    pub fn delete_stream(&self, name: &str, permanent: bool) -> Result<(), Error> {
        self.with_tx("delete_stream", |tx| {
            if permanent {
                tx.execute("delete from streams where name = ?1", rusqlite::params![name])?;
            } else {
                tx.execute(
                    "update streams set enabled = 0, record = 0 where name = ?1",
                    rusqlite::params![name],
                )?;
            }
            Ok(())
        })
    }

    // ---- recordings ----------------------------------------------------

    /// Inserts a new, incomplete recording row at file-open time (§4.D).
    pub fn insert_recording(
        &self,
        stream_name: &str,
        file_path: &str,
        start_time: &str,
        trigger_type: crate::model::TriggerType,
    ) -> Result<i64, Error> {
        self.with_tx("insert_recording", |tx| {
            tx.execute(
                r#"insert into recordings
                    (stream_name, file_path, start_time, trigger_type, is_complete)
                   values (?1, ?2, ?3, ?4, 0)"#,
                rusqlite::params![stream_name, file_path, start_time, trigger_type.as_str()],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Periodic `(size_bytes, end_time)` update while a recording is open (§4.D, every 5 s).
    pub fn update_recording_progress(
        &self,
        id: i64,
        size_bytes: i64,
        end_time: &str,
    ) -> Result<(), Error> {
        self.with_tx("update_recording_progress", |tx| {
            tx.execute(
                "update recordings set size_bytes = ?1, end_time = ?2 where id = ?3",
                rusqlite::params![size_bytes, end_time, id],
            )?;
            Ok(())
        })
    }

    /// Upgrades a session's trigger_type in place (§4.E overlap rule); never
    /// downgrades, since `TriggerType::upgrade` takes the max priority.
    pub fn upgrade_recording_trigger(
        &self,
        id: i64,
        incoming: crate::model::TriggerType,
    ) -> Result<(), Error> {
        self.with_tx("upgrade_recording_trigger", |tx| {
            let current: String =
                tx.query_row("select trigger_type from recordings where id = ?1", rusqlite::params![id], |r| r.get(0))?;
            let current: crate::model::TriggerType = current.parse().unwrap_or(crate::model::TriggerType::Scheduled);
            let upgraded = current.upgrade(incoming);
            if upgraded != current {
                tx.execute(
                    "update recordings set trigger_type = ?1 where id = ?2",
                    rusqlite::params![upgraded.as_str(), id],
                )?;
            }
            Ok(())
        })
    }

    /// Finalizes a recording at file close (§4.D).
    pub fn finalize_recording(
        &self,
        id: i64,
        end_time: &str,
        size_bytes: i64,
        width: i64,
        height: i64,
        fps: f64,
        codec: &str,
    ) -> Result<(), Error> {
        if size_bytes <= 0 {
            bail!(
                FailedPrecondition,
                msg("cannot finalize recording {id} with non-positive size")
            );
        }
        self.with_tx("finalize_recording", |tx| {
            tx.execute(
                r#"update recordings set end_time = ?1, size_bytes = ?2, width = ?3, height = ?4,
                       fps = ?5, codec = ?6, is_complete = 1
                   where id = ?7"#,
                rusqlite::params![end_time, size_bytes, width, height, fps, codec, id],
            )?;
            Ok(())
        })
    }

    /// Marks a recording found incomplete at startup as either finalized
    /// best-effort or corrupt (§4.D crash-recovery sweep, S5).
    pub fn mark_recovered(
        &self,
        id: i64,
        end_time: &str,
        size_bytes: i64,
        corrupt: bool,
    ) -> Result<(), Error> {
        self.with_tx("mark_recovered", |tx| {
            tx.execute(
                "update recordings set end_time = ?1, size_bytes = ?2, is_complete = 1, corrupt = ?3 where id = ?4",
                rusqlite::params![end_time, size_bytes, corrupt, id],
            )?;
            Ok(())
        })
    }

    pub fn delete_recording(&self, id: i64) -> Result<(), Error> {
        self.with_tx("delete_recording", |tx| {
            tx.execute("delete from recordings where id = ?1", rusqlite::params![id])?;
            Ok(())
        })
    }

    pub fn get_recording(&self, id: i64) -> Result<Recording, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select * from recordings where id = ?1",
            rusqlite::params![id],
            Recording::from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => err!(NotFound, msg("no such recording {id}")),
            e => e.into(),
        })
    }

    /// Recordings still open (`is_complete=false`) at startup, for the crash-recovery sweep.
    pub fn list_incomplete_recordings(&self) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("select * from recordings where is_complete = 0")?;
        let rows = stmt.query_map([], Recording::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Eviction candidates: complete, unprotected (unless `include_protected`),
    /// past-due recordings for a stream, oldest first (§4.G step 2-3).
    /// Candidates for age-based eviction (§4.G steps 1-3) or quota
    /// enforcement (step 4). `tier` restricts to one retention tier, since
    /// each tier has its own effective retention; pass `None` for quota
    /// enforcement, which evicts oldest-first across all tiers.
    pub fn list_eviction_candidates(
        &self,
        stream_name: &str,
        tier: Option<RetentionTier>,
        older_than: &str,
        include_protected: bool,
        limit: i64,
    ) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let sql = match (tier.is_some(), include_protected) {
            (true, true) => {
                "select * from recordings where stream_name = ?1 and is_complete = 1 \
                 and retention_tier = ?2 and end_time < ?3 order by end_time asc limit ?4"
            }
            (true, false) => {
                "select * from recordings where stream_name = ?1 and is_complete = 1 and protected = 0 \
                 and retention_tier = ?2 and end_time < ?3 order by end_time asc limit ?4"
            }
            (false, true) => {
                "select * from recordings where stream_name = ?1 and is_complete = 1 \
                 and end_time < ?3 order by end_time asc limit ?4"
            }
            (false, false) => {
                "select * from recordings where stream_name = ?1 and is_complete = 1 and protected = 0 \
                 and end_time < ?3 order by end_time asc limit ?4"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let tier_param: Option<i64> = tier.map(i64::from);
        let rows = stmt.query_map(
            rusqlite::params![stream_name, tier_param, older_than, limit],
            Recording::from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Disk-pressure sweep candidates across all streams (§4.G step 5).
    pub fn list_disk_pressure_candidates(
        &self,
        emergency_override: bool,
        limit: i64,
    ) -> Result<Vec<Recording>, Error> {
        let conn = self.conn.lock();
        let sql = if emergency_override {
            "select * from recordings where is_complete = 1 and disk_pressure_eligible = 1 \
             order by end_time asc limit ?1"
        } else {
            "select * from recordings where is_complete = 1 and disk_pressure_eligible = 1 \
             and protected = 0 order by end_time asc limit ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params![limit], Recording::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn stream_total_bytes(&self, stream_name: &str) -> Result<i64, Error> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "select coalesce(sum(size_bytes), 0) from recordings where stream_name = ?1 and is_complete = 1",
            rusqlite::params![stream_name],
            |row| row.get(0),
        )?)
    }

    /// Per-tier `(bytes, recording_count)` for one stream, feeding the
    /// storage controller's deep-cycle daily rollup (§4.G deep tier).
    pub fn stream_tier_rollup(&self, stream_name: &str) -> Result<Vec<(RetentionTier, i64, i64)>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "select retention_tier, coalesce(sum(size_bytes), 0), count(*) from recordings \
             where stream_name = ?1 and is_complete = 1 group by retention_tier",
        )?;
        let rows = stmt.query_map(rusqlite::params![stream_name], |row| {
            let tier_raw: i64 = row.get(0)?;
            let bytes: i64 = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((tier_raw, bytes, count))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (tier_raw, bytes, count) = row?;
            let tier = RetentionTier::try_from(tier_raw)?;
            out.push((tier, bytes, count));
        }
        Ok(out)
    }

    /// Paginated recording list for the external `GET /recordings` contract (§6).
    pub fn list_recordings_page(
        &self,
        stream_name: Option<&str>,
        sort: RecordingSortField,
        dir: SortDir,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Recording>, Error> {
        if !(1..=1000).contains(&limit) {
            bail!(InvalidArgument, msg("limit must be in 1..=1000"));
        }
        let conn = self.conn.lock();
        let sql = format!(
            "select * from recordings {} order by {} {} limit ?1 offset ?2",
            match stream_name {
                Some(_) => "where stream_name = ?3",
                None => "",
            },
            sort.column(),
            dir.as_sql(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut items: Vec<Recording> = match stream_name {
            Some(name) => stmt
                .query_map(rusqlite::params![limit + 1, offset, name], Recording::from_row)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(rusqlite::params![limit + 1, offset], Recording::from_row)?
                .collect::<Result<_, _>>()?,
        };
        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);
        Ok(Page { items, has_more })
    }

    // ---- detections ------------------------------------------------------

    /// Inserts a detection event, deduplicating an exact-duplicate retried
    /// re-ingest of the same `(stream, ts, label, bbox)` (§8 round-trip).
    pub fn insert_detection(&self, d: &Detection) -> Result<i64, Error> {
        d.validate()?;
        self.with_tx("insert_detection", |tx| {
            let dup: Option<i64> = tx
                .query_row(
                    r#"select id from detections where stream_name = ?1 and label = ?2
                       and abs(bbox_x - ?3) < 1e-6 and abs(bbox_y - ?4) < 1e-6 and ts = ?5
                       limit 1"#,
                    rusqlite::params![d.stream_name, d.label, d.bbox_x, d.bbox_y, d.ts],
                    |row| row.get(0),
                )
                .optional_opt()?;
            if let Some(id) = dup {
                return Ok(id);
            }
            tx.execute(
                r#"insert into detections
                    (stream_name, ts, label, confidence, bbox_x, bbox_y, bbox_w, bbox_h,
                     recording_id, track_id, zone_id)
                   values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                rusqlite::params![
                    d.stream_name,
                    d.ts,
                    d.label,
                    d.confidence,
                    d.bbox_x,
                    d.bbox_y,
                    d.bbox_w,
                    d.bbox_h,
                    d.recording_id,
                    d.track_id,
                    d.zone_id,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn list_detections_for_recording(&self, recording_id: i64) -> Result<Vec<Detection>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("select * from detections where recording_id = ?1 order by ts")?;
        let rows = stmt.query_map(rusqlite::params![recording_id], Detection::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_detections_older_than(&self, cutoff: &str) -> Result<usize, Error> {
        self.with_tx("delete_detections_older_than", |tx| {
            Ok(tx.execute("delete from detections where ts < ?1", rusqlite::params![cutoff])?)
        })
    }

    /// Backfills a detection's `recording_id` once the trigger it caused has
    /// opened a file (§4.E detection-consumption path, S1's linked-detection
    /// invariant); the column is nullable and otherwise left unset.
    pub fn link_detection_to_recording(&self, detection_id: i64, recording_id: i64) -> Result<(), Error> {
        self.with_tx("link_detection_to_recording", |tx| {
            tx.execute(
                "update detections set recording_id = ?1 where id = ?2",
                rusqlite::params![recording_id, detection_id],
            )?;
            Ok(())
        })
    }

    /// New detections for one stream since `since_id`, oldest first, for the
    /// detection-consumption poll loop (§4.E). `since_id` is the highest id
    /// already consumed; pass 0 to start from the beginning.
    pub fn list_detections_since(
        &self,
        stream_name: &str,
        since_id: i64,
        limit: i64,
    ) -> Result<Vec<Detection>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "select * from detections where stream_name = ?1 and id > ?2 order by id asc limit ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![stream_name, since_id, limit],
            Detection::from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- zones -------------------------------------------------------------

    pub fn insert_zone(&self, z: &DetectionZone) -> Result<i64, Error> {
        z.validate()?;
        let points_json = serde_json::to_string(&z.points).map_err(|e| err!(Internal, source(e)))?;
        self.with_tx("insert_zone", |tx| {
            tx.execute(
                r#"insert into detection_zones (stream_name, points_json, color, class_filter, min_confidence)
                   values (?1, ?2, ?3, ?4, ?5)"#,
                rusqlite::params![
                    z.stream_name,
                    points_json,
                    z.color,
                    crate::model::join_csv(&z.class_filter),
                    z.min_confidence,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn list_zones(&self, stream_name: &str) -> Result<Vec<DetectionZone>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("select * from detection_zones where stream_name = ?1")?;
        let rows = stmt.query_map(rusqlite::params![stream_name], DetectionZone::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- events --------------------------------------------------------

    pub fn insert_event(&self, kind: &str, message: &str, stream_name: Option<&str>) -> Result<i64, Error> {
        self.with_tx("insert_event", |tx| {
            tx.execute(
                "insert into events (kind, message, stream_name) values (?1, ?2, ?3)",
                rusqlite::params![kind, message, stream_name],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn delete_events_older_than(&self, cutoff: &str) -> Result<usize, Error> {
        self.with_tx("delete_events_older_than", |tx| {
            Ok(tx.execute("delete from events where ts < ?1", rusqlite::params![cutoff])?)
        })
    }

    /// New events of one `kind` for a stream since `since_id`, oldest first;
    /// the manual start/stop API (§4.E) is implemented as event rows rather
    /// than a dedicated table, distinguished by `kind`.
    pub fn list_events_since(
        &self,
        stream_name: &str,
        since_id: i64,
        kind: &str,
        limit: i64,
    ) -> Result<Vec<Event>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "select * from events where stream_name = ?1 and kind = ?2 and id > ?3 order by id asc limit ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![stream_name, kind, since_id, limit],
            Event::from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ---- daily storage stats --------------------------------------------

    pub fn upsert_daily_stats(&self, s: &DailyStorageStats) -> Result<(), Error> {
        self.with_tx("upsert_daily_stats", |tx| {
            tx.execute(
                r#"insert into storage_daily_stats (date, stream_name, retention_tier, bytes, recording_count)
                   values (?1, ?2, ?3, ?4, ?5)
                   on conflict (date, stream_name, retention_tier)
                   do update set bytes = excluded.bytes, recording_count = excluded.recording_count"#,
                rusqlite::params![
                    s.date,
                    s.stream_name,
                    i64::from(s.retention_tier),
                    s.bytes,
                    s.recording_count,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_daily_stats_older_than(&self, cutoff_date: &str) -> Result<usize, Error> {
        self.with_tx("delete_daily_stats_older_than", |tx| {
            Ok(tx.execute(
                "delete from storage_daily_stats where date < ?1",
                rusqlite::params![cutoff_date],
            )?)
        })
    }

    /// `GET /health`'s `db_version` field: highest applied migration version.
    pub fn schema_version(&self) -> Result<Option<String>, Error> {
        let conn = self.conn.lock();
        Ok(schema::applied_versions(&conn)?.into_iter().last())
    }

    /// Runs SQLite's own consistency check (`check` subcommand, §12); any
    /// returned string other than `"ok"` is a corruption report.
    pub fn integrity_check(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("pragma integrity_check")?;
        let rows = stmt.query_map(rusqlite::params![], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let msg = row?;
            if msg != "ok" {
                out.push(msg);
            }
        }
        Ok(out)
    }

    /// The clock handle this database was opened with, for callers (ingest,
    /// segment writer, storage controller) that need "now" alongside a
    /// query on the same `Arc<Database<C>>`.
    pub fn clocks(&self) -> &C {
        &self.clocks
    }
}

fn set_integrity_pragmas(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        pragma journal_mode = wal;
        pragma foreign_keys = on;
        pragma busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn is_busy(e: &Error) -> bool {
    matches!(e.kind(), base::ErrorKind::Unavailable)
}

/// `rusqlite`'s `OptionalExtension` collapses `QueryReturnedNoRows` to `None`;
/// this thin alias keeps call sites in this file reading the same way as the
/// rest of the accessor methods (`Result<_, Error>` throughout).
trait OptionalOpt<T> {
    fn optional_opt(self) -> Result<Option<T>, Error>;
}

impl<T> OptionalOpt<T> for Result<T, rusqlite::Error> {
    fn optional_opt(self) -> Result<Option<T>, Error> {
        use rusqlite::OptionalExtension;
        Ok(self.optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BufferStrategy, Protocol, TriggerType};
    use base::clock::SimulatedClocks;

    fn test_db() -> Database<SimulatedClocks> {
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap());
        Database::open_in_memory(clocks).unwrap()
    }

    fn sample_stream(name: &str) -> Stream {
        Stream {
            id: 0,
            name: name.to_string(),
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
            tags: vec!["outdoor".into()],
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

    #[test]
    fn insert_and_get_stream_round_trips() {
        let db = test_db();
        db.insert_stream(&sample_stream("front_door")).unwrap();
        let got = db.get_stream("front_door").unwrap();
        assert_eq!(got.name, "front_door");
        assert_eq!(got.tags, vec!["outdoor".to_string()]);
    }

    #[test]
    fn get_missing_stream_is_not_found() {
        let db = test_db();
        let e = db.get_stream("nope").unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }

    #[test]
    fn recording_lifecycle() {
        let db = test_db();
        db.insert_stream(&sample_stream("front_door")).unwrap();
        let id = db
            .insert_recording("front_door", "/r/1.mp4", "2024-01-01T00:00:00Z", TriggerType::Scheduled)
            .unwrap();
        let rec = db.get_recording(id).unwrap();
        assert!(!rec.is_complete);

        db.upgrade_recording_trigger(id, TriggerType::Manual).unwrap();
        let rec = db.get_recording(id).unwrap();
        assert_eq!(rec.trigger_type, TriggerType::Manual);
        // A lower-priority trigger doesn't downgrade it.
        db.upgrade_recording_trigger(id, TriggerType::Detection).unwrap();
        let rec = db.get_recording(id).unwrap();
        assert_eq!(rec.trigger_type, TriggerType::Manual);

        db.finalize_recording(id, "2024-01-01T00:01:00Z", 1024, 1920, 1080, 15.0, "h264")
            .unwrap();
        let rec = db.get_recording(id).unwrap();
        assert!(rec.is_complete);
        assert_eq!(rec.size_bytes, 1024);
    }

    #[test]
    fn finalize_rejects_zero_size() {
        let db = test_db();
        db.insert_stream(&sample_stream("front_door")).unwrap();
        let id = db
            .insert_recording("front_door", "/r/1.mp4", "2024-01-01T00:00:00Z", TriggerType::Scheduled)
            .unwrap();
        db.finalize_recording(id, "2024-01-01T00:01:00Z", 0, 1920, 1080, 15.0, "h264")
            .unwrap_err();
    }

    #[test]
    fn eviction_candidates_respect_protection() {
        let db = test_db();
        db.insert_stream(&sample_stream("garage")).unwrap();
        for i in 0..3 {
            let id = db
                .insert_recording("garage", &format!("/r/{i}.mp4"), "2024-01-01T00:00:00Z", TriggerType::Scheduled)
                .unwrap();
            db.finalize_recording(id, "2024-01-01T00:01:00Z", 1024, 1920, 1080, 15.0, "h264")
                .unwrap();
        }
        // Protect the middle one.
        {
            let conn = db.conn.lock();
            conn.execute("update recordings set protected = 1 where id = 2", []).unwrap();
        }
        let candidates = db
            .list_eviction_candidates("garage", None, "2030-01-01T00:00:00Z", false, 200)
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|r| r.id != 2));
    }

    #[test]
    fn pagination_reports_has_more() {
        let db = test_db();
        db.insert_stream(&sample_stream("cam1")).unwrap();
        for i in 0..5 {
            db.insert_recording("cam1", &format!("/r/{i}.mp4"), "2024-01-01T00:00:00Z", TriggerType::Scheduled)
                .unwrap();
        }
        let page = db
            .list_recordings_page(Some("cam1"), RecordingSortField::StartTime, SortDir::Asc, 2, 0)
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        let page = db
            .list_recordings_page(Some("cam1"), RecordingSortField::StartTime, SortDir::Asc, 10, 0)
            .unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(!page.has_more);
    }
}
