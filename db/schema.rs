// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Schema-migration runtime (§4.A).
//!
//! Migrations are sortable-version-identified pairs of SQL scripts. The
//! embedded set below (compiled into the binary) is merged with any
//! present under `db/migrations/<version>.{up,down}.sql` on disk, sorted by
//! version, and applied in order inside one transaction per version. The
//! migration set defines the recording/retention contract: tier columns,
//! `trigger_type`, `protected`, and `tags` (replacing `group_name`) all
//! arrive via this mechanism rather than a hand-maintained `schema.sql`.

use base::{bail, err, Error};
use std::collections::BTreeMap;
use std::path::Path;

/// One schema version: a version string, an `up` script, and a `down` script.
///
/// `down` may be a no-op (`""`) when the forward change isn't reversible on
/// this engine; applying it then simply records the rollback without
/// touching the schema, matching §4.A's "some DDL is not reversible" note.
#[derive(Clone, Debug)]
pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

macro_rules! migration {
    ($version:literal, $description:literal, up: $up:literal, down: $down:literal $(,)?) => {
        Migration {
            version: $version,
            description: $description,
            up: $up,
            down: $down,
        }
    };
}

/// The full embedded migration set, in ascending version order.
///
/// Versions 0006 and 0007 were squashed into neighboring versions upstream
/// and are intentionally absent; §6 only requires that applied versions be
/// monotonically increasing, not contiguous.
pub fn embedded_migrations() -> Vec<Migration> {
    vec![
        migration!(
            "0001", "streams and recordings, baseline indices",
            up: r#"
                create table streams (
                    id integer primary key,
                    name text unique not null,
                    source_url text not null,
                    codec_hint text,
                    width integer,
                    height integer,
                    fps real,
                    priority integer not null default 5,
                    protocol text not null default 'tcp',
                    username text,
                    password text,
                    enabled integer not null default 1,
                    record integer not null default 1,
                    segment_duration_secs integer not null default 60,
                    created_at text not null default current_timestamp,
                    updated_at text not null default current_timestamp
                );
                create table recordings (
                    id integer primary key,
                    stream_name text not null references streams(name),
                    file_path text not null,
                    start_time text not null,
                    end_time text,
                    size_bytes integer not null default 0,
                    width integer,
                    height integer,
                    fps real,
                    codec text,
                    is_complete integer not null default 0
                );
                create index recordings_stream_start on recordings(stream_name, start_time);
            "#,
            down: r#"
                drop index recordings_stream_start;
                drop table recordings;
                drop table streams;
            "#,
        ),
        migration!(
            "0002", "detections table",
            up: r#"
                create table detections (
                    id integer primary key,
                    stream_name text not null references streams(name),
                    ts text not null,
                    label text not null,
                    confidence real not null,
                    bbox_x real not null,
                    bbox_y real not null,
                    bbox_w real not null,
                    bbox_h real not null,
                    recording_id integer references recordings(id),
                    track_id text,
                    zone_id integer
                );
                create index detections_stream_ts on detections(stream_name, ts);
            "#,
            down: r#"
                drop index detections_stream_ts;
                drop table detections;
            "#,
        ),
        migration!(
            "0003", "stream detection columns",
            up: r#"
                alter table streams add column detection_based_recording integer not null default 0;
                alter table streams add column detection_model_ref text;
                alter table streams add column detection_threshold real not null default 0.5;
                alter table streams add column detection_interval_secs integer not null default 1;
                alter table streams add column pre_detection_buffer_secs integer not null default 0;
                alter table streams add column post_detection_buffer_secs integer not null default 0;
                alter table streams add column buffer_strategy text not null default 'auto';
            "#,
            down: "",
        ),
        migration!(
            "0004", "onvif columns",
            up: r#"
                alter table streams add column onvif_host text;
                alter table streams add column onvif_port integer;
                alter table streams add column onvif_username text;
                alter table streams add column onvif_password text;
                alter table streams add column onvif_profile_token text;
            "#,
            down: "",
        ),
        migration!(
            "0005", "backchannel flag",
            up: "alter table streams add column backchannel integer not null default 0;",
            down: "",
        ),
        migration!(
            "0008", "zones (legacy uuid-keyed)",
            up: r#"
                create table zones (
                    id text primary key,
                    stream_name text not null references streams(name),
                    points_json text not null,
                    color text,
                    class_filter text,
                    min_confidence real not null default 0.0
                );
            "#,
            down: "drop table zones;",
        ),
        migration!(
            "0009", "stream group_name (legacy grouping, replaced by tags in 0029)",
            up: "alter table streams add column group_name text;",
            down: "",
        ),
        migration!(
            "0010", "motion recording config",
            up: r#"
                create table motion_configs (
                    stream_name text primary key references streams(name),
                    sensitivity real not null default 0.5,
                    min_area_pct real not null default 1.0,
                    zones_json text
                );
            "#,
            down: "drop table motion_configs;",
        ),
        migration!(
            "0011", "detections.recording_id index",
            up: "create index detections_recording on detections(recording_id);",
            down: "drop index detections_recording;",
        ),
        migration!(
            "0012", "consolidated recordings indices",
            up: r#"
                create index recordings_stream_end on recordings(stream_name, end_time);
                create index recordings_is_complete on recordings(is_complete);
            "#,
            down: r#"
                drop index recordings_stream_end;
                drop index recordings_is_complete;
            "#,
        ),
        migration!(
            "0013", "retention policy columns and trigger_type",
            up: r#"
                alter table streams add column retention_days integer not null default 30;
                alter table streams add column detection_retention_days integer not null default 30;
                alter table streams add column max_storage_mb integer;
                alter table recordings add column trigger_type text not null default 'scheduled';
            "#,
            down: "",
        ),
        migration!(
            "0014", "tier multiplier columns",
            up: r#"
                alter table streams add column tier_multiplier_critical real not null default 3.0;
                alter table streams add column tier_multiplier_important real not null default 2.0;
                alter table streams add column tier_multiplier_ephemeral real not null default 0.25;
            "#,
            down: "",
        ),
        migration!(
            "0015", "recordings.retention_tier",
            up: "alter table recordings add column retention_tier integer not null default 2;",
            down: "",
        ),
        migration!(
            "0016", "recordings.protected",
            up: "alter table recordings add column protected integer not null default 0;",
            down: "",
        ),
        migration!(
            "0017", "recordings.retention_override_days",
            up: "alter table recordings add column retention_override_days integer;",
            down: "",
        ),
        migration!(
            "0018", "recordings.disk_pressure_eligible and corrupt flag",
            up: r#"
                alter table recordings add column disk_pressure_eligible integer not null default 1;
                alter table recordings add column corrupt integer not null default 0;
            "#,
            down: "",
        ),
        migration!(
            "0019", "events table (audit log)",
            up: r#"
                create table events (
                    id integer primary key,
                    ts text not null default current_timestamp,
                    kind text not null,
                    message text not null,
                    stream_name text
                );
                create index events_ts on events(ts);
            "#,
            down: r#"
                drop index events_ts;
                drop table events;
            "#,
        ),
        migration!(
            "0020", "onvif_enabled flag",
            up: "alter table streams add column onvif_enabled integer not null default 0;",
            down: "",
        ),
        migration!(
            "0021", "detections.zone_id index",
            up: "create index detections_zone on detections(zone_id);",
            down: "drop index detections_zone;",
        ),
        migration!(
            "0022", "rename zones to detection_zones with integer primary key",
            up: r#"
                create table detection_zones (
                    id integer primary key,
                    legacy_uuid text,
                    stream_name text not null references streams(name),
                    points_json text not null,
                    color text,
                    class_filter text,
                    min_confidence real not null default 0.0
                );
                insert into detection_zones
                    (legacy_uuid, stream_name, points_json, color, class_filter, min_confidence)
                    select id, stream_name, points_json, color, class_filter, min_confidence from zones;
                create temp table zone_id_map as
                    select legacy_uuid as old_id, id as new_id from detection_zones where legacy_uuid is not null;
                update detections set zone_id = (
                    select new_id from zone_id_map where old_id = cast(detections.zone_id as text)
                ) where zone_id is not null
                  and exists (select 1 from zone_id_map where old_id = cast(detections.zone_id as text));
                drop table zone_id_map;
                drop table zones;
                create index detection_zones_stream on detection_zones(stream_name);
            "#,
            down: r#"
                create table zones (
                    id text primary key,
                    stream_name text not null references streams(name),
                    points_json text not null,
                    color text,
                    class_filter text,
                    min_confidence real not null default 0.0
                );
                insert into zones (id, stream_name, points_json, color, class_filter, min_confidence)
                    select coalesce(legacy_uuid, lower(hex(randomblob(16)))), stream_name, points_json,
                           color, class_filter, min_confidence
                    from detection_zones;
                drop table detection_zones;
            "#,
        ),
        migration!(
            "0023", "stream detection object filter",
            up: "alter table streams add column detection_object_filter text;",
            down: "",
        ),
        migration!(
            "0024", "stream recording schedule",
            up: "alter table streams add column schedule text;",
            down: "",
        ),
        migration!(
            "0025", "performance indices",
            up: r#"
                create index recordings_trigger_type on recordings(trigger_type);
                create index recordings_protected on recordings(protected);
            "#,
            down: r#"
                drop index recordings_trigger_type;
                drop index recordings_protected;
            "#,
        ),
        migration!(
            "0026", "tiered retention daily stats and storage priority",
            up: r#"
                create table storage_daily_stats (
                    date text not null,
                    stream_name text not null references streams(name),
                    retention_tier integer not null,
                    bytes integer not null default 0,
                    recording_count integer not null default 0,
                    primary key (date, stream_name, retention_tier)
                );
                alter table streams add column storage_priority integer not null default 0;
            "#,
            down: "drop table storage_daily_stats;",
        ),
        migration!(
            "0027", "users with totp and mfa",
            up: r#"
                create table users (
                    id integer primary key,
                    username text unique not null,
                    password_hash text not null,
                    totp_secret text,
                    mfa_enabled integer not null default 0,
                    created_at text not null default current_timestamp
                );
            "#,
            down: "drop table users;",
        ),
        migration!(
            "0028", "sessions with ip tracking",
            up: r#"
                create table sessions (
                    id integer primary key,
                    user_id integer not null references users(id),
                    token_hash text not null,
                    ip_address text,
                    created_at text not null default current_timestamp,
                    expires_at text not null
                );
                create index sessions_user on sessions(user_id);
            "#,
            down: r#"
                drop index sessions_user;
                drop table sessions;
            "#,
        ),
        migration!(
            "0029", "tags replacing group_name, and tag rbac",
            up: r#"
                alter table streams add column tags text;
                update streams set tags = group_name where group_name is not null and group_name != '';
                alter table streams drop column group_name;
                create table user_tag_access (
                    user_id integer not null references users(id),
                    tag text not null,
                    primary key (user_id, tag)
                );
            "#,
            down: r#"
                drop table user_tag_access;
                alter table streams add column group_name text;
                update streams set group_name = substr(tags, 1, case when instr(tags, ',') = 0
                    then length(tags) else instr(tags, ',') - 1 end) where tags is not null and tags != '';
                alter table streams drop column tags;
            "#,
        ),
        migration!(
            "0030", "system_settings key/value store",
            up: r#"
                create table system_settings (
                    key text primary key,
                    value text not null
                );
                insert into system_settings (key, value) values ('setup_complete', '0');
            "#,
            down: "drop table system_settings;",
        ),
    ]
}

/// Reads `<version>.up.sql`/`<version>.down.sql` pairs from a filesystem
/// migrations directory, merged with the embedded set by version (§4.A).
/// A filesystem migration at a version already embedded overrides the
/// embedded one, so deployments can patch a migration without a rebuild.
pub fn load_migrations(dir: Option<&Path>) -> Result<Vec<Migration>, Error> {
    let mut by_version: BTreeMap<String, Migration> = BTreeMap::new();
    for m in embedded_migrations() {
        by_version.insert(m.version.to_string(), m);
    }
    if let Some(dir) = dir {
        if dir.is_dir() {
            let mut versions = std::collections::BTreeSet::new();
            for entry in std::fs::read_dir(dir).map_err(Error::from)? {
                let entry = entry.map_err(Error::from)?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(version) = name.strip_suffix(".up.sql") {
                    versions.insert(version.to_string());
                }
            }
            for version in versions {
                let up = std::fs::read_to_string(dir.join(format!("{version}.up.sql")))
                    .map_err(Error::from)?;
                let down = std::fs::read_to_string(dir.join(format!("{version}.down.sql")))
                    .unwrap_or_default();
                by_version.insert(
                    version.clone(),
                    Migration {
                        version: Box::leak(version.into_boxed_str()),
                        description: "filesystem migration",
                        up: Box::leak(up.into_boxed_str()),
                        down: Box::leak(down.into_boxed_str()),
                    },
                );
            }
        }
    }
    Ok(by_version.into_values().collect())
}

const SCHEMA_MIGRATIONS_TABLE: &str = r#"
    create table if not exists schema_migrations (
        version text primary key,
        applied_at text not null default current_timestamp
    );
"#;

/// Applies every pending migration in `migrations` (already sorted by
/// version) in order, one transaction per version. Returns the versions
/// actually applied (may be empty if the database was already current).
///
/// On any failure the in-progress migration's transaction rolls back and
/// the error propagates; no partial version is recorded (§4.A, §7 Schema
/// errors are fatal at startup).
pub fn apply_pending(
    conn: &mut rusqlite::Connection,
    migrations: &[Migration],
) -> Result<Vec<String>, Error> {
    conn.execute_batch(SCHEMA_MIGRATIONS_TABLE)?;
    let applied: std::collections::HashSet<String> = {
        let mut stmt = conn.prepare("select version from schema_migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut newly_applied = Vec::new();
    for m in migrations {
        if applied.contains(m.version) {
            continue; // duplicate-apply is idempotent.
        }
        let tx = conn.transaction()?;
        tx.execute_batch(m.up).map_err(|e| {
            err!(
                Internal,
                msg("migration {} ({}) failed", m.version, m.description),
                source(e)
            )
        })?;
        tx.execute(
            "insert into schema_migrations (version) values (?1)",
            rusqlite::params![m.version],
        )?;
        tx.commit()?;
        newly_applied.push(m.version.to_string());
    }
    Ok(newly_applied)
}

/// Rolls back the `n` most recently applied versions, in reverse order
/// (§4.A `down N`). A version whose `down` is empty is accepted as a no-op
/// rollback of schema state; only the `schema_migrations` row is removed.
pub fn apply_down(
    conn: &mut rusqlite::Connection,
    migrations: &[Migration],
    n: usize,
) -> Result<Vec<String>, Error> {
    let by_version: BTreeMap<&str, &Migration> =
        migrations.iter().map(|m| (m.version, m)).collect();
    let applied: Vec<String> = {
        let mut stmt =
            conn.prepare("select version from schema_migrations order by version desc limit ?1")?;
        let rows = stmt.query_map(rusqlite::params![n as i64], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut rolled_back = Vec::new();
    for version in applied {
        let m = by_version.get(version.as_str()).ok_or_else(|| {
            err!(
                FailedPrecondition,
                msg("no migration definition for applied version {version}")
            )
        })?;
        let tx = conn.transaction()?;
        if !m.down.is_empty() {
            tx.execute_batch(m.down).map_err(|e| {
                err!(Internal, msg("down-migration {version} failed"), source(e))
            })?;
        }
        tx.execute(
            "delete from schema_migrations where version = ?1",
            rusqlite::params![version],
        )?;
        tx.commit()?;
        rolled_back.push(version);
    }
    Ok(rolled_back)
}

/// Returns the currently applied version set, for `GET /health`'s `db_version`
/// and the `0008`/`0022` zones-shape detection at runtime.
pub fn applied_versions(conn: &rusqlite::Connection) -> Result<Vec<String>, Error> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare("select version from schema_migrations order by version")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn table_exists(conn: &rusqlite::Connection, name: &str) -> Result<bool, Error> {
    Ok(conn
        .query_row(
            "select 1 from sqlite_master where type = 'table' and name = ?1",
            rusqlite::params![name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

use rusqlite::OptionalExtension;

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("pragma foreign_keys = on;").unwrap();
        conn
    }

    #[test]
    fn apply_all_then_check_contract_columns() {
        let mut conn = fresh_conn();
        let migrations = embedded_migrations();
        let applied = apply_pending(&mut conn, &migrations).unwrap();
        assert_eq!(applied.len(), migrations.len());

        // streams.tags exists, group_name does not (S4).
        let cols = column_names(&conn, "streams");
        assert!(cols.contains(&"tags".to_string()));
        assert!(!cols.contains(&"group_name".to_string()));

        // recordings.trigger_type exists with default scheduled.
        conn.execute(
            "insert into streams (name, source_url) values ('cam1', 'rtsp://x')",
            [],
        )
        .unwrap();
        conn.execute(
            "insert into recordings (stream_name, file_path, start_time) values ('cam1', '/x.mp4', 't0')",
            [],
        )
        .unwrap();
        let trigger: String = conn
            .query_row(
                "select trigger_type from recordings limit 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(trigger, "scheduled");

        let setup_complete: String = conn
            .query_row(
                "select value from system_settings where key = 'setup_complete'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(setup_complete, "0");
    }

    #[test]
    fn idempotent_reapply() {
        let mut conn = fresh_conn();
        let migrations = embedded_migrations();
        apply_pending(&mut conn, &migrations).unwrap();
        let second = apply_pending(&mut conn, &migrations).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn down_one_drops_system_settings() {
        let mut conn = fresh_conn();
        let migrations = embedded_migrations();
        apply_pending(&mut conn, &migrations).unwrap();
        let rolled_back = apply_down(&mut conn, &migrations, 1).unwrap();
        assert_eq!(rolled_back, vec!["0030"]);
        assert!(!table_exists(&conn, "system_settings").unwrap());
        let versions = applied_versions(&conn).unwrap();
        assert_eq!(versions.last().unwrap(), "0029");
    }

    #[test]
    fn up_then_down_then_up_matches() {
        let mut conn = fresh_conn();
        let migrations = embedded_migrations();
        apply_pending(&mut conn, &migrations).unwrap();
        let hash_before = schema_hash(&conn);
        apply_down(&mut conn, &migrations, 3).unwrap();
        apply_pending(&mut conn, &migrations).unwrap();
        let hash_after = schema_hash(&conn);
        assert_eq!(hash_before, hash_after);
    }

    fn column_names(conn: &rusqlite::Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("pragma table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn schema_hash(conn: &rusqlite::Connection) -> String {
        let mut stmt = conn
            .prepare("select group_concat(sql, ';') from sqlite_master where sql is not null order by name")
            .unwrap();
        stmt.query_row([], |row| row.get::<_, Option<String>>(0))
            .unwrap()
            .unwrap_or_default()
    }
}
