// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the database schema.
//!
//! Each step takes the schema from version `i` to `i+1` inside a single
//! transaction which also advances the `schema_version` cursor; a failure
//! rolls back and leaves the database at version `i`. Column additions probe
//! for the column first, so replaying a step against an already-upgraded
//! table is harmless.

use base::{bail, Error};
use rusqlite::params;
use tracing::info;

use crate::raw;

mod v12_to_v13;

/// Expected (compiled-in maximum) schema version.
pub const EXPECTED_SCHEMA_VERSION: i32 = 16;

type Step = fn(&rusqlite::Transaction) -> Result<(), Error>;

/// Steps indexed by the version they upgrade *from*; `STEPS[0]` takes an
/// empty database to version 1.
const STEPS: [Step; EXPECTED_SCHEMA_VERSION as usize] = [
    v0_to_v1,
    v1_to_v2,
    v2_to_v3,
    v3_to_v4,
    v4_to_v5,
    v5_to_v6,
    v6_to_v7,
    v7_to_v8,
    v8_to_v9,
    v9_to_v10,
    v10_to_v11,
    v11_to_v12,
    v12_to_v13::run,
    v13_to_v14,
    v14_to_v15,
    v15_to_v16,
];

/// Returns the schema version, or 0 for a database with no `schema_version`
/// table (including a freshly created file).
pub fn get_version(conn: &rusqlite::Connection) -> Result<i32, Error> {
    let tables: i32 = conn.query_row(
        "select count(*) from sqlite_master where type = 'table' and name = 'schema_version'",
        params![],
        |row| row.get(0),
    )?;
    if tables == 0 {
        return Ok(0);
    }
    let ver = conn
        .query_row(
            "select version from schema_version where id = 1",
            params![],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e),
        })?;
    Ok(ver.unwrap_or(0))
}

/// Runs all migration steps from the current version through
/// [`EXPECTED_SCHEMA_VERSION`], returning the resulting version.
///
/// A database at or above the compiled-in maximum is left untouched.
pub fn run(conn: &mut rusqlite::Connection, now: i64) -> Result<i32, Error> {
    let old_ver = get_version(conn)?;
    if old_ver >= EXPECTED_SCHEMA_VERSION {
        if old_ver > EXPECTED_SCHEMA_VERSION {
            info!(
                "database is at schema version {old_ver}, newer than compiled \
                 {EXPECTED_SCHEMA_VERSION}; leaving it untouched"
            );
        }
        return Ok(old_ver);
    }
    info!("upgrading database from schema version {old_ver} to {EXPECTED_SCHEMA_VERSION}");
    for ver in old_ver..EXPECTED_SCHEMA_VERSION {
        let tx = conn.transaction()?;
        let cur = get_version(&tx)?;
        if cur != ver {
            bail!(
                FailedPrecondition,
                msg("schema version changed mid-upgrade: expected {ver}, found {cur}")
            );
        }
        STEPS[ver as usize](&tx)?;
        tx.execute(
            "insert into schema_version (id, version, updated_at) values (1, ?1, ?2) \
             on conflict (id) do update set version = ?1, updated_at = ?2",
            params![ver + 1, now],
        )?;
        tx.commit()?;
        info!("...now at schema version {}", ver + 1);
    }
    Ok(EXPECTED_SCHEMA_VERSION)
}

/// Adds a column unless it already exists.
fn add_column(
    tx: &rusqlite::Transaction,
    table: &str,
    column: &str,
    spec: &str,
) -> Result<(), Error> {
    if raw::has_column(tx, table, column)? {
        return Ok(());
    }
    tx.execute_batch(&format!("alter table {table} add column {column} {spec}"))?;
    Ok(())
}

fn v0_to_v1(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(include_str!("v1.sql"))?;
    Ok(())
}

fn v1_to_v2(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(
        "create index if not exists recordings_stream_start \
         on recordings (stream_name, start_time)",
    )?;
    Ok(())
}

fn v2_to_v3(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "transport", "text not null default 'tcp'")
}

fn v3_to_v4(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "record_audio", "integer not null default 0")
}

fn v4_to_v5(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "recordings", "codec", "text")?;
    add_column(tx, "recordings", "width", "integer")?;
    add_column(tx, "recordings", "height", "integer")?;
    add_column(tx, "recordings", "fps", "integer")
}

fn v5_to_v6(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "streaming_enabled", "integer not null default 1")?;
    add_column(tx, "streams", "record", "integer not null default 1")
}

fn v6_to_v7(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "retention_days", "integer not null default 7")
}

fn v7_to_v8(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "events", "details", "text")?;
    tx.execute_batch("create index if not exists events_timestamp on events (timestamp)")?;
    Ok(())
}

fn v8_to_v9(tx: &rusqlite::Transaction) -> Result<(), Error> {
    if !raw::has_column(tx, "recordings", "is_complete")? {
        tx.execute_batch(
            "alter table recordings add column is_complete integer not null default 0; \
             update recordings set is_complete = 1 where end_time > 0;",
        )?;
    }
    Ok(())
}

fn v9_to_v10(tx: &rusqlite::Transaction) -> Result<(), Error> {
    // Rows written before this version have no trigger type; readers treat
    // the absent value as 'scheduled', matching this default.
    add_column(
        tx,
        "recordings",
        "trigger_type",
        "text not null default 'scheduled'",
    )
}

fn v10_to_v11(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "detection_enabled", "integer not null default 0")?;
    add_column(
        tx,
        "streams",
        "detection_sensitivity",
        "real not null default 0.25",
    )?;
    add_column(tx, "streams", "detection_grid_size", "integer not null default 8")
}

fn v11_to_v12(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "pre_buffer_seconds", "integer not null default 5")?;
    add_column(tx, "streams", "post_buffer_seconds", "integer not null default 10")?;
    add_column(
        tx,
        "streams",
        "detection_cooldown_seconds",
        "integer not null default 3",
    )
}

fn v13_to_v14(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(
        tx,
        "streams",
        "detection_retention_days",
        "integer not null default 30",
    )?;
    add_column(tx, "recordings", "protected", "integer not null default 0")
}

fn v14_to_v15(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "onvif_username", "text")?;
    add_column(tx, "streams", "onvif_password", "text")
}

fn v15_to_v16(tx: &rusqlite::Transaction) -> Result<(), Error> {
    add_column(tx, "streams", "onvif_profile", "text")?;
    add_column(tx, "recordings", "retention_days_override", "integer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::FastHashMap;

    fn new_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("pragma foreign_keys = on").unwrap();
        conn
    }

    /// Returns `table name -> sorted column names` for every user table.
    fn columns(conn: &rusqlite::Connection) -> FastHashMap<String, Vec<String>> {
        let mut out = FastHashMap::default();
        let mut stmt = conn
            .prepare(
                "select name from sqlite_master \
                 where type = 'table' and name not like 'sqlite_%'",
            )
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        for t in tables {
            let mut stmt = conn
                .prepare("select name from pragma_table_info(?)")
                .unwrap();
            let mut cols: Vec<String> = stmt
                .query_map([&t], |row| row.get(0))
                .unwrap()
                .map(Result::unwrap)
                .collect();
            cols.sort();
            out.insert(t, cols);
        }
        out
    }

    fn index_names(conn: &rusqlite::Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "select name from sqlite_master \
                 where type = 'index' and name not like 'sqlite_%' order by name",
            )
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn from_empty() {
        testutil::init();
        let mut conn = new_conn();
        assert_eq!(run(&mut conn, 1_600_000_000).unwrap(), 16);
        assert_eq!(get_version(&conn).unwrap(), 16);
        assert!(raw::has_column(&conn, "streams", "onvif_profile").unwrap());
    }

    #[test]
    fn idempotent() {
        testutil::init();
        let mut conn = new_conn();
        run(&mut conn, 1_600_000_000).unwrap();
        let first = columns(&conn);
        assert_eq!(run(&mut conn, 1_600_000_999).unwrap(), 16);
        assert_eq!(columns(&conn), first);
        assert_eq!(get_version(&conn).unwrap(), 16);
    }

    #[test]
    fn matches_fresh_schema() {
        testutil::init();
        let mut upgraded = new_conn();
        run(&mut upgraded, 1_600_000_000).unwrap();

        let fresh = new_conn();
        fresh.execute_batch(include_str!("../schema.sql")).unwrap();

        assert_eq!(columns(&upgraded), columns(&fresh));
        assert_eq!(index_names(&upgraded), index_names(&fresh));
    }

    #[test]
    fn upgrade_preserves_old_rows() {
        testutil::init();
        let mut conn = new_conn();

        // Stop at version 8 (before `is_complete` and `trigger_type`) and
        // write rows the way that era would have.
        {
            let tx = conn.transaction().unwrap();
            for step in &STEPS[..8] {
                step(&tx).unwrap();
            }
            tx.execute(
                "insert into schema_version (id, version, updated_at) values (1, 8, 0)",
                [],
            )
            .unwrap();
            tx.execute_batch(
                "insert into streams (name, url) values ('front', 'rtsp://cam/main'); \
                 insert into recordings (stream_name, file_path, start_time, end_time, size_bytes) \
                     values ('front', '/rec/front/a.mp4', 1000, 1060, 4096); \
                 insert into events (type, timestamp, description, severity) \
                     values ('recording_stop', 1060, 'closed', 2);",
            )
            .unwrap();
            tx.commit().unwrap();
        }

        assert_eq!(run(&mut conn, 1_600_000_000).unwrap(), 16);

        // The recording picked up `is_complete` backfill and the
        // `trigger_type` default.
        let (complete, trigger): (bool, String) = conn
            .query_row(
                "select is_complete, trigger_type from recordings where stream_name = 'front'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(complete);
        assert_eq!(trigger, "scheduled");

        // The event survived the severity-dropping rebuild.
        let desc: String = conn
            .query_row(
                "select description from events where type = 'recording_stop'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(desc, "closed");
        assert!(!raw::has_column(&conn, "events", "severity").unwrap());
    }
}
