// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.

use std::time::Duration;

use base::Error;
use itertools::Itertools as _;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, types::ToSql};
use tracing::warn;

use crate::db::{Event, Recording, RecordingQuery, Stream, TriggerType};

const RECORDING_COLUMNS: &str = "\
    id, stream_name, file_path, start_time, end_time, size_bytes, \
    codec, width, height, fps, is_complete, trigger_type, protected, \
    retention_days_override";

const STREAM_COLUMNS: &str = "\
    id, name, url, enabled, segment_duration, transport, record_audio, \
    streaming_enabled, record, retention_days, detection_enabled, \
    detection_sensitivity, detection_grid_size, detection_cooldown_seconds, \
    detection_retention_days, pre_buffer_seconds, post_buffer_seconds, \
    onvif_username, onvif_password, onvif_profile";

/// Maximum attempts for a mutation that hits `SQLITE_BUSY`.
const MAX_BUSY_ATTEMPTS: u32 = 5;

/// Runs `f`, retrying with bounded backoff while SQLite reports busy.
pub(crate) fn retry_if_busy<T>(
    mut f: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, rusqlite::Error> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                    && attempt + 1 < MAX_BUSY_ATTEMPTS =>
            {
                attempt += 1;
                warn!(
                    attempt,
                    msg = msg.as_deref().unwrap_or(""),
                    "database busy; retrying"
                );
                std::thread::sleep(Duration::from_millis(100 << attempt));
            }
            r => return r,
        }
    }
}

/// Returns whether `table` has a column named `column`.
pub(crate) fn has_column(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
) -> Result<bool, Error> {
    let n: i64 = conn.query_row(
        "select count(*) from pragma_table_info(?) where name = ?",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn recording_from_row(row: &rusqlite::Row) -> Result<Recording, rusqlite::Error> {
    let trigger: Option<String> = row.get(11)?;
    Ok(Recording {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        size_bytes: row.get(5)?,
        codec: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        fps: row.get(9)?,
        is_complete: row.get(10)?,
        // Rows predating schema version 10 have no trigger type.
        trigger_type: trigger
            .as_deref()
            .and_then(TriggerType::parse)
            .unwrap_or(TriggerType::Scheduled),
        protected: row.get(12)?,
        retention_days_override: row.get(13)?,
    })
}

pub(crate) fn get_recording_by_id(
    conn: &rusqlite::Connection,
    id: i64,
) -> Result<Option<Recording>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "select {RECORDING_COLUMNS} from recordings where id = ?"
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(recording_from_row(row)?)),
        None => Ok(None),
    }
}

/// Returns the id of the uncompleted recording for `stream_name`, if any.
pub(crate) fn uncompleted_recording(
    conn: &rusqlite::Connection,
    stream_name: &str,
) -> Result<Option<i64>, Error> {
    let mut stmt = conn.prepare_cached(
        "select id from recordings where stream_name = ? and is_complete = 0 limit 1",
    )?;
    let mut rows = stmt.query(params![stream_name])?;
    Ok(rows.next()?.map(|row| row.get(0)).transpose()?)
}

pub(crate) fn query_recordings(
    conn: &rusqlite::Connection,
    q: &RecordingQuery,
) -> Result<Vec<Recording>, Error> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Box<dyn ToSql>> = Vec::new();
    if let Some(s) = &q.stream_name {
        clauses.push("stream_name = ?");
        binds.push(Box::new(s.clone()));
    }
    if let Some(r) = &q.time_range {
        // Overlap: started before the range ends, and either still open or
        // ended after the range starts.
        clauses.push("start_time < ?");
        binds.push(Box::new(r.end));
        clauses.push("(end_time > ? or is_complete = 0)");
        binds.push(Box::new(r.start));
    }
    if let Some(t) = q.trigger_type {
        clauses.push("trigger_type = ?");
        binds.push(Box::new(t.as_str()));
    }
    if let Some(c) = q.is_complete {
        clauses.push("is_complete = ?");
        binds.push(Box::new(c));
    }
    if let Some(p) = q.protected {
        clauses.push("protected = ?");
        binds.push(Box::new(p));
    }
    let mut sql = format!("select {RECORDING_COLUMNS} from recordings");
    if !clauses.is_empty() {
        sql.push_str(" where ");
        sql.push_str(&clauses.iter().join(" and "));
    }
    sql.push_str(if q.descending {
        " order by start_time desc, id desc"
    } else {
        " order by start_time, id"
    });
    if let Some(limit) = q.limit {
        sql.push_str(" limit ?");
        binds.push(Box::new(limit));
    }
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(recording_from_row(row)?);
    }
    Ok(out)
}

fn event_from_row(row: &rusqlite::Row) -> Result<Event, rusqlite::Error> {
    Ok(Event {
        id: row.get(0)?,
        kind: row.get(1)?,
        timestamp: row.get(2)?,
        stream_name: row.get(3)?,
        description: row.get(4)?,
        details: row.get(5)?,
    })
}

pub(crate) fn list_events(
    conn: &rusqlite::Connection,
    stream_name: Option<&str>,
    limit: u32,
) -> Result<Vec<Event>, Error> {
    let mut out = Vec::new();
    let sql_all = "select id, type, timestamp, stream_name, description, details \
                   from events order by timestamp desc, id desc limit ?";
    let sql_stream = "select id, type, timestamp, stream_name, description, details \
                      from events where stream_name = ? \
                      order by timestamp desc, id desc limit ?";
    match stream_name {
        None => {
            let mut stmt = conn.prepare_cached(sql_all)?;
            let mut rows = stmt.query(params![limit])?;
            while let Some(row) = rows.next()? {
                out.push(event_from_row(row)?);
            }
        }
        Some(s) => {
            let mut stmt = conn.prepare_cached(sql_stream)?;
            let mut rows = stmt.query(params![s, limit])?;
            while let Some(row) = rows.next()? {
                out.push(event_from_row(row)?);
            }
        }
    }
    Ok(out)
}

fn stream_from_row(row: &rusqlite::Row) -> Result<Stream, rusqlite::Error> {
    let transport: String = row.get(5)?;
    Ok(Stream {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get(3)?,
        segment_duration: row.get(4)?,
        transport: crate::db::Transport::parse(&transport)
            .unwrap_or(crate::db::Transport::Tcp),
        record_audio: row.get(6)?,
        streaming_enabled: row.get(7)?,
        record: row.get(8)?,
        retention_days: row.get(9)?,
        detection_enabled: row.get(10)?,
        detection_sensitivity: row.get(11)?,
        detection_grid_size: row.get(12)?,
        detection_cooldown_seconds: row.get(13)?,
        detection_retention_days: row.get(14)?,
        pre_buffer_seconds: row.get(15)?,
        post_buffer_seconds: row.get(16)?,
        onvif_username: row.get(17)?,
        onvif_password: row.get(18)?,
        onvif_profile: row.get(19)?,
    })
}

pub(crate) fn get_stream(
    conn: &rusqlite::Connection,
    name: &str,
) -> Result<Option<Stream>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "select {STREAM_COLUMNS} from streams where name = ?"
    ))?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(stream_from_row(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn list_streams(conn: &rusqlite::Connection) -> Result<Vec<Stream>, Error> {
    let mut stmt =
        conn.prepare_cached(&format!("select {STREAM_COLUMNS} from streams order by name"))?;
    let mut rows = stmt.query(params![])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(stream_from_row(row)?);
    }
    Ok(out)
}
