// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording metadata store.
//!
//! One SQLite database per installation, at `<storage>/lightnvr.db`, in WAL
//! mode with `synchronous = NORMAL`. All access goes through a process-wide
//! mutex ([`Database::lock`]): one writer at a time, which is also the
//! simplest way to honor SQLite's single-writer nature. Recorders keep their
//! hot path out of this lock by preparing rows before I/O.
//!
//! Opening runs an integrity check and, if that fails, a one-shot restore
//! from the `.bak` sibling. Every open ends with the compiled-in migrations
//! (see [`crate::upgrade`]) replayed up to the current version.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use base::clock::{self, Clocks};
use base::{bail, err, Error};
use rusqlite::params;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::raw;
use crate::upgrade;

/// On-disk basename of the metadata store.
pub const DB_FILENAME: &str = "lightnvr.db";

/// The cause of a recording row.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
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

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => TriggerType::Scheduled,
            "motion" => TriggerType::Motion,
            "detection" => TriggerType::Detection,
            "manual" => TriggerType::Manual,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Types appended to the event log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    RecordingStart,
    RecordingStop,
    MotionBegin,
    MotionEnd,
    StreamAdded,
    StreamRemoved,
    Startup,
    Shutdown,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RecordingStart => "recording_start",
            EventType::RecordingStop => "recording_stop",
            EventType::MotionBegin => "motion_begin",
            EventType::MotionEnd => "motion_end",
            EventType::StreamAdded => "stream_added",
            EventType::StreamRemoved => "stream_removed",
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
            EventType::Error => "error",
        }
    }
}

/// A row in the `recordings` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,

    /// Seconds since epoch, assigned when the first keyframe is written.
    pub start_time: i64,

    /// Seconds since epoch; 0 until the recording is finalized.
    pub end_time: i64,

    pub size_bytes: i64,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub is_complete: bool,
    pub trigger_type: TriggerType,
    pub protected: bool,
    pub retention_days_override: Option<u32>,
}

/// Fields supplied when creating a recording row; everything else starts at
/// its open-recording default (`end_time = 0`, `is_complete = false`).
#[derive(Clone, Debug)]
pub struct RecordingToInsert {
    pub stream_name: String,
    pub file_path: String,
    pub start_time: i64,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub trigger_type: TriggerType,
}

/// Partial update applied to a recording row.
#[derive(Clone, Debug, Default)]
pub struct RecordingUpdate {
    pub end_time: Option<i64>,
    pub size_bytes: Option<i64>,
    pub is_complete: Option<bool>,
}

/// Filters for [`LockedDatabase::query_recordings`].
#[derive(Clone, Debug, Default)]
pub struct RecordingQuery {
    pub stream_name: Option<String>,
    pub time_range: Option<std::ops::Range<i64>>,
    pub trigger_type: Option<TriggerType>,
    pub is_complete: Option<bool>,
    pub protected: Option<bool>,
    pub descending: bool,
    pub limit: Option<u32>,
}

/// A row in the append-only `events` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub id: i64,

    /// The raw type string; rows written by this binary use
    /// [`EventType::as_str`] values, but unknown types are preserved.
    pub kind: String,

    pub timestamp: i64,
    pub stream_name: Option<String>,
    pub description: String,
    pub details: Option<String>,
}

/// Source transport preference.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            _ => return None,
        })
    }
}

/// A row in the `streams` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Stream {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub segment_duration: u32,
    pub transport: Transport,
    pub record_audio: bool,
    pub streaming_enabled: bool,
    pub record: bool,
    pub retention_days: u32,
    pub detection_enabled: bool,
    pub detection_sensitivity: f64,
    pub detection_grid_size: u32,
    pub detection_cooldown_seconds: u32,
    pub detection_retention_days: u32,
    pub pre_buffer_seconds: u32,
    pub post_buffer_seconds: u32,
    pub onvif_username: Option<String>,
    pub onvif_password: Option<String>,
    pub onvif_profile: Option<String>,
}

/// Fields for creating or replacing a stream row.
#[derive(Clone, Debug)]
pub struct StreamChange {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub segment_duration: u32,
    pub transport: Transport,
    pub record_audio: bool,
    pub streaming_enabled: bool,
    pub record: bool,
    pub retention_days: u32,
    pub detection_enabled: bool,
    pub detection_sensitivity: f64,
    pub detection_grid_size: u32,
    pub detection_cooldown_seconds: u32,
    pub detection_retention_days: u32,
    pub pre_buffer_seconds: u32,
    pub post_buffer_seconds: u32,
    pub onvif_username: Option<String>,
    pub onvif_password: Option<String>,
    pub onvif_profile: Option<String>,
}

impl Default for StreamChange {
    fn default() -> Self {
        StreamChange {
            name: String::new(),
            url: String::new(),
            enabled: true,
            segment_duration: 60,
            transport: Transport::Tcp,
            record_audio: false,
            streaming_enabled: true,
            record: true,
            retention_days: 7,
            detection_enabled: false,
            detection_sensitivity: 0.25,
            detection_grid_size: 8,
            detection_cooldown_seconds: 3,
            detection_retention_days: 30,
            pre_buffer_seconds: 5,
            post_buffer_seconds: 10,
            onvif_username: None,
            onvif_password: None,
            onvif_profile: None,
        }
    }
}

/// Validates a stream name: 1–63 printable characters, no slashes. The name
/// doubles as an on-disk directory component.
pub fn validate_stream_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 63 {
        bail!(
            InvalidArgument,
            msg("stream name must be 1-63 characters, got {}", name.len())
        );
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || (!c.is_ascii_graphic() && c != ' '))
    {
        bail!(
            InvalidArgument,
            msg("stream name {name:?} has non-printable characters or slashes")
        );
    }
    Ok(())
}

fn backup_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn open_conn(path: &Path) -> Result<rusqlite::Connection, Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("pragma foreign_keys = on")?;
    let mode: String = conn.query_row("pragma journal_mode = wal", params![], |row| row.get(0))?;
    if mode != "wal" && mode != "memory" {
        bail!(
            FailedPrecondition,
            msg("unable to enable write-ahead logging; journal_mode is {mode}")
        );
    }
    // NORMAL: durable across process crash; an OS crash may lose the tail of
    // the WAL but never corrupts.
    conn.execute_batch("pragma synchronous = normal")?;
    Ok(conn)
}

fn integrity_check_conn(conn: &rusqlite::Connection) -> Result<(), Error> {
    let mut stmt = conn.prepare("pragma integrity_check")?;
    let mut rows = stmt.query(params![])?;
    let mut problems = Vec::new();
    while let Some(row) = rows.next()? {
        let s: String = row.get(0)?;
        if s != "ok" {
            problems.push(s);
        }
    }
    if !problems.is_empty() {
        bail!(
            DataLoss,
            msg("integrity check failed: {}", problems.join("; "))
        );
    }
    Ok(())
}

/// Initializes a fresh database with the current schema. The migration
/// steps produce the same shape for databases that predate it.
pub fn init(conn: &mut rusqlite::Connection, now: i64) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))?;
    tx.execute(
        "insert into schema_version (id, version, updated_at) values (1, ?, ?)",
        params![upgrade::EXPECTED_SCHEMA_VERSION, now],
    )?;
    tx.commit()?;
    Ok(())
}

/// Replaces the database file at `db_path` with `source`, removing any stale
/// WAL sidecars. Must be called with the database closed.
pub fn restore(db_path: &Path, source: &Path) -> Result<(), Error> {
    if !source.exists() {
        bail!(NotFound, msg("backup {} does not exist", source.display()));
    }
    for suffix in ["-wal", "-shm"] {
        let p = sidecar(db_path, suffix);
        if p.exists() {
            std::fs::remove_file(&p)?;
        }
    }
    let tmp = sidecar(db_path, ".restore-tmp");
    std::fs::copy(source, &tmp)?;
    std::fs::File::open(&tmp)?.sync_all()?;
    std::fs::rename(&tmp, db_path)?;
    if let Some(parent) = db_path.parent() {
        std::fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// The state guarded by [`Database`]'s mutex.
pub struct LockedDatabase {
    conn: rusqlite::Connection,

    /// `None` for in-memory databases (tests); backup requires a path.
    path: Option<PathBuf>,

    /// Identifies this open of the database, for event details.
    open_id: Uuid,
}

impl LockedDatabase {
    pub fn open_id(&self) -> Uuid {
        self.open_id
    }

    pub fn get_schema_version(&self) -> Result<i32, Error> {
        upgrade::get_version(&self.conn)
    }

    /// Creates a recording row; `is_complete` starts false.
    ///
    /// Fails `FailedPrecondition` if the stream already has an uncompleted
    /// recording: at most one may exist per stream at any instant.
    pub fn add_recording(&mut self, r: &RecordingToInsert) -> Result<i64, Error> {
        if let Some(existing) = raw::uncompleted_recording(&self.conn, &r.stream_name)? {
            bail!(
                FailedPrecondition,
                msg(
                    "stream {} already has uncompleted recording {}",
                    r.stream_name,
                    existing
                )
            );
        }
        raw::retry_if_busy(|| {
            self.conn.execute(
                "insert into recordings (stream_name, file_path, start_time, codec, \
                                         width, height, fps, trigger_type) \
                 values (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    r.stream_name,
                    r.file_path,
                    r.start_time,
                    r.codec,
                    r.width,
                    r.height,
                    r.fps,
                    r.trigger_type.as_str(),
                ],
            )
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_recording(&mut self, id: i64, u: &RecordingUpdate) -> Result<(), Error> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(e) = u.end_time {
            sets.push("end_time = ?");
            binds.push(Box::new(e));
        }
        if let Some(s) = u.size_bytes {
            sets.push("size_bytes = ?");
            binds.push(Box::new(s));
        }
        if let Some(c) = u.is_complete {
            sets.push("is_complete = ?");
            binds.push(Box::new(c));
        }
        if sets.is_empty() {
            return Ok(());
        }
        let sql = format!("update recordings set {} where id = ?", sets.join(", "));
        binds.push(Box::new(id));
        let rows = raw::retry_if_busy(|| {
            self.conn.execute(
                &sql,
                rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
            )
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no recording with id {id}"));
        }
        Ok(())
    }

    /// Removes a recording row. The caller is responsible for unlinking the
    /// file.
    pub fn delete_recording(&mut self, id: i64) -> Result<(), Error> {
        let rows = raw::retry_if_busy(|| {
            self.conn
                .execute("delete from recordings where id = ?", params![id])
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no recording with id {id}"));
        }
        Ok(())
    }

    pub fn get_recording_by_id(&self, id: i64) -> Result<Recording, Error> {
        raw::get_recording_by_id(&self.conn, id)?
            .ok_or_else(|| err!(NotFound, msg("no recording with id {id}")))
    }

    pub fn query_recordings(&self, q: &RecordingQuery) -> Result<Vec<Recording>, Error> {
        raw::query_recordings(&self.conn, q)
    }

    pub fn add_event(
        &mut self,
        when: i64,
        kind: EventType,
        stream_name: Option<&str>,
        description: &str,
        details: Option<&str>,
    ) -> Result<i64, Error> {
        raw::retry_if_busy(|| {
            self.conn.execute(
                "insert into events (type, timestamp, stream_name, description, details) \
                 values (?, ?, ?, ?, ?)",
                params![kind.as_str(), when, stream_name, description, details],
            )
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Deletes events with `timestamp < cutoff`; returns how many.
    pub fn delete_events_older_than(&mut self, cutoff: i64) -> Result<usize, Error> {
        let rows = raw::retry_if_busy(|| {
            self.conn
                .execute("delete from events where timestamp < ?", params![cutoff])
        })?;
        Ok(rows)
    }

    pub fn list_events(
        &self,
        stream_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Event>, Error> {
        raw::list_events(&self.conn, stream_name, limit)
    }

    pub fn add_stream(&mut self, c: &StreamChange) -> Result<i64, Error> {
        validate_stream_name(&c.name)?;
        raw::retry_if_busy(|| {
            self.conn.execute(
                "insert into streams (name, url, enabled, segment_duration, transport, \
                     record_audio, streaming_enabled, record, retention_days, \
                     detection_enabled, detection_sensitivity, detection_grid_size, \
                     detection_cooldown_seconds, detection_retention_days, \
                     pre_buffer_seconds, post_buffer_seconds, \
                     onvif_username, onvif_password, onvif_profile) \
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    c.name,
                    c.url,
                    c.enabled,
                    c.segment_duration,
                    c.transport.as_str(),
                    c.record_audio,
                    c.streaming_enabled,
                    c.record,
                    c.retention_days,
                    c.detection_enabled,
                    c.detection_sensitivity,
                    c.detection_grid_size,
                    c.detection_cooldown_seconds,
                    c.detection_retention_days,
                    c.pre_buffer_seconds,
                    c.post_buffer_seconds,
                    c.onvif_username,
                    c.onvif_password,
                    c.onvif_profile,
                ],
            )
        })?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_stream(&mut self, name: &str, c: &StreamChange) -> Result<(), Error> {
        validate_stream_name(&c.name)?;
        let rows = raw::retry_if_busy(|| {
            self.conn.execute(
                "update streams set name = ?, url = ?, enabled = ?, segment_duration = ?, \
                     transport = ?, record_audio = ?, streaming_enabled = ?, record = ?, \
                     retention_days = ?, detection_enabled = ?, detection_sensitivity = ?, \
                     detection_grid_size = ?, detection_cooldown_seconds = ?, \
                     detection_retention_days = ?, pre_buffer_seconds = ?, \
                     post_buffer_seconds = ?, onvif_username = ?, onvif_password = ?, \
                     onvif_profile = ? \
                 where name = ?",
                params![
                    c.name,
                    c.url,
                    c.enabled,
                    c.segment_duration,
                    c.transport.as_str(),
                    c.record_audio,
                    c.streaming_enabled,
                    c.record,
                    c.retention_days,
                    c.detection_enabled,
                    c.detection_sensitivity,
                    c.detection_grid_size,
                    c.detection_cooldown_seconds,
                    c.detection_retention_days,
                    c.pre_buffer_seconds,
                    c.post_buffer_seconds,
                    c.onvif_username,
                    c.onvif_password,
                    c.onvif_profile,
                    name,
                ],
            )
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no stream named {name:?}"));
        }
        Ok(())
    }

    pub fn delete_stream(&mut self, name: &str) -> Result<(), Error> {
        let rows = raw::retry_if_busy(|| {
            self.conn
                .execute("delete from streams where name = ?", params![name])
        })?;
        if rows == 0 {
            bail!(NotFound, msg("no stream named {name:?}"));
        }
        Ok(())
    }

    pub fn get_stream(&self, name: &str) -> Result<Stream, Error> {
        raw::get_stream(&self.conn, name)?
            .ok_or_else(|| err!(NotFound, msg("no stream named {name:?}")))
    }

    pub fn list_streams(&self) -> Result<Vec<Stream>, Error> {
        raw::list_streams(&self.conn)
    }

    pub fn integrity_check(&self) -> Result<(), Error> {
        integrity_check_conn(&self.conn)
    }

    pub fn vacuum(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("vacuum")?;
        Ok(())
    }

    /// Fully checkpoints the write-ahead log.
    pub fn checkpoint_wal(&self) -> Result<(), Error> {
        let busy: i64 = self.conn.query_row(
            "pragma wal_checkpoint(truncate)",
            params![],
            |row| row.get(0),
        )?;
        if busy != 0 {
            warn!("wal checkpoint could not complete; readers still active");
        }
        Ok(())
    }

    /// Copies the database to `target` (checkpointing first) via a temporary
    /// file and atomic rename.
    pub fn backup(&mut self, target: &Path) -> Result<(), Error> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| err!(FailedPrecondition, msg("can't back up an in-memory database")))?;
        self.checkpoint_wal()?;
        let tmp = sidecar(target, ".tmp");
        std::fs::copy(&path, &tmp)?;
        std::fs::File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, target)?;
        if let Some(parent) = target.parent() {
            std::fs::File::open(parent)?.sync_all()?;
        }
        info!("backed up database to {}", target.display());
        Ok(())
    }

    /// Backs up to the default `.bak` sibling.
    pub fn backup_default(&mut self) -> Result<(), Error> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| err!(FailedPrecondition, msg("can't back up an in-memory database")))?;
        self.backup(&backup_path(&path))
    }
}

// Helpers for Database::lock(). Closures don't implement Fn.
fn acquisition() -> &'static str {
    "database lock acquisition"
}
fn operation() -> &'static str {
    "database operation"
}

/// The metadata store. See the module doc for locking and durability notes.
pub struct Database<C: Clocks + Clone = clock::RealClocks> {
    /// Wrapped in an `Option` so `Drop` and `close` can coexist.
    db: Option<Mutex<LockedDatabase>>,

    clocks: C,
}

impl<C: Clocks + Clone> Drop for Database<C> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return; // don't checkpoint while panicking.
        }
        if let Some(m) = self.db.take() {
            if let Ok(l) = m.into_inner() {
                if let Err(e) = l.checkpoint_wal() {
                    error!(err = %e.chain(), "final wal checkpoint failed");
                }
            }
        }
    }
}

impl<C: Clocks + Clone> Database<C> {
    /// Opens (creating if absent) the database at `path`.
    pub fn open(clocks: C, path: &Path) -> Result<Database<C>, Error> {
        fn open_and_check(path: &Path, existed: bool) -> Result<rusqlite::Connection, Error> {
            let conn = open_conn(path)?;
            if existed {
                integrity_check_conn(&conn)?;
            }
            Ok(conn)
        }

        let existed = path.exists();
        let mut conn = match open_and_check(path, existed) {
            Ok(conn) => conn,
            Err(e) if existed => {
                // One-shot restore from backup, then give up.
                warn!(
                    err = %e.chain(),
                    "database failed integrity check; restoring from backup"
                );
                let bak = backup_path(path);
                restore(path, &bak).map_err(|restore_err| {
                    err!(
                        DataLoss,
                        msg(
                            "database {} is corrupt and restore from {} failed",
                            path.display(),
                            bak.display()
                        ),
                        source(restore_err)
                    )
                })?;
                let conn = open_conn(path)?;
                integrity_check_conn(&conn).map_err(|e| {
                    err!(
                        DataLoss,
                        msg("backup {} is also corrupt", bak.display()),
                        source(e)
                    )
                })?;
                info!("restored database from {}", bak.display());
                conn
            }
            Err(e) => return Err(e),
        };
        let now = clocks.realtime().as_second();
        upgrade::run(&mut conn, now)?;
        let db = Database {
            db: Some(Mutex::new(LockedDatabase {
                conn,
                path: Some(path.to_owned()),
                open_id: Uuid::now_v7(),
            })),
            clocks,
        };
        if !existed {
            db.lock().backup_default()?;
        }
        Ok(db)
    }

    /// Creates a database from a caller-supplied connection (e.g. in-memory
    /// for tests), running migrations on it.
    pub fn from_conn(clocks: C, mut conn: rusqlite::Connection) -> Result<Database<C>, Error> {
        let now = clocks.realtime().as_second();
        upgrade::run(&mut conn, now)?;
        Ok(Database {
            db: Some(Mutex::new(LockedDatabase {
                conn,
                path: None,
                open_id: Uuid::now_v7(),
            })),
            clocks,
        })
    }

    #[inline(always)]
    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    /// Locks the database; the returned guard is the only way to perform
    /// (read or write) operations.
    pub fn lock(&self) -> DatabaseGuard<'_, C> {
        let timer = clock::TimerGuard::new(&self.clocks, acquisition);
        let db = self.db.as_ref().unwrap().lock().unwrap();
        drop(timer);
        let _timer = clock::TimerGuard::<C, &'static str, fn() -> &'static str>::new(
            &self.clocks,
            operation,
        );
        DatabaseGuard {
            clocks: &self.clocks,
            db,
            _timer,
        }
    }

    /// Checkpoints the WAL and closes, retrying while SQLite reports busy.
    pub fn close(mut self) -> Result<(), Error> {
        let m = self.db.take().unwrap();
        let l = m.into_inner().unwrap();
        l.checkpoint_wal()?;
        let mut conn = l.conn;
        conn.flush_prepared_statement_cache();
        for attempt in 0..5 {
            match conn.close() {
                Ok(()) => return Ok(()),
                Err((c, e)) if attempt + 1 < 5 => {
                    warn!(err = %e, attempt, "database close reported busy; retrying");
                    conn = c;
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err((_, e)) => return Err(e.into()),
            }
        }
        unreachable!();
    }
}

/// Reference to a locked database returned by [`Database::lock`].
pub struct DatabaseGuard<'db, C: Clocks> {
    clocks: &'db C,
    db: MutexGuard<'db, LockedDatabase>,
    _timer: clock::TimerGuard<'db, C, &'static str, fn() -> &'static str>,
}

impl<'db, C: Clocks + Clone> DatabaseGuard<'db, C> {
    /// Appends an event stamped with the current wall-clock time.
    pub fn add_event_now(
        &mut self,
        kind: EventType,
        stream_name: Option<&str>,
        description: &str,
        details: Option<&str>,
    ) -> Result<i64, Error> {
        let when = self.clocks.realtime().as_second();
        self.db
            .add_event(when, kind, stream_name, description, details)
    }
}

impl<'db, C: Clocks> std::ops::Deref for DatabaseGuard<'db, C> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.db
    }
}

impl<'db, C: Clocks> std::ops::DerefMut for DatabaseGuard<'db, C> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.db
    }
}
