// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod db;
mod raw;
pub mod testutil;
pub mod upgrade;

pub use db::{
    init, restore, validate_stream_name, Database, DatabaseGuard, Event, EventType,
    LockedDatabase, Recording, RecordingQuery, RecordingToInsert, RecordingUpdate, Stream,
    StreamChange, Transport, TriggerType, DB_FILENAME,
};
pub use upgrade::EXPECTED_SCHEMA_VERSION;
