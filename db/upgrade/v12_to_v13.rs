// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Rebuilds the `events` table without the unused `severity` column.
//!
//! SQLite can't drop a column directly, so this renames the old table,
//! creates the new shape, copies rows across, and drops the old table
//! (which also drops its indexes).

use base::Error;

use crate::raw;

pub(super) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    if !raw::has_column(tx, "events", "severity")? {
        return Ok(());
    }
    tx.execute_batch(
        r#"
        alter table events rename to old_events;
        create table events (
          id integer primary key autoincrement,
          type text not null,
          timestamp integer not null,
          stream_name text,
          description text not null default '',
          details text
        );
        insert into events (id, type, timestamp, stream_name, description, details)
            select id, type, timestamp, stream_name, description, details from old_events;
        drop table old_events;
        create index events_timestamp on events (timestamp);
        "#,
    )?;
    Ok(())
}
