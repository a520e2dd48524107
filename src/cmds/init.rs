// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;

use base::clock::{Clocks as _, RealClocks};
use base::{bail, Error};
use bpaf::Bpaf;
use tracing::info;

/// Initializes a fresh metadata store under the configured storage path.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(crate::cmds::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = super::read_config(&args.config)?;
    std::fs::create_dir_all(&cfg.storage_path)?;
    let path = super::db_path(&cfg);
    if path.exists() {
        bail!(
            AlreadyExists,
            msg("{} already exists; use `lightnvr upgrade` instead", path.display())
        );
    }
    let clocks = RealClocks::default();
    {
        let mut conn = rusqlite::Connection::open(&path)?;
        db::init(&mut conn, clocks.realtime().as_second())?;
    }
    // Reopening applies the WAL journaling pragmas and writes the initial
    // backup.
    let db = db::Database::open(clocks, &path)?;
    db.close()?;
    info!(
        "initialized {} at schema version {}",
        path.display(),
        db::EXPECTED_SCHEMA_VERSION
    );
    Ok(0)
}
