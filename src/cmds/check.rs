// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;

use base::{bail, Error};
use bpaf::Bpaf;
use tracing::info;

/// Checks the metadata store for corruption.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    #[bpaf(external(crate::cmds::parse_config_path))]
    config: PathBuf,

    /// Also rebuild the database file to reclaim free pages.
    vacuum: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = super::read_config(&args.config)?;
    let path = super::db_path(&cfg);
    if !path.exists() {
        bail!(
            NotFound,
            msg("{} does not exist; run `lightnvr init` first", path.display())
        );
    }
    let db = db::Database::open(base::clock::RealClocks::default(), &path)?;
    {
        let mut l = db.lock();
        l.integrity_check()?;
        info!(
            "{} is healthy at schema version {}",
            path.display(),
            l.get_schema_version()?
        );
        if args.vacuum {
            info!("vacuuming...");
            l.vacuum()?;
        }
    }
    db.close()?;
    Ok(0)
}
