// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;

use base::{bail, Error};
use bpaf::Bpaf;
use tracing::info;

/// Upgrades the metadata store to the current schema version.
///
/// `run` does this implicitly on startup; the separate command exists so an
/// upgrade can be exercised (and backed up) before a version rollout.
#[derive(Bpaf, Debug)]
#[bpaf(command("upgrade"))]
pub struct Args {
    #[bpaf(external(crate::cmds::parse_config_path))]
    config: PathBuf,
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
    // Opening runs the migrations; take a backup of the result.
    let db = db::Database::open(base::clock::RealClocks::default(), &path)?;
    let version = {
        let mut l = db.lock();
        l.backup_default()?;
        l.get_schema_version()?
    };
    db.close()?;
    info!("{} is at schema version {version}", path.display());
    Ok(0)
}
