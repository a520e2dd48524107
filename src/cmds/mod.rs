// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::{Path, PathBuf};

use base::{err, Error};
use bpaf::Parser;

use crate::config::Config;

pub mod check;
pub mod init;
pub mod run;
pub mod upgrade;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lightnvr.toml";

pub(crate) fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the TOML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}

pub(crate) fn read_config(path: &Path) -> Result<Config, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read config {}", path.display()), source(e)))?;
    Config::parse(&text)
}

/// The store's path under the configured storage root.
pub(crate) fn db_path(cfg: &Config) -> PathBuf {
    cfg.storage_path.join(db::DB_FILENAME)
}
