// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving lightnvr's persistence library.
//! Used for tests of both the `lightnvr-db` crate itself and the `lightnvr`
//! crate.

use std::sync::Arc;

use base::clock::SimulatedClocks;
use tempfile::TempDir;

use crate::db;

static INIT: std::sync::Once = std::sync::Once::new();

/// Name of the stream created by `TestDb::new` below.
pub const TEST_STREAM_NAME: &str = "test";

/// Performs global initialization for tests: sets up logging. (Note the
/// output can be confusing unless `RUST_TEST_THREADS=1` is set in the
/// program's environment prior to running.)
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

pub struct TestDb {
    pub db: Arc<db::Database<SimulatedClocks>>,
    pub clocks: SimulatedClocks,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates an on-disk test database with one stream.
    pub fn new(clocks: SimulatedClocks) -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("lightnvr-test")
            .tempdir()
            .unwrap();
        let db = Arc::new(
            db::Database::open(clocks.clone(), &tmpdir.path().join(db::DB_FILENAME)).unwrap(),
        );
        db.lock()
            .add_stream(&db::StreamChange {
                name: TEST_STREAM_NAME.to_owned(),
                url: "rtsp://test-camera/main".to_owned(),
                segment_duration: 5,
                ..Default::default()
            })
            .unwrap();
        TestDb { db, clocks, tmpdir }
    }
}
