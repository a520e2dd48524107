// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ordered shutdown: components register in dependency order and are
//! stopped in reverse, each bounded by its declared timeout. A component
//! that misses its timeout is marked forcibly stopped; its resources are
//! reclaimed by the operating system at exit rather than blocking the rest
//! of the drain.

use std::time::Duration;

use base::Error;
use tracing::{info, warn};

type StopFn = Box<dyn FnOnce(Duration) -> Result<(), Error> + Send>;

struct Registered {
    name: String,
    timeout: Duration,
    stop: StopFn,
}

pub struct ShutdownCoordinator {
    components: Vec<Registered>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator {
            components: Vec::new(),
        }
    }

    /// Registers a component. Register dependencies first: supervisors
    /// after the store they write to, recorders implicitly via their
    /// supervisor.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        timeout: Duration,
        stop: impl FnOnce(Duration) -> Result<(), Error> + Send + 'static,
    ) {
        self.components.push(Registered {
            name: name.into(),
            timeout,
            stop: Box::new(stop),
        });
    }

    /// Stops everything in reverse registration order.
    pub fn shutdown(self) {
        for c in self.components.into_iter().rev() {
            info!("stopping {}", c.name);
            match (c.stop)(c.timeout) {
                Ok(()) => info!("{} stopped", c.name),
                Err(e) => warn!(
                    "{} did not stop within {:?}; forcibly marked stopped: {}",
                    c.name,
                    c.timeout,
                    e.chain()
                ),
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut c = ShutdownCoordinator::new();
        for name in ["store", "supervisor-a", "supervisor-b"] {
            let order = order.clone();
            c.register(name, Duration::from_secs(1), move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        c.shutdown();
        assert_eq!(
            *order.lock().unwrap(),
            ["supervisor-b", "supervisor-a", "store"]
        );
    }

    #[test]
    fn timeout_does_not_block_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut c = ShutdownCoordinator::new();
        {
            let order = order.clone();
            c.register("store", Duration::from_secs(1), move |_| {
                order.lock().unwrap().push("store");
                Ok(())
            });
        }
        {
            let order = order.clone();
            c.register("stuck", Duration::from_millis(10), move |_| {
                order.lock().unwrap().push("stuck");
                Err(base::err!(DeadlineExceeded, msg("still running")))
            });
        }
        c.shutdown();
        assert_eq!(*order.lock().unwrap(), ["stuck", "store"]);
    }
}
