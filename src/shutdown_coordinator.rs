// This file is part of Vigil NVR, a resource-constrained network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception.

//! Shutdown coordinator (§4.H): a registry of long-lived workers layered on
//! top of `base::shutdown`'s channel primitive, ordered by priority so
//! ingest stops accepting packets before writers are asked to finalize,
//! which happens before the publisher and store shut down.

use base::shutdown::{self, Receiver, Sender};
use base::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Priority governs the order components are asked to stop (higher first).
/// Mirrors the fixed order from §4.H: ingest -> controller -> writers ->
/// publisher -> store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Priority {
    Store = 0,
    Publisher = 1,
    Writer = 2,
    Controller = 3,
    Ingest = 4,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Running,
    Stopping,
    Stopped,
}

struct Component {
    name: String,
    priority: Priority,
    state: Mutex<State>,
}

/// Every priority tier gets its own channel so `initiate_shutdown` can drop
/// one tier's `Sender` -- waking only that tier's receivers -- before moving
/// to the next.
const TIER_COUNT: usize = 5;

struct Tier {
    tx: Mutex<Option<Sender>>,
    rx: Receiver,
}

fn priority_order() -> [Priority; TIER_COUNT] {
    [
        Priority::Ingest,
        Priority::Controller,
        Priority::Writer,
        Priority::Publisher,
        Priority::Store,
    ]
}

/// Process-wide registry of components participating in graceful shutdown.
///
/// Each long-lived worker registers itself at startup and gets back a
/// [`Handle`] it uses to poll for the shutdown signal and report when it has
/// actually stopped. `initiate_shutdown` asks components to stop in priority
/// order -- signaling one tier, waiting for it to drain, then moving to the
/// next -- and reports any stragglers still running once `timeout` elapses;
/// the coordinator itself never force-kills a component, only process exit
/// does that (§4.H).
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Arc<Component>>>,
    tiers: [Tier; TIER_COUNT],
    destroyed: Mutex<bool>,
}

pub struct Handle {
    component: Arc<Component>,
    rx: Receiver,
}

impl Handle {
    /// Non-blocking check: has shutdown been requested?
    pub fn is_shutting_down(&self) -> bool {
        self.rx.check().is_err()
    }

    /// Awaitable form, for use in a `tokio::select!` alongside packet/tick
    /// readiness.
    pub fn as_future(&self) -> shutdown::ReceiverRefFuture<'_> {
        self.rx.as_future()
    }

    /// Blocks the current (synchronous) thread until shutdown or `timeout`
    /// elapses, for worker loops that poll rather than `.await` (the ingest
    /// worker's reconnect backoff). Returns `true` if shutdown was signaled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.rx.wait_for(timeout).is_err()
    }

    /// Reports that this component has finished its graceful-stop work and
    /// reached `Stopped`. Idempotent.
    pub fn report_stopped(&self) {
        *self.component.state.lock() = State::Stopped;
        info!(component = %self.component.name, "stopped");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let tiers = std::array::from_fn(|_| {
            let (tx, rx) = shutdown::channel();
            Tier { tx: Mutex::new(Some(tx)), rx }
        });
        ShutdownCoordinator {
            components: Mutex::new(Vec::new()),
            tiers,
            destroyed: Mutex::new(false),
        }
    }

    /// Registers a new long-lived worker. A registration after
    /// `initiate_shutdown` has destroyed the coordinator is a safe no-op
    /// whose handle reports shutdown as already in progress (its tier's
    /// `Sender` was already dropped).
    pub fn register(&self, name: impl Into<String>, priority: Priority) -> Handle {
        let component = Arc::new(Component {
            name: name.into(),
            priority,
            state: Mutex::new(State::Running),
        });
        if !*self.destroyed.lock() {
            self.components.lock().push(component.clone());
        }
        Handle {
            component,
            rx: self.tiers[priority as usize].rx.clone(),
        }
    }

    /// Asks each priority tier to stop, highest first, waiting for that
    /// tier's components to report `Stopped` before signaling the next --
    /// ingest stops accepting packets before writers are asked to finalize,
    /// which happens before the publisher and store shut down. `timeout`
    /// bounds the whole sequence, not each tier; a tier that's still
    /// draining when the deadline passes is signaled anyway (rather than
    /// blocking lower tiers forever) and reported as a straggler. Returns
    /// the names of components that never reached `Stopped`; an empty vec
    /// means clean shutdown.
    pub fn initiate_shutdown(&self, timeout: Duration) -> Vec<String> {
        let deadline = std::time::Instant::now() + timeout;
        for priority in priority_order() {
            {
                let mut tx = self.tiers[priority as usize].tx.lock();
                *tx = None; // drop this tier's Sender, waking its receivers.
            }
            for c in self.components.lock().iter() {
                if c.priority == priority {
                    *c.state.lock() = State::Stopping;
                }
            }
            loop {
                let tier_done = self
                    .components
                    .lock()
                    .iter()
                    .filter(|c| c.priority == priority)
                    .all(|c| *c.state.lock() == State::Stopped);
                if tier_done || std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        let unfinished: Vec<String> = self
            .components
            .lock()
            .iter()
            .filter(|c| *c.state.lock() != State::Stopped)
            .map(|c| c.name.clone())
            .collect();
        *self.destroyed.lock() = true;
        if !unfinished.is_empty() {
            warn!(?unfinished, "shutdown timed out; exiting anyway");
        }
        unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_stop_in_priority_order() {
        let coord = Arc::new(ShutdownCoordinator::new());
        let ingest = coord.register("ingest", Priority::Ingest);
        let store = coord.register("store", Priority::Store);
        assert!(!ingest.is_shutting_down());
        assert!(!store.is_shutting_down());

        // `ingest` never reports stopped, so the coordinator must stall on
        // the ingest tier for the whole timeout before touching `store`.
        let coord2 = coord.clone();
        let h = std::thread::spawn(move || coord2.initiate_shutdown(Duration::from_millis(200)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(ingest.is_shutting_down(), "higher-priority tier must be signaled first");
        assert!(!store.is_shutting_down(), "lower-priority tier must wait for the tier above it");

        let unfinished = h.join().unwrap();
        assert_eq!(unfinished, vec!["ingest".to_string()]);
        assert!(store.is_shutting_down(), "stragglers still unblock lower tiers once the timeout elapses");
    }

    #[test]
    fn initiate_shutdown_completes_once_all_report_stopped() {
        let coord = ShutdownCoordinator::new();
        let ingest = coord.register("ingest", Priority::Ingest);
        let store = coord.register("store", Priority::Store);

        let coord = Arc::new(coord);
        let coord2 = coord.clone();
        let worker = std::thread::spawn(move || {
            while !ingest.is_shutting_down() {
                std::thread::sleep(Duration::from_millis(1));
            }
            ingest.report_stopped();
            while !store.is_shutting_down() {
                std::thread::sleep(Duration::from_millis(1));
            }
            store.report_stopped();
        });
        let unfinished = coord2.initiate_shutdown(Duration::from_secs(5));
        worker.join().unwrap();
        assert!(unfinished.is_empty());
    }

    #[test]
    fn stragglers_are_reported_not_killed() {
        let coord = ShutdownCoordinator::new();
        let _never_stops = coord.register("stuck-writer", Priority::Writer);
        let unfinished = coord.initiate_shutdown(Duration::from_millis(50));
        assert_eq!(unfinished, vec!["stuck-writer".to_string()]);
    }

    #[test]
    fn late_registration_after_destroy_is_a_safe_noop() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.initiate_shutdown(Duration::from_millis(10)).is_empty());
        let late = coord.register("latecomer", Priority::Store);
        assert!(late.is_shutting_down());
    }
}
