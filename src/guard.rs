//! Cleanup guarantee for the provisioned instance.
//!
//! Instead of registering process-global exit handlers, teardown state is an
//! explicit registry owned by the run: the orchestrator arms it once
//! provisioning succeeds, and both the normal exit path and the top-level
//! signal dispatcher in `main` drain it through [`run_teardown`]. Because
//! those paths can race, the guard is a one-way latch that hands out the
//! instance handle at most once per process.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::channel::CommandRunner;
use crate::hcloud::{HcloudClient, InstanceHandle};

/// One-shot teardown registry for a single run.
#[derive(Debug, Default)]
pub struct CleanupGuard {
    armed: Mutex<Option<InstanceHandle>>,
    fired: AtomicBool,
}

impl CleanupGuard {
    /// Creates an unarmed guard.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            armed: Mutex::new(None),
            fired: AtomicBool::new(false),
        }
    }

    /// Arms the guard with the instance to destroy on exit.
    pub fn arm(&self, handle: InstanceHandle) {
        if let Ok(mut slot) = self.armed.lock() {
            *slot = Some(handle);
        }
    }

    /// Returns `true` when an instance is registered and teardown has not
    /// fired yet.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.fired.load(Ordering::SeqCst)
            && self.armed.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Latches the guard and returns the armed handle.
    ///
    /// The first caller receives the handle; every later caller (including a
    /// racing signal handler) receives `None`. Returns `None` as well when no
    /// instance was ever provisioned.
    #[must_use]
    pub fn take_for_teardown(&self) -> Option<InstanceHandle> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.armed.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Destroys the armed instance, if any, logging the outcome.
///
/// Destroy failures are logged but never escalated: teardown runs on paths
/// where raising would mask the original error or interrupt process exit.
pub fn run_teardown<R: CommandRunner>(guard: &CleanupGuard, client: &HcloudClient<R>) {
    let Some(handle) = guard.take_for_teardown() else {
        return;
    };

    info!(instance = %handle.id, "destroying instance");
    match client.destroy(&handle) {
        Ok(()) => info!(instance = %handle.id, "instance destroyed"),
        Err(err) => warn!(
            instance = %handle.id,
            error = %err,
            "teardown failed; the instance may need manual deletion"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn handle() -> InstanceHandle {
        InstanceHandle {
            id: String::from("4242"),
            address: "203.0.113.9".parse().expect("address"),
        }
    }

    #[test]
    fn unarmed_guard_yields_nothing() {
        let guard = CleanupGuard::new();
        assert!(!guard.is_armed());
        assert!(guard.take_for_teardown().is_none());
    }

    #[test]
    fn armed_guard_yields_the_handle_exactly_once() {
        let guard = CleanupGuard::new();
        guard.arm(handle());
        assert!(guard.is_armed());
        assert_eq!(guard.take_for_teardown(), Some(handle()));
        assert!(guard.take_for_teardown().is_none());
        assert!(!guard.is_armed());
    }

    #[test]
    fn teardown_after_latch_is_a_noop() {
        let guard = CleanupGuard::new();
        guard.arm(handle());
        let runner = ScriptedRunner::new();
        runner.push_success();
        let client = HcloudClient::new(String::from("hcloud"), runner.clone());

        run_teardown(&guard, &client);
        run_teardown(&guard, &client);
        assert_eq!(runner.invocations().len(), 1);
        assert!(!guard.is_armed());
    }

    #[test]
    fn teardown_failure_is_swallowed() {
        let guard = CleanupGuard::new();
        guard.arm(handle());
        let runner = ScriptedRunner::new();
        runner.push_failure(1);
        let client = HcloudClient::new(String::from("hcloud"), runner.clone());

        // The destroy fails remotely; the guard is still drained.
        run_teardown(&guard, &client);
        assert_eq!(runner.invocations().len(), 1);
        assert!(!guard.is_armed());
    }
}
