//! The live, mutable record of one sub-service (§3 `SubService`).
//!
//! Ownership: the Supervisor owns the set of `SubServiceHandle`s. Each handle
//! owns at most one `RunnerControl` at a time. Lock order follows
//! `constants::SubServiceLock`: the runner back-reference (`Runner`, priority
//! 1) is always acquired before the state pair (`State`, priority 2) when
//! both are needed in the same critical section.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use strum_macros::AsRefStr;
use tracing::warn;

use crate::manifest::SubServiceManifest;
use crate::runner::RunnerControl;
use crate::state::StatePublisher;

/// Observable lifecycle state of a sub-service (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum SubServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
    Failed,
    ErrorRetrievingState,
}

impl Default for SubServiceState {
    fn default() -> Self {
        SubServiceState::ErrorRetrievingState
    }
}

struct StateInner {
    state: SubServiceState,
    message: String,
    /// The literal parameter of the in-flight monitored start; empty when no
    /// start is active. Invariant: at most one non-empty value at a time.
    started: Option<String>,
    runner_exit_code: Option<i32>,
}

/// The live record backing one manifest entry.
pub struct SubServiceHandle {
    pub manifest: Arc<SubServiceManifest>,
    publisher: Arc<StatePublisher>,
    runner: Mutex<Option<RunnerControl>>,
    state: Mutex<StateInner>,
    next_watch: Mutex<Option<Instant>>,
}

impl SubServiceHandle {
    pub fn new(manifest: Arc<SubServiceManifest>, publisher: Arc<StatePublisher>) -> Self {
        Self {
            manifest,
            publisher,
            runner: Mutex::new(None),
            state: Mutex::new(StateInner {
                state: SubServiceState::Stopped,
                message: String::new(),
                started: None,
                runner_exit_code: None,
            }),
            next_watch: Mutex::new(None),
        }
    }

    /// Best-effort state transition: never panics, always publishes. Mirrors
    /// the "SetState calls are best-effort and must not propagate exceptions"
    /// invariant from §4.4.
    pub fn set_state(&self, state: SubServiceState, message: impl Into<String>) {
        {
            let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
            inner.state = state;
            inner.message = message.into();
        }
        if let Err(err) = self.publisher.publish() {
            warn!(service = %self.manifest.name, %err, "failed to publish state snapshot");
        }
    }

    pub fn state(&self) -> SubServiceState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn state_message(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .message
            .clone()
    }

    /// Records `param` as the active start, enforcing the at-most-one-start
    /// invariant (§8 property 1). Returns `false` if a start is already active.
    pub fn begin_start(&self, param: &str) -> bool {
        let mut inner = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if inner.started.is_some() {
            return false;
        }
        inner.started = Some(param.to_string());
        true
    }

    pub fn started_param(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .started
            .clone()
    }

    pub fn clear_started(&self) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).started = None;
    }

    pub fn set_runner_exit_code(&self, code: Option<i32>) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .runner_exit_code = code;
    }

    pub fn runner_exit_code(&self) -> Option<i32> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .runner_exit_code
    }

    pub fn set_runner(&self, control: RunnerControl) {
        *self.runner.lock().unwrap_or_else(|p| p.into_inner()) = Some(control);
    }

    pub fn take_runner(&self) -> Option<RunnerControl> {
        self.runner.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn has_runner(&self) -> bool {
        self.runner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Clears the runner back-reference; called by the Runner itself when its
    /// worker loop exits, signaling "ended" to anyone polling `has_runner`.
    pub fn clear_runner(&self) {
        *self.runner.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn with_runner<R>(&self, f: impl FnOnce(Option<&RunnerControl>) -> R) -> R {
        let guard = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        f(guard.as_ref())
    }

    pub fn next_watch(&self) -> Option<Instant> {
        *self.next_watch.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_next_watch(&self, at: Option<Instant>) {
        *self.next_watch.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn is_enabled(&self) -> bool {
        self.manifest.is_enabled()
    }

    pub fn os_matches(&self) -> bool {
        self.manifest.os.matches_host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SubServiceManifest;
    use std::path::PathBuf;

    fn handle() -> SubServiceHandle {
        let manifest = Arc::new(SubServiceManifest {
            name: "worker".into(),
            ..Default::default()
        });
        let publisher = Arc::new(StatePublisher::new(PathBuf::from("/tmp/does-not-matter.bin"), None));
        SubServiceHandle::new(manifest, publisher)
    }

    #[test]
    fn begin_start_enforces_single_start_invariant() {
        let handle = handle();
        assert!(handle.begin_start("run"));
        assert!(!handle.begin_start("run"));
        handle.clear_started();
        assert!(handle.begin_start("run"));
    }

    #[test]
    fn started_and_runner_invariant_hold_together() {
        let handle = handle();
        assert!(handle.started_param().is_none());
        assert!(!handle.has_runner());
    }
}
