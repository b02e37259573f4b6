//! Constants and configuration defaults for the supervisor.
//!
//! This module centralizes magic numbers, default timings, and file names used
//! throughout the daemon so they stay documented and easy to audit in one place.

use std::{cmp::Ordering, time::Duration};

// ============================================================================
// Lock Management and Ordering
// ============================================================================

/// Typed lock abstraction for enforcing consistent lock acquisition order.
///
/// Every sub-service's observable `state`/`stateMessage` pair is written from
/// several contexts at once (the Runner loop, the action executor, the
/// orchestrator); `SubServiceLock::State` guards that pair. `SubServiceLock::Runner`
/// guards the `runner` back-reference slot. Locks MUST be acquired in ascending
/// discriminant order to avoid deadlocks between a sub-service's own lock pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubServiceLock {
    /// Guards the `runner` back-reference (set by the Runner at construction,
    /// cleared at exit; nilled by the sub-service on teardown).
    Runner = 1,
    /// Guards `state` / `stateMessage` / `started`.
    State = 2,
}

impl SubServiceLock {
    pub const fn priority(&self) -> u8 {
        *self as u8
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Runner => "runner",
            Self::State => "state",
        }
    }

    pub const fn can_acquire_after(&self, other: &Self) -> bool {
        self.priority() > other.priority()
    }
}

impl PartialOrd for SubServiceLock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubServiceLock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

// ============================================================================
// File System Constants
// ============================================================================

/// Default manifest file extension searched for under the manifest directory.
pub const DEFAULT_MANIFEST_EXT: &str = "yaml";

/// Default name of the binary state file within the runtime state directory.
pub const STATE_FILE_NAME: &str = "state.bin";

/// Name of the control-channel socket within the runtime state directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used to interpret `exec`/`wait` action parameters.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// State File
// ============================================================================

/// 4-byte magic prefix identifying a binary state file written by this supervisor.
/// See `§6 External Interfaces`: any existing file whose first 4 bytes differ
/// must never be deleted automatically.
pub const STATE_FILE_MAGIC: [u8; 4] = 0x5131_E3A6_u32.to_le_bytes();

/// Maximum length, in bytes, of the truncated `info` field persisted per sub-service.
pub const STATE_INFO_MAX_LEN: usize = 80;

// ============================================================================
// Placeholder Expander
// ============================================================================

/// Maximum recursion depth for placeholder (`%TOKEN%`) expansion.
pub const PLACEHOLDER_MAX_DEPTH: u32 = 50;

// ============================================================================
// Timeouts and Polling
// ============================================================================

/// Default per-level start timeout (seconds); 0 disables waiting.
pub const DEFAULT_START_TIMEOUT_SEC: u64 = 30;

/// Default graceful-stop budget per sub-service (seconds).
pub const DEFAULT_STOP_RUN_ABORT_TIMEOUT_SEC: u64 = 10;

/// Default stability threshold before a restart is considered "fast" (seconds).
pub const DEFAULT_RETRY_STABLE_SEC: u64 = 60;

/// Default delay, in seconds, between successive watch ticks for one sub-service.
pub const DEFAULT_WATCH_DELAY_SEC: u64 = 60;

/// Default HTTP probe timeout in milliseconds.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 200;

/// Default rotation threshold for redirected console output, in bytes (100 MiB).
pub const DEFAULT_REDIRECT_ROTATE_BYTES: u64 = 100 * 1024 * 1024;

/// Poll interval used while waiting for a sub-service to reach `Running`,
/// and while waiting for a Runner to clear its back-reference on stop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Watchdog tick interval (~1 Hz).
pub const WATCHDOG_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Retry/backoff ladder
// ============================================================================

/// Retry backoff ladder (§8 property 5), mirrored literally by boundary
/// comparison rather than re-derived from a formula, per the documented open
/// question on near-boundary semantics:
/// elapsed >60min -> 240s; >30min -> 120s; >10min -> 60s; >5min -> 30s;
/// >=1min -> 15s; otherwise -> RETRY_PAUSE_BASE_SEC.
pub const RETRY_PAUSE_OVER_60_MIN_SEC: u64 = 240;
pub const RETRY_PAUSE_OVER_30_MIN_SEC: u64 = 120;
pub const RETRY_PAUSE_OVER_10_MIN_SEC: u64 = 60;
pub const RETRY_PAUSE_OVER_5_MIN_SEC: u64 = 30;
pub const RETRY_PAUSE_AT_LEAST_1_MIN_SEC: u64 = 15;

/// Pause applied when elapsed time since the first unstable run is under a
/// minute.
pub const RETRY_PAUSE_BASE_SEC: u64 = 2;

/// Jitter ceiling, in milliseconds, per second of computed pause: the actual
/// pause is `p_sec * 1000 + rand(0..=p_sec * RETRY_JITTER_MS_PER_SEC)`.
pub const RETRY_JITTER_MS_PER_SEC: u64 = 100;
