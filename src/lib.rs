//! Cross-platform process supervisor for declarative sub-service manifests.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
// OpenSSL is only needed for static linking on Linux
#[cfg(target_os = "linux")]
use openssl_sys as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Action string grammar and verb execution.
pub mod action;

/// CLI parsing.
pub mod cli;

/// Constants and configuration defaults.
pub mod constants;

/// Errors.
pub mod error;

/// Control channel to a running supervisor.
pub mod ipc;

/// Manifest model and loading.
pub mod manifest;

/// `%TOKEN%` placeholder expansion.
pub mod placeholder;

/// Per-sub-service monitored worker.
pub mod runner;

/// Runtime paths and modes.
pub mod runtime;

/// Binary state file and HTML dump.
pub mod state;

/// The live record of one sub-service.
pub mod subservice;

/// Supervisor: manifest discovery, leveled start/stop, watchdog, resume.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
