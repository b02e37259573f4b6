//! Error taxonomy for the supervisor.
use thiserror::Error;

/// Top-level error type returned by core supervisor operations.
///
/// Variants map onto the two error classes from the error-handling design:
/// configuration/fatal errors that abort the calling operation outright, and
/// per-subsystem errors (wrapped here via `#[from]`) that the caller decides
/// how to handle — raised during Start, logged-and-continued during Stop and
/// Watch.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error loading or parsing the manifest set.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Error expanding a `%TOKEN%` placeholder.
    #[error(transparent)]
    Expand(#[from] ExpandError),

    /// Error parsing or executing an action.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// Error from the state publisher.
    #[error(transparent)]
    State(#[from] StateError),

    /// A level failed to reach `Running` for every waiting sub-service before
    /// its start timeout elapsed.
    #[error("level {level} did not reach Running within {timeout_sec}s: {pending:?}")]
    LevelStartTimeout {
        level: i64,
        timeout_sec: u64,
        pending: Vec<String>,
    },

    /// I/O failure not otherwise classified.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A mutex guarding shared supervisor state was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::LockPoisoned(err.to_string())
    }
}

/// Errors raised while discovering or parsing the manifest set. These are
/// configuration errors: they abort the operation (typically Start) outright.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Error reading a manifest file from disk.
    #[error("failed to read manifest '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a manifest's YAML/JSON body.
    #[error("invalid manifest '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Two manifests declared the same case-insensitive name.
    #[error("duplicate sub-service name '{name}' in '{file_a}' and '{file_b}'")]
    DuplicateName {
        name: String,
        file_a: String,
        file_b: String,
    },

    /// Error loading the supervisor settings document.
    #[error("invalid settings file '{path}': {source}")]
    Settings {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised while expanding `%TOKEN%` placeholders (§4.1).
#[derive(Debug, Error)]
pub enum ExpandError {
    /// The token does not name a known system path, supervisor field, or
    /// sub-service field.
    #[error("unknown placeholder '%{0}%'")]
    UnknownToken(String),

    /// Expansion recursed past `PLACEHOLDER_MAX_DEPTH`.
    #[error("placeholder recursion depth exceeded expanding '{0}'")]
    RecursionDepthExceeded(String),

    /// A `%TOKEN%` was opened but never closed.
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
}

/// Errors raised while parsing or executing an action (§4.2, §4.3).
#[derive(Debug, Error)]
pub enum ActionError {
    /// The command exited with a status other than the expected one.
    #[error("command '{command}' exited with {actual}, expected {expected}")]
    UnexpectedExitStatus {
        command: String,
        actual: i32,
        expected: i32,
    },

    /// The command could not be spawned at all.
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP probe returned an unexpected status code.
    #[error("http probe '{url}' returned {actual}, expected {expected}")]
    UnexpectedHttpStatus {
        url: String,
        actual: u16,
        expected: u16,
    },

    /// The HTTP probe could not be completed (connection error, timeout, ...).
    #[error("http probe '{url}' failed: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// `sleep:` parameter was not a valid non-negative integer.
    #[error("invalid sleep duration '{0}'")]
    InvalidSleepDuration(String),

    /// The `service` verb was used on a platform that cannot execute it.
    #[error("the 'service' verb is unsupported on this platform")]
    ServiceVerbUnsupported,

    /// `start` was requested while a start was already in flight.
    #[error("only a single start is allowed for '{0}'")]
    AlreadyStarted(String),

    /// `stop` parameter did not match the in-flight start's parameter.
    #[error("stop parameter '{given}' does not match active start '{active}' for '{service}'")]
    StopParamMismatch {
        service: String,
        given: String,
        active: String,
    },
}

/// Errors raised by the state publisher (§6 state file).
#[derive(Debug, Error)]
pub enum StateError {
    /// Error reading the existing state file from disk.
    #[error("failed to read state file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error writing the state file to disk.
    #[error("failed to write state file '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error encoding the aggregate snapshot.
    #[error("failed to encode state snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    /// An existing file at the state-file path does not begin with the expected magic.
    /// The file is left untouched; the caller must pick a fresh path.
    #[error("state file '{path}' has an invalid magic number; leaving it untouched")]
    InvalidMagic { path: String },
}
