//! Action string grammar, parsing, and verb execution (§4.2, §4.3).
//!
//! An action string is `verb[,verb]*[:param][=expected]`. Parsing strips the
//! verb list down to whatever is legal for the calling lifecycle phase;
//! executing a parsed action tries each surviving verb in order and stops at
//! the first one whose effect reports success.

use std::{
    process::Command,
    sync::Arc,
    time::Duration,
};

use crate::constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG};
use crate::error::ActionError;
use crate::subservice::SubServiceHandle;

/// Lifecycle phase an action string is being parsed/executed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
    Watch,
}

/// One verb from an action's comma-separated verb list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Exec,
    Wait,
    Start,
    Stop,
    Http,
    Https,
    Sleep,
    /// Windows service control; legal only when compiled for `cfg(windows)`.
    Service,
}

impl Verb {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "exec" => Some(Verb::Exec),
            "wait" => Some(Verb::Wait),
            "start" => Some(Verb::Start),
            "stop" => Some(Verb::Stop),
            "http" => Some(Verb::Http),
            "https" => Some(Verb::Https),
            "sleep" => Some(Verb::Sleep),
            "service" if cfg!(windows) => Some(Verb::Service),
            _ => None,
        }
    }

    /// Whether this verb is legal during the given lifecycle phase (§4.2).
    fn allowed_in(self, phase: Phase) -> bool {
        use Verb::*;
        match phase {
            Phase::Start => matches!(self, Exec | Wait | Http | Https | Sleep | Service | Start),
            Phase::Stop => matches!(self, Exec | Wait | Http | Https | Sleep | Service | Stop),
            Phase::Watch => matches!(self, Exec | Wait | Http | Https | Sleep | Service),
        }
    }
}

/// A parsed action: the surviving (context-legal) verb list, the raw
/// parameter string, and the optional expected-result override.
#[derive(Debug, Clone)]
pub struct ParsedAction {
    pub verbs: Vec<Verb>,
    pub param: String,
    pub expected: Option<i64>,
}

/// Splits an action string into verbs / parameter / expected-status, dropping
/// verbs that are unknown or illegal for `phase`. An empty `param` is left
/// empty here; callers substitute the sub-service's `run` default.
pub fn parse(action: &str, phase: Phase) -> ParsedAction {
    let (verb_part, rest) = match action.split_once(':') {
        Some((v, r)) => (v, r),
        None => (action, ""),
    };

    let (param, expected) = match rest.rsplit_once('=') {
        Some((p, suffix)) => match suffix.parse::<i64>() {
            Ok(n) => (p.to_string(), Some(n)),
            Err(_) => (rest.to_string(), None),
        },
        None => (rest.to_string(), None),
    };

    let verbs = verb_part
        .split(',')
        .filter_map(Verb::parse)
        .filter(|v| v.allowed_in(phase))
        .collect();

    // `http`/`https` action strings are full URLs (e.g. "http://host/p=200");
    // the split above consumed the scheme's own colon as the verb separator,
    // so restore it before the parameter reaches the HTTP verb.
    let param = if matches!(verb_part, "http" | "https") {
        format!("{verb_part}:{param}")
    } else {
        param
    };

    ParsedAction {
        verbs,
        param,
        expected,
    }
}

/// Callbacks for the two verbs whose effects reach into the Runner lifecycle
/// rather than being self-contained. Implemented by the supervisor, which
/// owns the machinery to spawn and tear down monitored Runners.
pub trait ActionEffects {
    /// `start`: create a monitored Runner for `handle` using `param` (the
    /// already-expanded command line). Fails if a start is already active.
    fn start(&self, handle: &Arc<SubServiceHandle>, param: &str) -> Result<bool, ActionError>;

    /// `stop`: abort the active Runner for `handle`, if any, and wait for it
    /// to clear its back-reference (bounded by the per-service timeout).
    fn stop(&self, handle: &Arc<SubServiceHandle>, param: &str) -> Result<bool, ActionError>;
}

/// Executes every verb in `parsed.verbs` in order against `handle`, stopping
/// at the first verb whose effect reports success (`Ok(true)`). Returns the
/// last verb's result if none succeed, or `Ok(false)` if the verb list is
/// empty (nothing to do, no error).
pub fn execute(
    parsed: &ParsedAction,
    phase: Phase,
    handle: &Arc<SubServiceHandle>,
    http_client: &reqwest::blocking::Client,
    http_timeout_ms: u64,
    effects: &dyn ActionEffects,
) -> Result<bool, ActionError> {
    let mut last = Ok(false);
    for verb in &parsed.verbs {
        let result = execute_verb(*verb, parsed, phase, handle, http_client, http_timeout_ms, effects);
        if matches!(result, Ok(true)) {
            return result;
        }
        last = result;
        if last.is_err() {
            return last;
        }
    }
    last
}

#[allow(clippy::too_many_arguments)]
fn execute_verb(
    verb: Verb,
    parsed: &ParsedAction,
    phase: Phase,
    handle: &Arc<SubServiceHandle>,
    http_client: &reqwest::blocking::Client,
    http_timeout_ms: u64,
    effects: &dyn ActionEffects,
) -> Result<bool, ActionError> {
    match verb {
        Verb::Exec => exec_verb(&parsed.param, false, parsed.expected),
        Verb::Wait => exec_verb(&parsed.param, true, parsed.expected),
        Verb::Http => http_verb(&parsed.param, false, parsed.expected, http_client, http_timeout_ms),
        Verb::Https => http_verb(&parsed.param, true, parsed.expected, http_client, http_timeout_ms),
        Verb::Sleep => Ok(sleep_verb(&parsed.param)),
        Verb::Start => effects.start(handle, &parsed.param),
        Verb::Stop => effects.stop(handle, &parsed.param),
        Verb::Service => service_verb(&parsed.param, phase, handle),
    }
}

fn exec_verb(param: &str, blocking: bool, expected: Option<i64>) -> Result<bool, ActionError> {
    let mut command = Command::new(DEFAULT_SHELL);
    command.arg(SHELL_COMMAND_FLAG).arg(param);

    if !blocking {
        command
            .spawn()
            .map_err(|source| ActionError::SpawnFailed {
                command: param.to_string(),
                source,
            })?;
        return Ok(true);
    }

    let status = command
        .status()
        .map_err(|source| ActionError::SpawnFailed {
            command: param.to_string(),
            source,
        })?;
    let expected = expected.unwrap_or(0) as i32;
    let actual = status.code().unwrap_or(-1);
    if actual == expected {
        Ok(true)
    } else {
        Err(ActionError::UnexpectedExitStatus {
            command: param.to_string(),
            actual,
            expected,
        })
    }
}

fn http_verb(
    param: &str,
    _https: bool,
    expected: Option<i64>,
    client: &reqwest::blocking::Client,
    timeout_ms: u64,
) -> Result<bool, ActionError> {
    let expected = expected.unwrap_or(200) as u16;
    let response = client
        .get(param)
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .map_err(|source| ActionError::HttpFailed {
            url: param.to_string(),
            source,
        })?;
    let actual = response.status().as_u16();
    if actual == expected {
        Ok(true)
    } else {
        Err(ActionError::UnexpectedHttpStatus {
            url: param.to_string(),
            actual,
            expected,
        })
    }
}

fn sleep_verb(param: &str) -> bool {
    match param.parse::<u64>() {
        Ok(ms) => {
            std::thread::sleep(Duration::from_millis(ms));
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn service_verb(
    param: &str,
    phase: Phase,
    _handle: &Arc<SubServiceHandle>,
) -> Result<bool, ActionError> {
    // Contract only: the real implementation dispatches to the OS service
    // controller (start/stop/query) named in the manifest's `param`. That
    // controller lives outside the core, per the external-collaborator split.
    let _ = (param, phase);
    Err(ActionError::ServiceVerbUnsupported)
}

#[cfg(not(windows))]
fn service_verb(
    _param: &str,
    _phase: Phase,
    _handle: &Arc<SubServiceHandle>,
) -> Result<bool, ActionError> {
    Err(ActionError::ServiceVerbUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_verbs_param_and_expected() {
        let parsed = parse("exec,wait:echo hi=3", Phase::Start);
        assert_eq!(parsed.verbs, vec![Verb::Exec, Verb::Wait]);
        assert_eq!(parsed.param, "echo hi");
        assert_eq!(parsed.expected, Some(3));
    }

    #[test]
    fn parse_drops_disallowed_verbs_for_phase() {
        let parsed = parse("start,exec:true", Phase::Watch);
        assert_eq!(parsed.verbs, vec![Verb::Exec]);
    }

    #[test]
    fn parse_without_colon_has_empty_param() {
        let parsed = parse("start", Phase::Start);
        assert_eq!(parsed.verbs, vec![Verb::Start]);
        assert_eq!(parsed.param, "");
        assert_eq!(parsed.expected, None);
    }

    #[test]
    fn parse_non_integer_suffix_is_kept_in_param() {
        let parsed = parse("http://host/path=notanumber", Phase::Watch);
        assert_eq!(parsed.param, "http://host/path=notanumber");
        assert_eq!(parsed.expected, None);
    }

    #[test]
    fn http_action_keeps_scheme_in_param_and_parses_expected_status() {
        let parsed = parse("http://127.0.0.1:8080/health=200", Phase::Watch);
        assert_eq!(parsed.verbs, vec![Verb::Http]);
        assert_eq!(parsed.param, "http://127.0.0.1:8080/health");
        assert_eq!(parsed.expected, Some(200));
    }

    #[test]
    fn https_action_keeps_scheme_in_param() {
        let parsed = parse("https://example.com/ready=204", Phase::Start);
        assert_eq!(parsed.verbs, vec![Verb::Https]);
        assert_eq!(parsed.param, "https://example.com/ready");
        assert_eq!(parsed.expected, Some(204));
    }

    #[test]
    fn exec_runs_and_reports_success() {
        let result = exec_verb("exit 0", true, None);
        assert!(matches!(result, Ok(true)));
    }

    #[test]
    fn wait_reports_unexpected_status() {
        let result = exec_verb("exit 7", true, Some(0));
        assert!(matches!(result, Err(ActionError::UnexpectedExitStatus { actual: 7, expected: 0, .. })));
    }

    #[test]
    fn sleep_rejects_unparseable_param() {
        assert!(!sleep_verb("not-a-number"));
    }

    #[test]
    fn sleep_accepts_milliseconds() {
        assert!(sleep_verb("1"));
    }
}
