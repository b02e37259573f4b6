//! `%TOKEN%` placeholder expansion for action strings (§4.1).
//!
//! The set of legal `%name%` tokens is built once as an explicit
//! name→accessor table, rather than resolved through runtime reflection, per
//! the re-architecture guidance: this keeps the set of legal tokens
//! documented and testable.

use chrono::Local;
use std::{
    collections::HashMap,
    env,
    path::PathBuf,
    sync::OnceLock,
};

use crate::constants::{DEFAULT_MANIFEST_EXT, PLACEHOLDER_MAX_DEPTH};
use crate::error::ExpandError;
use crate::manifest::SubServiceManifest;
use crate::manifest::SupervisorSettings;
use crate::runtime;

/// Everything the expander needs besides the manifest and the action text
/// itself: resolved supervisor settings, the directory manifests were loaded
/// from, the supervisor executable's directory, and any extra CLI parameters
/// forwarded by the operator.
pub struct ExpanderContext {
    pub settings: SupervisorSettings,
    pub manifest_dir: PathBuf,
    pub base_dir: PathBuf,
    pub extra_params: Vec<String>,
}

impl ExpanderContext {
    pub fn new(settings: SupervisorSettings, manifest_dir: PathBuf, extra_params: Vec<String>) -> Self {
        Self {
            settings,
            manifest_dir,
            base_dir: runtime::executable_dir(),
            extra_params,
        }
    }
}

type SubServiceAccessor = fn(&SubServiceManifest) -> String;

fn subservice_accessors() -> &'static HashMap<&'static str, SubServiceAccessor> {
    static TABLE: OnceLock<HashMap<&'static str, SubServiceAccessor>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m: HashMap<&'static str, SubServiceAccessor> = HashMap::new();
        m.insert("name", |s| s.name.clone());
        m.insert("description", |s| s.description.clone());
        m.insert("run", |s| s.run.clone());
        m.insert("level", |s| s.level.to_string());
        m.insert("startworkdir", |s| s.start_work_dir.clone());
        m.insert("redirectlogfile", |s| s.redirect_log_file.clone());
        m.insert("retrystablesec", |s| s.retry_stable_sec.to_string());
        m.insert("stoprunaborttimeoutsec", |s| {
            s.stop_run_abort_timeout_sec.to_string()
        });
        m.insert("watchdelaysec", |s| s.watch_delay_sec.to_string());
        m
    })
}

/// Resolves an `agl.<field>` token against the supervisor settings and the
/// directories derived from them. `base`, `now` and `params` are handled
/// separately by the caller since they are not plain `SupervisorSettings`
/// fields.
fn resolve_agl_field(field: &str, ctx: &ExpanderContext) -> Option<String> {
    match field {
        "folder" => Some(ctx.manifest_dir.display().to_string()),
        "ext" => Some(
            ctx.settings
                .manifest_ext
                .clone()
                .unwrap_or_else(|| DEFAULT_MANIFEST_EXT.to_string()),
        ),
        "logpath" => Some(runtime::log_dir().display().to_string()),
        "statefile" => Some(
            ctx.settings
                .state_file
                .clone()
                .unwrap_or_else(|| runtime::default_state_file().display().to_string()),
        ),
        "htmlid" => Some(ctx.settings.html_id.clone().unwrap_or_default()),
        "httptimeoutms" => Some(
            ctx.settings
                .http_timeout_ms
                .map(|v| v.to_string())
                .unwrap_or_else(|| crate::constants::DEFAULT_HTTP_TIMEOUT_MS.to_string()),
        ),
        "starttimeoutsec" => Some(
            ctx.settings
                .start_timeout_sec
                .map(|v| v.to_string())
                .unwrap_or_else(|| crate::constants::DEFAULT_START_TIMEOUT_SEC.to_string()),
        ),
        _ => None,
    }
}

fn resolve_system_path(token: &str) -> Option<PathBuf> {
    match token {
        "CommonData" => Some(runtime::state_dir()),
        "UserData" => Some(env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))),
        "TempFolder" => Some(env::temp_dir()),
        "Log" => Some(runtime::log_dir()),
        _ => None,
    }
}

fn resolve_token(
    token: &str,
    manifest: &SubServiceManifest,
    ctx: &ExpanderContext,
) -> Result<String, ExpandError> {
    if let Some(field) = token.strip_prefix("agl.") {
        return match field {
            "base" => Ok(ctx.base_dir.display().to_string()),
            "now" => Ok(Local::now().format("%Y%m%d-%H%M%S").to_string()),
            "params" => Ok(ctx.extra_params.join(" ")),
            other => resolve_agl_field(other, ctx)
                .ok_or_else(|| ExpandError::UnknownToken(token.to_string())),
        };
    }

    if let Some(path) = resolve_system_path(token) {
        return Ok(path.display().to_string());
    }

    if let Some(accessor) = subservice_accessors().get(token.to_ascii_lowercase().as_str()) {
        return Ok(accessor(manifest));
    }

    Err(ExpandError::UnknownToken(token.to_string()))
}

/// Private-use stand-in for a `%%`-collapsed literal `%` while a pass is in
/// flight, so it never gets mistaken for the start of another token on a
/// later recursive pass. Swapped back to `%` once expansion is fully done.
const PERCENT_LITERAL: char = '\u{E000}';

/// Expands every `%TOKEN%` in `action`, recursively, bounded to
/// `PLACEHOLDER_MAX_DEPTH` rounds. `%%` collapses to a literal `%`.
pub fn expand(
    action: &str,
    manifest: &SubServiceManifest,
    ctx: &ExpanderContext,
) -> Result<String, ExpandError> {
    let expanded = expand_depth(action, manifest, ctx, 0)?;
    Ok(expanded.replace(PERCENT_LITERAL, "%"))
}

fn expand_depth(
    input: &str,
    manifest: &SubServiceManifest,
    ctx: &ExpanderContext,
    depth: u32,
) -> Result<String, ExpandError> {
    if depth > PLACEHOLDER_MAX_DEPTH {
        return Err(ExpandError::RecursionDepthExceeded(input.to_string()));
    }

    let mut out = String::new();
    let mut rest = input;
    loop {
        match rest.find('%') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(pos) => {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + 1..];
                if let Some(stripped) = after.strip_prefix('%') {
                    // `%%` collapses to a literal `%`, parked behind a
                    // sentinel so this pass (and any re-expansion pass
                    // triggered by a real substitution elsewhere in `out`)
                    // never re-parses it as a token delimiter.
                    out.push(PERCENT_LITERAL);
                    rest = stripped;
                } else if let Some(end) = after.find('%') {
                    let token = &after[..end];
                    out.push_str(&resolve_token(token, manifest, ctx)?);
                    rest = &after[end + 1..];
                } else {
                    return Err(ExpandError::Unterminated(input.to_string()));
                }
            }
        }
    }

    if out.contains('%') {
        expand_depth(&out, manifest, ctx, depth + 1)
    } else {
        Ok(out)
    }
}
