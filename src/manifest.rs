//! On-disk manifest model: one file describes one sub-service.
//!
//! A manifest is a YAML (or, equivalently, JSON) document carrying the fields
//! in the external-interfaces table: identity, ordering, OS filter, action
//! lists, environment, working directory, redirect/rotation knobs and retry
//! policy. Loading a directory of manifests additionally enforces the
//! case-insensitive name-uniqueness invariant.

use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::constants::{
    DEFAULT_REDIRECT_ROTATE_BYTES, DEFAULT_RETRY_STABLE_SEC, DEFAULT_STOP_RUN_ABORT_TIMEOUT_SEC,
    DEFAULT_WATCH_DELAY_SEC,
};
use crate::error::ManifestError;

/// Target OS family a manifest is restricted to. A manifest whose filter does
/// not match the host is skipped at orchestration time but still loaded, per
/// the Manifest discovery rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFilter {
    Any,
    Linux,
    Macos,
    Windows,
}

impl Default for OsFilter {
    fn default() -> Self {
        Self::Any
    }
}

impl OsFilter {
    /// Whether this filter matches the host this binary was compiled for.
    pub fn matches_host(&self) -> bool {
        match self {
            OsFilter::Any => true,
            OsFilter::Linux => cfg!(target_os = "linux"),
            OsFilter::Macos => cfg!(target_os = "macos"),
            OsFilter::Windows => cfg!(target_os = "windows"),
        }
    }
}

/// `StartOptions` flags from the external-interfaces table.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    /// Replace the parent environment entirely with `StartEnv` rather than
    /// augmenting it.
    #[serde(rename = "soReplaceEnv")]
    pub so_replace_env: bool,
    /// Request a breakaway job (Windows) so closing this sub-service cascades
    /// only to its own descendants rather than the whole supervisor job.
    #[serde(rename = "soWinJobCloseChildren")]
    pub so_win_job_close_children: bool,
}

/// A byte count accepting either a bare integer or a `K`/`M`/`G`-suffixed
/// shorthand (e.g. `100M`), mirroring how this codebase already parses
/// human-friendly resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl Default for ByteSize {
    fn default() -> Self {
        ByteSize(DEFAULT_REDIRECT_ROTATE_BYTES)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a byte count, optionally suffixed with K, M, or G")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteSize(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value < 0 {
                    return Err(E::invalid_value(
                        serde::de::Unexpected::Signed(value),
                        &"non-negative byte count",
                    ));
                }
                Ok(ByteSize(value as u64))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                parse_byte_size(value)
                    .map(ByteSize)
                    .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

fn parse_byte_size(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let without_bytes = trimmed.trim_end_matches(['B', 'b']);
    let (number_part, multiplier) = match without_bytes.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let len = without_bytes.len() - suffix.len_utf8();
            let multiplier: u128 = match suffix.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                _ => return None,
            };
            (without_bytes[..len].trim(), multiplier)
        }
        _ => (without_bytes.trim(), 1),
    };
    let value: u128 = number_part.parse().ok()?;
    u64::try_from(value.checked_mul(multiplier)?).ok()
}

/// The on-disk shape of one sub-service manifest (§6 External Interfaces).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubServiceManifest {
    pub name: String,
    pub description: String,
    pub run: String,
    pub level: i64,
    pub os: OsFilter,
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub watch: Vec<String>,
    #[serde(rename = "startEnv")]
    pub start_env: Vec<String>,
    #[serde(rename = "startOptions")]
    pub start_options: StartOptions,
    #[serde(rename = "startWorkDir")]
    pub start_work_dir: String,
    #[serde(rename = "stopRunAbortTimeoutSec")]
    pub stop_run_abort_timeout_sec: u64,
    #[serde(rename = "retryStableSec")]
    pub retry_stable_sec: u64,
    #[serde(rename = "abortExitCodes")]
    pub abort_exit_codes: Vec<i32>,
    #[serde(rename = "watchDelaySec")]
    pub watch_delay_sec: u64,
    #[serde(rename = "redirectLogFile")]
    pub redirect_log_file: String,
    #[serde(rename = "redirectLogRotateFiles")]
    pub redirect_log_rotate_files: u32,
    #[serde(rename = "redirectLogRotateBytes")]
    pub redirect_log_rotate_bytes: ByteSize,
}

impl Default for SubServiceManifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            run: String::new(),
            level: 0,
            os: OsFilter::Any,
            start: Vec::new(),
            stop: Vec::new(),
            watch: Vec::new(),
            start_env: Vec::new(),
            start_options: StartOptions::default(),
            start_work_dir: String::new(),
            stop_run_abort_timeout_sec: DEFAULT_STOP_RUN_ABORT_TIMEOUT_SEC,
            retry_stable_sec: DEFAULT_RETRY_STABLE_SEC,
            abort_exit_codes: Vec::new(),
            watch_delay_sec: DEFAULT_WATCH_DELAY_SEC,
            redirect_log_file: String::new(),
            redirect_log_rotate_files: 0,
            redirect_log_rotate_bytes: ByteSize::default(),
        }
    }
}

impl SubServiceManifest {
    /// Whether this entry participates in orchestration at all (`level > 0`).
    pub fn is_enabled(&self) -> bool {
        self.level > 0
    }

    /// The effective start action list: the literal list when non-empty,
    /// otherwise the implicit `["start:%run%"]` when `run` is set (§3).
    pub fn effective_start(&self) -> Vec<String> {
        effective_actions(&self.start, "start", &self.run)
    }

    /// The effective stop action list.
    pub fn effective_stop(&self) -> Vec<String> {
        effective_actions(&self.stop, "stop", &self.run)
    }

    /// The effective watch action list (watch has no implicit fallback: an
    /// empty watch list means "not monitored by the watchdog").
    pub fn effective_watch(&self) -> Vec<String> {
        self.watch.clone()
    }
}

fn effective_actions(list: &[String], phase: &str, run: &str) -> Vec<String> {
    if !list.is_empty() {
        return list.to_vec();
    }
    if run.is_empty() {
        return Vec::new();
    }
    vec![format!("{phase}:%run%")]
}

/// Expands `${VAR}` references in raw manifest/settings text against the
/// process environment, following the existing two-pass load convention:
/// read the raw bytes, expand, then parse the expanded text as YAML.
pub(crate) fn expand_env_refs(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Loads every manifest matching `ext` under `dir`, enforcing case-insensitive
/// name uniqueness. Files with a non-positive `level` are still loaded and
/// returned (callers filter them out of the active orchestration set).
pub fn load_manifests(dir: &Path, ext: &str) -> Result<Vec<SubServiceManifest>, ManifestError> {
    let mut manifests = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
        Err(source) => {
            return Err(ManifestError::Read {
                path: dir.display().to_string(),
                source,
            });
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect();
    paths.sort();

    for path in paths {
        let raw = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let expanded = expand_env_refs(&raw);
        let manifest: SubServiceManifest =
            serde_yaml::from_str(&expanded).map_err(|source| ManifestError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let key = manifest.name.to_ascii_lowercase();
        if let Some(existing) = seen.get(&key) {
            return Err(ManifestError::DuplicateName {
                name: manifest.name.clone(),
                file_a: existing.clone(),
                file_b: path.display().to_string(),
            });
        }
        seen.insert(key, path.display().to_string());
        manifests.push(manifest);
    }

    Ok(manifests)
}

/// Supervisor-wide settings (§3 `SupervisorSettings`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    #[serde(rename = "manifestDir")]
    pub manifest_dir: Option<String>,
    #[serde(rename = "manifestExt")]
    pub manifest_ext: Option<String>,
    #[serde(rename = "httpTimeoutMs")]
    pub http_timeout_ms: Option<u64>,
    #[serde(rename = "stateFile")]
    pub state_file: Option<String>,
    #[serde(rename = "htmlId")]
    pub html_id: Option<String>,
    #[serde(rename = "startTimeoutSec")]
    pub start_timeout_sec: Option<u64>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            manifest_dir: None,
            manifest_ext: None,
            http_timeout_ms: None,
            state_file: None,
            html_id: None,
            start_timeout_sec: None,
        }
    }
}

/// Writes a new manifest file under `dir` for the `new` CLI command (§6 "new
/// service" scaffolder — out of scope except for the manifest format it
/// emits). Returns the path written. Fails if a manifest with the same
/// (case-insensitive) name already exists in `dir`.
pub fn write_new_manifest(
    dir: &Path,
    ext: &str,
    name: &str,
    exe: &str,
    params: &[String],
    level: i64,
) -> Result<PathBuf, ManifestError> {
    let existing = load_manifests(dir, ext)?;
    if existing
        .iter()
        .any(|m| m.name.eq_ignore_ascii_case(name))
    {
        return Err(ManifestError::DuplicateName {
            name: name.to_string(),
            file_a: "<existing>".to_string(),
            file_b: "<new>".to_string(),
        });
    }

    let run = if params.is_empty() {
        exe.to_string()
    } else {
        format!("{exe} {}", params.join(" "))
    };

    fs::create_dir_all(dir).map_err(|source| ManifestError::Read {
        path: dir.display().to_string(),
        source,
    })?;

    let path = dir.join(format!("{name}.{ext}"));
    let body = format!(
        "name: {name}\nlevel: {level}\nrun: \"{}\"\n",
        run.replace('"', "\\\"")
    );
    fs::write(&path, body).map_err(|source| ManifestError::Read {
        path: path.display().to_string(),
        source,
    })?;

    Ok(path)
}

/// Loads settings from `path` if it exists; a missing file is not an error
/// (the supervisor runs with built-in defaults), a present-but-unparsable one
/// is (§4.6).
pub fn load_settings(path: &Path) -> Result<SupervisorSettings, ManifestError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SupervisorSettings::default());
        }
        Err(source) => {
            return Err(ManifestError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };
    let expanded = expand_env_refs(&raw);
    serde_yaml::from_str(&expanded).map_err(|source| ManifestError::Settings {
        path: path.display().to_string(),
        source,
    })
}
