//! Binary state file and optional HTML dump (§3 `AggregateStateSnapshot`, §6).

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};

use crate::constants::{STATE_FILE_MAGIC, STATE_INFO_MAX_LEN};
use crate::error::StateError;
use crate::subservice::SubServiceHandle;

/// One row of the published snapshot: a truncated, display-only view of a
/// sub-service's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateRow {
    pub name: String,
    pub state: String,
    pub info: String,
}

/// The full ordered snapshot persisted to the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStateSnapshot {
    pub services: Vec<ServiceStateRow>,
}

/// Reads and decodes the binary state file at `path` for the `list` CLI
/// command. A missing file yields an empty snapshot (no supervisor has ever
/// published one); an existing file with a foreign magic is reported as
/// `StateError::InvalidMagic` rather than misparsed.
pub fn read_snapshot(path: &Path) -> Result<AggregateStateSnapshot, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AggregateStateSnapshot { services: Vec::new() });
        }
        Err(source) => {
            return Err(StateError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };

    if bytes.len() < STATE_FILE_MAGIC.len() || bytes[..STATE_FILE_MAGIC.len()] != STATE_FILE_MAGIC {
        return Err(StateError::InvalidMagic {
            path: path.display().to_string(),
        });
    }

    Ok(serde_json::from_slice(&bytes[STATE_FILE_MAGIC.len()..])?)
}

fn truncate(info: &str) -> String {
    if info.chars().count() <= STATE_INFO_MAX_LEN {
        info.to_string()
    } else {
        info.chars().take(STATE_INFO_MAX_LEN).collect()
    }
}

/// Verifies that `path` either does not exist or already carries our magic
/// prefix. Returns `Ok(true)` when the file is absent or ours, `Ok(false)`
/// is never returned; an invalid existing file yields
/// `Err(StateError::InvalidMagic)` without touching the file, per §6/§9:
/// "an existing file with a different magic must NOT be deleted."
pub fn validate_existing(path: &Path) -> Result<(), StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(StateError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };
    if bytes.len() >= STATE_FILE_MAGIC.len() && bytes[..STATE_FILE_MAGIC.len()] == STATE_FILE_MAGIC
    {
        Ok(())
    } else {
        Err(StateError::InvalidMagic {
            path: path.display().to_string(),
        })
    }
}

/// Picks a fresh temp path to use instead of an invalid existing state file,
/// as directed by §6/§9: `<original>.<pid>.bin`.
pub fn fallback_path(original: &Path) -> PathBuf {
    let pid = std::process::id();
    let mut name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.bin".to_string());
    name.push_str(&format!(".{pid}"));
    original.with_file_name(name)
}

/// Publishes `AggregateStateSnapshot`s to a binary state file (and optional
/// HTML dump) whenever the encoded bytes differ from the last-written value.
/// Bound to the sub-service registry via a `Weak` reference so the publisher
/// itself can be freely shared by every `SubServiceHandle` without creating a
/// reference cycle.
pub struct StatePublisher {
    state_path: PathBuf,
    html_path: Option<PathBuf>,
    html_id: Option<String>,
    registry: Mutex<Weak<Vec<Arc<SubServiceHandle>>>>,
    last_written: Mutex<Vec<u8>>,
}

impl StatePublisher {
    pub fn new(state_path: PathBuf, html_id: Option<String>) -> Self {
        let html_path = html_id.as_ref().map(|_| {
            let mut os = state_path.clone().into_os_string();
            os.push(".html");
            PathBuf::from(os)
        });
        Self {
            state_path,
            html_path,
            html_id,
            registry: Mutex::new(Weak::new()),
            last_written: Mutex::new(Vec::new()),
        }
    }

    /// Binds the registry of live sub-services this publisher snapshots.
    /// Called once, after the registry itself has been constructed.
    pub fn bind_registry(&self, registry: Weak<Vec<Arc<SubServiceHandle>>>) {
        *self.registry.lock().unwrap_or_else(|p| p.into_inner()) = registry;
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Recomputes the aggregate snapshot from the bound registry and, if it
    /// differs from the last-written bytes, overwrites the state file (and
    /// the HTML dump, if configured).
    pub fn publish(&self) -> Result<(), StateError> {
        let registry = match self
            .registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .upgrade()
        {
            Some(registry) => registry,
            None => return Ok(()),
        };

        let snapshot = AggregateStateSnapshot {
            services: registry
                .iter()
                .map(|handle| ServiceStateRow {
                    name: handle.manifest.name.clone(),
                    state: handle.state().as_ref().to_string(),
                    info: truncate(&handle.state_message()),
                })
                .collect(),
        };

        let mut bytes = STATE_FILE_MAGIC.to_vec();
        bytes.extend(serde_json::to_vec(&snapshot)?);

        let mut last_written = self.last_written.lock().unwrap_or_else(|p| p.into_inner());
        if *last_written == bytes {
            return Ok(());
        }

        fs::write(&self.state_path, &bytes).map_err(|source| StateError::Write {
            path: self.state_path.display().to_string(),
            source,
        })?;
        *last_written = bytes;
        drop(last_written);

        if let Some(html_path) = &self.html_path {
            let html = render_html(&snapshot, self.html_id.as_deref().unwrap_or(""));
            fs::write(html_path, html).map_err(|source| StateError::Write {
                path: html_path.display().to_string(),
                source,
            })?;
        }

        Ok(())
    }

    /// Rewrites the HTML dump as an all-stopped table and removes the binary
    /// state file, as the final step of the Stop sequence (§4.5 step 3).
    pub fn finalize_stopped(&self) -> Result<(), StateError> {
        if let Some(registry) = self
            .registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .upgrade()
            && let Some(html_path) = &self.html_path
        {
            let snapshot = AggregateStateSnapshot {
                services: registry
                    .iter()
                    .map(|handle| ServiceStateRow {
                        name: handle.manifest.name.clone(),
                        state: "Stopped".to_string(),
                        info: truncate(&handle.state_message()),
                    })
                    .collect(),
            };
            let html = render_html(&snapshot, self.html_id.as_deref().unwrap_or(""));
            fs::write(html_path, html).map_err(|source| StateError::Write {
                path: html_path.display().to_string(),
                source,
            })?;
        }

        match fs::remove_file(&self.state_path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Write {
                path: self.state_path.display().to_string(),
                source,
            }),
        }
    }
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_html(snapshot: &AggregateStateSnapshot, id: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut rows = String::new();
    for row in &snapshot.services {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            html_escape(&row.name),
            html_escape(&row.state),
            html_escape(&row.info)
        ));
    }
    format!(
        "<html><head><title>{id}</title></head><body>\n\
         <h1>{id}</h1>\n\
         <p>{count} sub-service(s) as of {now}</p>\n\
         <table border=\"1\"><tr><th>Name</th><th>State</th><th>Info</th></tr>\n{rows}</table>\n\
         </body></html>\n",
        id = html_escape(id),
        count = snapshot.services.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validate_existing_accepts_missing_file() {
        let dir = tempdir().unwrap();
        assert!(validate_existing(&dir.path().join("state.bin")).is_ok());
    }

    #[test]
    fn validate_existing_rejects_foreign_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        fs::write(&path, b"NOPE-not-ours").unwrap();
        assert!(matches!(
            validate_existing(&path),
            Err(StateError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn publish_writes_magic_prefixed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let publisher = StatePublisher::new(path.clone(), None);
        let registry: Arc<Vec<Arc<SubServiceHandle>>> = Arc::new(vec![]);
        publisher.bind_registry(Arc::downgrade(&registry));
        publisher.publish().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &STATE_FILE_MAGIC);
    }

    #[test]
    fn publish_is_a_noop_when_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let publisher = StatePublisher::new(path.clone(), None);
        let registry: Arc<Vec<Arc<SubServiceHandle>>> = Arc::new(vec![]);
        publisher.bind_registry(Arc::downgrade(&registry));
        publisher.publish().unwrap();
        let first = fs::metadata(&path).unwrap().modified().unwrap();
        publisher.publish().unwrap();
        let second = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn read_snapshot_round_trips_through_publish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let manifest = Arc::new(crate::manifest::SubServiceManifest {
            name: "worker".into(),
            ..Default::default()
        });
        let publisher = Arc::new(StatePublisher::new(path.clone(), None));
        let handle = Arc::new(SubServiceHandle::new(manifest, publisher.clone()));
        handle.set_state(crate::subservice::SubServiceState::Running, "PID=1");
        let registry: Arc<Vec<Arc<SubServiceHandle>>> = Arc::new(vec![handle]);
        publisher.bind_registry(Arc::downgrade(&registry));
        publisher.publish().unwrap();

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.services[0].name, "worker");
        assert_eq!(snapshot.services[0].state, "Running");
    }

    #[test]
    fn read_snapshot_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let snapshot = read_snapshot(&dir.path().join("missing.bin")).unwrap();
        assert!(snapshot.services.is_empty());
    }
}
