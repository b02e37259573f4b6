//! Orchestration: manifest discovery, leveled start/stop, watchdog, resume
//! (§4.5).

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::action::{self, ActionEffects, Phase};
use crate::constants::{DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_MANIFEST_EXT, DEFAULT_START_TIMEOUT_SEC, POLL_INTERVAL, WATCHDOG_TICK};
use crate::error::{ActionError, SupervisorError};
use crate::ipc::{self, ControlCommand, ControlResponse};
use crate::manifest::{self, SubServiceManifest, SupervisorSettings};
use crate::placeholder::{self, ExpanderContext};
use crate::runner;
use crate::runtime;
use crate::state::{self, StatePublisher};
use crate::subservice::{SubServiceHandle, SubServiceState};

/// Owns the resolved manifest set, the per-sub-service handles, and the
/// ambient services (HTTP client, state publisher, placeholder context)
/// needed to run the Start/Stop/Resume operations.
pub struct Supervisor {
    manifest_dir: PathBuf,
    manifest_ext: String,
    #[allow(dead_code)]
    settings: SupervisorSettings,
    ctx: Arc<ExpanderContext>,
    http_client: reqwest::blocking::Client,
    http_timeout_ms: u64,
    start_timeout_sec: u64,
    publisher: Arc<StatePublisher>,
    registry: std::sync::Mutex<Option<Arc<Vec<Arc<SubServiceHandle>>>>>,
    watchdog_running: Arc<AtomicBool>,
}

impl Supervisor {
    /// Builds a Supervisor from `manifest_dir`/settings resolved against the
    /// active `RuntimeContext`. Does not load manifests yet; that happens on
    /// the first `start()`.
    pub fn new(manifest_dir: Option<PathBuf>, settings_path: Option<PathBuf>) -> Result<Self, SupervisorError> {
        Self::new_with_params(manifest_dir, settings_path, Vec::new())
    }

    /// As `new`, but also threads `extra_params` through to the `%agl.params%`
    /// placeholder (§4.1) — the extra command-line arguments forwarded to the
    /// `run` CLI command.
    pub fn new_with_params(
        manifest_dir: Option<PathBuf>,
        settings_path: Option<PathBuf>,
        extra_params: Vec<String>,
    ) -> Result<Self, SupervisorError> {
        let settings_path = settings_path.unwrap_or_else(|| {
            let mut dirs = runtime::config_dirs();
            let dir = dirs.pop().unwrap_or_else(|| PathBuf::from("."));
            dir.join("settings.yaml")
        });
        let settings = manifest::load_settings(&settings_path)?;

        let manifest_dir = manifest_dir
            .or_else(|| settings.manifest_dir.clone().map(PathBuf::from))
            .unwrap_or_else(runtime::default_manifest_dir);
        let manifest_ext = settings
            .manifest_ext
            .clone()
            .unwrap_or_else(|| DEFAULT_MANIFEST_EXT.to_string());

        let state_path = settings
            .state_file
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(runtime::default_state_file);

        let state_path = match state::validate_existing(&state_path) {
            Ok(()) => {
                let _ = std::fs::remove_file(&state_path);
                state_path
            }
            Err(err) => {
                let fallback = state::fallback_path(&state_path);
                warn!(
                    %err,
                    path = %state_path.display(),
                    fallback = %fallback.display(),
                    "existing state file has a foreign magic prefix; leaving it untouched and publishing to a fresh path"
                );
                fallback
            }
        };

        let publisher = Arc::new(StatePublisher::new(state_path, settings.html_id.clone()));

        let http_timeout_ms = settings.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);
        let start_timeout_sec = settings.start_timeout_sec.unwrap_or(DEFAULT_START_TIMEOUT_SEC);
        let http_client = reqwest::blocking::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        let ctx = Arc::new(ExpanderContext::new(settings.clone(), manifest_dir.clone(), extra_params));

        Ok(Self {
            manifest_dir,
            manifest_ext,
            settings,
            ctx,
            http_client,
            http_timeout_ms,
            start_timeout_sec,
            publisher,
            registry: std::sync::Mutex::new(None),
            watchdog_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state_publisher(&self) -> Arc<StatePublisher> {
        self.publisher.clone()
    }

    fn registry(&self) -> Option<Arc<Vec<Arc<SubServiceHandle>>>> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn load_registry(&self) -> Result<Arc<Vec<Arc<SubServiceHandle>>>, SupervisorError> {
        if let Some(registry) = self.registry() {
            return Ok(registry);
        }

        let manifests = manifest::load_manifests(&self.manifest_dir, &self.manifest_ext)?;
        let mut handles = Vec::with_capacity(manifests.len());
        for m in manifests {
            if !m.is_enabled() {
                info!(service = %m.name, "sub-service disabled (level <= 0)");
                continue;
            }
            handles.push(Arc::new(SubServiceHandle::new(Arc::new(m), self.publisher.clone())));
        }
        handles.sort_by(|a, b| {
            a.manifest
                .level
                .cmp(&b.manifest.level)
                .then_with(|| a.manifest.name.to_ascii_lowercase().cmp(&b.manifest.name.to_ascii_lowercase()))
        });

        let registry = Arc::new(handles);
        self.publisher.bind_registry(Arc::downgrade(&registry));
        *self.registry.lock().unwrap_or_else(|p| p.into_inner()) = Some(registry.clone());
        Ok(registry)
    }

    fn levels(registry: &[Arc<SubServiceHandle>]) -> Vec<i64> {
        let mut levels: Vec<i64> = registry.iter().map(|h| h.manifest.level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }

    /// Start sequence (§4.5): per-level start with a shared per-level Running
    /// barrier, ascending level order.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let registry = self.load_registry()?;

        for level in Self::levels(&registry) {
            let mut waiting = Vec::new();

            for handle in registry.iter().filter(|h| h.manifest.level == level) {
                if !handle.os_matches() {
                    continue;
                }
                self.start_one(handle)?;
                if !handle.manifest.effective_watch().is_empty() || handle.has_runner() {
                    waiting.push(handle.clone());
                }
            }

            self.wait_for_level_running(level, &waiting)?;
        }

        self.publisher.publish()?;
        self.ensure_watchdog(&registry);
        Ok(())
    }

    fn start_one(&self, handle: &Arc<SubServiceHandle>) -> Result<(), SupervisorError> {
        for action_str in handle.manifest.effective_start() {
            let expanded = placeholder::expand(&action_str, &handle.manifest, &self.ctx)?;
            let parsed = with_run_default(action::parse(&expanded, Phase::Start), handle, &self.ctx)?;
            action::execute(
                &parsed,
                Phase::Start,
                handle,
                &self.http_client,
                self.http_timeout_ms,
                self,
            )?;
        }

        if !handle.manifest.effective_watch().is_empty() {
            let delay = Duration::from_secs(handle.manifest.watch_delay_sec);
            handle.set_next_watch(Some(Instant::now() + delay));
        }

        Ok(())
    }

    fn wait_for_level_running(
        &self,
        level: i64,
        waiting: &[Arc<SubServiceHandle>],
    ) -> Result<(), SupervisorError> {
        if waiting.is_empty() || self.start_timeout_sec == 0 {
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_secs(self.start_timeout_sec);
        loop {
            let pending: Vec<String> = waiting
                .iter()
                .filter(|h| h.has_runner() && h.state() != SubServiceState::Running)
                .map(|h| h.manifest.name.clone())
                .collect();

            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::LevelStartTimeout {
                    level,
                    timeout_sec: self.start_timeout_sec,
                    pending,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop sequence (§4.5): reverse-level order, no barrier, errors
    /// accumulated rather than propagated.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.watchdog_running.store(false, Ordering::SeqCst);

        let registry = match self.registry() {
            Some(r) => r,
            None => {
                self.publisher.finalize_stopped()?;
                return Ok(());
            }
        };

        let mut levels = Self::levels(&registry);
        levels.reverse();

        let mut accumulated_errors = String::new();

        for level in levels {
            for handle in registry.iter().filter(|h| h.manifest.level == level) {
                if !handle.os_matches() {
                    continue;
                }
                handle.set_state(SubServiceState::Stopping, "");
                if let Err(err) = self.stop_one(handle) {
                    error!(service = %handle.manifest.name, %err, "stop action failed");
                    if !accumulated_errors.is_empty() {
                        accumulated_errors.push_str("; ");
                    }
                    accumulated_errors.push_str(&format!("{}: {err}", handle.manifest.name));
                }
                handle.set_state(SubServiceState::Stopped, accumulated_errors.clone());
            }
        }

        self.publisher.finalize_stopped()?;
        Ok(())
    }

    fn stop_one(&self, handle: &Arc<SubServiceHandle>) -> Result<(), SupervisorError> {
        for action_str in handle.manifest.effective_stop() {
            let expanded = placeholder::expand(&action_str, &handle.manifest, &self.ctx)?;
            let parsed = with_run_default(action::parse(&expanded, Phase::Stop), handle, &self.ctx)?;
            action::execute(
                &parsed,
                Phase::Stop,
                handle,
                &self.http_client,
                self.http_timeout_ms,
                self,
            )?;
        }
        Ok(())
    }

    /// Resume (§4.5): signal "retry-now" on every `Paused` sub-service whose
    /// Runner is still live, optionally restricted to `only`.
    pub fn resume(&self, only: Option<&str>) -> Result<usize, SupervisorError> {
        let registry = match self.registry() {
            Some(r) => r,
            None => return Ok(0),
        };

        let mut count = 0;
        for handle in registry.iter() {
            if let Some(name) = only
                && !handle.manifest.name.eq_ignore_ascii_case(name)
            {
                continue;
            }
            if handle.state() != SubServiceState::Paused {
                continue;
            }
            handle.with_runner(|control| {
                if let Some(control) = control {
                    control.retry_now();
                    count += 1;
                }
            });
        }
        Ok(count)
    }

    /// Starts the ≈1 Hz watchdog worker if any sub-service declares watch
    /// actions and it is not already running.
    fn ensure_watchdog(&self, registry: &Arc<Vec<Arc<SubServiceHandle>>>) {
        if registry.iter().all(|h| h.manifest.effective_watch().is_empty()) {
            return;
        }
        if self.watchdog_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = registry.clone();
        let ctx = self.ctx.clone();
        let http_client = self.http_client.clone();
        let http_timeout_ms = self.http_timeout_ms;
        let running = self.watchdog_running.clone();

        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(WATCHDOG_TICK);
                let now = Instant::now();
                for handle in registry.iter() {
                    if handle.has_runner() {
                        continue;
                    }
                    let due = match handle.next_watch() {
                        Some(at) => now >= at,
                        None => false,
                    };
                    if !due {
                        continue;
                    }
                    run_watch_tick(handle, &ctx, &http_client, http_timeout_ms);
                    let delay = Duration::from_secs(handle.manifest.watch_delay_sec);
                    handle.set_next_watch(Some(Instant::now() + delay));
                }
            }
        });
    }
}

/// When an action's parameter is empty, it defaults to the sub-service's
/// `run` field, itself placeholder-expanded (§4.2: "When the parameter is
/// empty it defaults to the SubService's `run` value").
fn with_run_default(
    mut parsed: action::ParsedAction,
    handle: &Arc<SubServiceHandle>,
    ctx: &ExpanderContext,
) -> Result<action::ParsedAction, crate::error::ExpandError> {
    if parsed.param.is_empty() && !handle.manifest.run.is_empty() {
        parsed.param = placeholder::expand(&handle.manifest.run, &handle.manifest, ctx)?;
    }
    Ok(parsed)
}

fn run_watch_tick(
    handle: &Arc<SubServiceHandle>,
    ctx: &ExpanderContext,
    http_client: &reqwest::blocking::Client,
    http_timeout_ms: u64,
) {
    handle.set_state(SubServiceState::ErrorRetrievingState, "");

    for action_str in handle.manifest.effective_watch() {
        let expanded = match placeholder::expand(&action_str, &handle.manifest, ctx) {
            Ok(s) => s,
            Err(err) => {
                handle.set_state(SubServiceState::Failed, err.to_string());
                return;
            }
        };
        let parsed = match with_run_default(action::parse(&expanded, Phase::Watch), handle, ctx) {
            Ok(p) => p,
            Err(err) => {
                handle.set_state(SubServiceState::Failed, err.to_string());
                return;
            }
        };
        let no_effects = NoRunnerEffects;
        match action::execute(&parsed, Phase::Watch, handle, http_client, http_timeout_ms, &no_effects) {
            Ok(true) => handle.set_state(SubServiceState::Running, ""),
            Ok(false) => {}
            Err(err) => handle.set_state(SubServiceState::Failed, err.to_string()),
        }
    }
}

/// `ActionEffects` used by the watchdog: `start`/`stop` verbs are not legal
/// in Watch phase, so both methods are unreachable in practice; they exist
/// only to satisfy the trait signature.
struct NoRunnerEffects;

impl ActionEffects for NoRunnerEffects {
    fn start(&self, _handle: &Arc<SubServiceHandle>, _param: &str) -> Result<bool, ActionError> {
        Err(ActionError::ServiceVerbUnsupported)
    }

    fn stop(&self, _handle: &Arc<SubServiceHandle>, _param: &str) -> Result<bool, ActionError> {
        Err(ActionError::ServiceVerbUnsupported)
    }
}

impl ActionEffects for Supervisor {
    fn start(&self, handle: &Arc<SubServiceHandle>, param: &str) -> Result<bool, ActionError> {
        if !handle.begin_start(param) {
            return Err(ActionError::AlreadyStarted(handle.manifest.name.clone()));
        }
        let control = runner::spawn_monitored(handle.clone(), param.to_string(), self.ctx.clone());
        handle.set_runner(control);
        Ok(true)
    }

    fn stop(&self, handle: &Arc<SubServiceHandle>, param: &str) -> Result<bool, ActionError> {
        if let Some(started) = handle.started_param()
            && started != param
            && !param.is_empty()
        {
            return Err(ActionError::StopParamMismatch {
                service: handle.manifest.name.clone(),
                given: param.to_string(),
                active: started,
            });
        }

        let control = handle.with_runner(|c| c.cloned());
        if let Some(control) = control {
            control.abort(handle.manifest.stop_run_abort_timeout_sec);
        }

        let effective_wait = Duration::from_secs((handle.manifest.stop_run_abort_timeout_sec * 3).max(1));
        let deadline = Instant::now() + effective_wait;
        while handle.has_runner() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if handle.has_runner() {
            warn!(service = %handle.manifest.name, "runner did not clear back-reference within the stop budget");
        }

        handle.clear_started();
        Ok(true)
    }
}

/// Runs the control-channel accept loop until `stop_flag` is set, dispatching
/// `ControlCommand`s against `supervisor`.
pub fn run_control_loop(supervisor: Arc<Supervisor>, stop_flag: Arc<AtomicBool>) -> Result<(), SupervisorError> {
    let listener = ipc::bind().map_err(|err| SupervisorError::Io(std::io::Error::new(ErrorKind::Other, err.to_string())))?;
    listener.set_nonblocking(true).map_err(SupervisorError::Io)?;

    while !stop_flag.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false).ok();
                let response = match ipc::read_command(&mut stream) {
                    Ok(ControlCommand::Resume { service }) => match supervisor.resume(service.as_deref()) {
                        Ok(n) => ControlResponse::Message(format!("resumed {n} sub-service(s)")),
                        Err(err) => ControlResponse::Error(err.to_string()),
                    },
                    Ok(ControlCommand::Stop) => {
                        stop_flag.store(true, Ordering::SeqCst);
                        ControlResponse::Ok
                    }
                    Err(err) => ControlResponse::Error(err.to_string()),
                };
                let _ = ipc::write_response(&mut stream, &response);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                warn!(%err, "control socket accept failed");
            }
        }
    }

    ipc::unbind();
    Ok(())
}

#[allow(dead_code)]
fn group_by_level(registry: &[Arc<SubServiceHandle>]) -> BTreeMap<i64, Vec<&Arc<SubServiceHandle>>> {
    let mut map: BTreeMap<i64, Vec<&Arc<SubServiceHandle>>> = BTreeMap::new();
    for handle in registry {
        map.entry(handle.manifest.level).or_default().push(handle);
    }
    map
}
