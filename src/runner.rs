//! Per-sub-service monitored worker (§4.4).
//!
//! One `Runner` owns one child process for as long as the sub-service is
//! monitored: it spawns the command, streams its console output into an
//! optional redirect file with size-based, line-aligned rotation, and
//! enforces the retry/backoff ladder and abort-exit-code semantics. Console
//! output is byte-copied, never reparsed into a structured format.

use std::{
    fs::OpenOptions,
    io::{Read, Write},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_SHELL, RETRY_PAUSE_AT_LEAST_1_MIN_SEC, RETRY_PAUSE_BASE_SEC,
    RETRY_PAUSE_OVER_10_MIN_SEC, RETRY_PAUSE_OVER_30_MIN_SEC, RETRY_PAUSE_OVER_5_MIN_SEC,
    RETRY_PAUSE_OVER_60_MIN_SEC, RETRY_JITTER_MS_PER_SEC, SHELL_COMMAND_FLAG,
};
use crate::manifest::SubServiceManifest;
use crate::placeholder::{self, ExpanderContext};
use crate::subservice::{SubServiceHandle, SubServiceState};

/// Internal wakeup reason: either "retry now" (keep running) or "abort"
/// (terminate and do not restart).
struct RunnerSignal {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl RunnerSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        self.cv.notify_all();
    }

    /// Blocks up to `dur`, returning early if notified. Always clears the
    /// flag before returning so the next wait starts fresh.
    fn wait_for(&self, dur: Duration) {
        let guard = self.flag.lock().unwrap_or_else(|p| p.into_inner());
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, dur, |notified| !*notified)
            .unwrap_or_else(|p| p.into_inner());
        *guard = false;
    }
}

/// Handle the rest of the system uses to signal a running Runner: abort (with
/// graceful-then-hard termination of the in-flight child) or retry-now.
#[derive(Clone)]
pub struct RunnerControl {
    abort_flag: Arc<AtomicBool>,
    signal: Arc<RunnerSignal>,
    child_pid: Arc<Mutex<Option<i32>>>,
}

impl RunnerControl {
    fn new() -> Self {
        Self {
            abort_flag: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(RunnerSignal::new()),
            child_pid: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    /// Signals abort: sends a graceful termination signal to the in-flight
    /// child immediately, wakes any retry wait, and schedules a hard kill
    /// after `stop_run_abort_timeout_sec` if the child is still alive by then
    /// (§5 abort semantics).
    pub fn abort(&self, stop_run_abort_timeout_sec: u64) {
        self.abort_flag.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.child_pid.lock().unwrap_or_else(|p| p.into_inner()) {
            signal_process_group(pid, Signal::SIGTERM);
        }
        self.signal.notify();

        let child_pid = self.child_pid.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(stop_run_abort_timeout_sec));
            if let Some(pid) = *child_pid.lock().unwrap_or_else(|p| p.into_inner()) {
                signal_process_group(pid, Signal::SIGKILL);
            }
        });
    }

    /// Releases a retry wait without setting the abort flag.
    pub fn retry_now(&self) {
        self.signal.notify();
    }
}

/// Signals a whole child process group (the POSIX analogue of the Windows
/// job-object cascade in §5): since `build_command` places every spawned
/// child in its own process group via `process_group(0)`, `-pid` reaches the
/// child and any descendants it spawned, not just the immediate child.
fn signal_process_group(pid: i32, sig: Signal) {
    let _ = signal::kill(Pid::from_raw(-pid), sig);
}

/// Size-threshold, line-aligned log rotation writer (§4.4 rotation
/// procedure, §8 properties 7-8). Permanently disables itself on the first
/// I/O error, per the "redirect-log I/O errors abort further redirect
/// writing" error-handling rule.
struct RedirectWriter {
    service: String,
    path: PathBuf,
    file: Option<std::fs::File>,
    size: u64,
    rotate_bytes: u64,
    rotate_files: u32,
}

impl RedirectWriter {
    fn open(service: String, path: PathBuf, rotate_bytes: u64, rotate_files: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            service,
            path,
            file: Some(file),
            size,
            rotate_bytes,
            rotate_files,
        })
    }

    fn numbered(&self, k: u32) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(format!(".{k}"));
        PathBuf::from(os)
    }

    fn disable(&mut self, err: std::io::Error) {
        warn!(service = %self.service, %err, "redirect log write failed; closing redirect file");
        self.file = None;
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        let n = self.rotate_files;
        if n >= 2 {
            let oldest = self.numbered(n - 1);
            let _ = std::fs::remove_file(&oldest);
            for k in (1..=(n.saturating_sub(2))).rev() {
                let from = self.numbered(k);
                let to = self.numbered(k + 1);
                if from.exists() {
                    std::fs::rename(&from, &to)?;
                }
            }
        }
        if n >= 1 && self.path.exists() {
            std::fs::rename(&self.path, self.numbered(1))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.size = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.file.is_none() {
            return;
        }

        if self.rotate_files == 0 || self.rotate_bytes == 0 {
            if let Err(e) = self.file.as_mut().unwrap().write_all(data) {
                self.disable(e);
            } else {
                self.size += data.len() as u64;
            }
            return;
        }

        if self.size + data.len() as u64 <= self.rotate_bytes {
            if let Err(e) = self.file.as_mut().unwrap().write_all(data) {
                self.disable(e);
            } else {
                self.size += data.len() as u64;
            }
            return;
        }

        let split_at = data
            .iter()
            .rposition(|&b| b == b'\n' || b == b'\r')
            .map(|idx| idx + 1)
            .unwrap_or(data.len());
        let (prefix, suffix) = data.split_at(split_at);

        if !prefix.is_empty() {
            if let Err(e) = self.file.as_mut().unwrap().write_all(prefix) {
                self.disable(e);
                return;
            }
            self.size += prefix.len() as u64;
        }

        if let Err(e) = self.rotate() {
            self.disable(e);
            return;
        }

        if !suffix.is_empty() {
            if let Some(file) = self.file.as_mut() {
                if let Err(e) = file.write_all(suffix) {
                    self.disable(e);
                    return;
                }
                self.size = suffix.len() as u64;
            }
        }
    }
}

fn spawn_stream_reader(
    service: Arc<SubServiceHandle>,
    mut reader: impl Read + Send + 'static,
    writer: Arc<Mutex<Option<RedirectWriter>>>,
    kind: &'static str,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    debug!(service = %service.manifest.name, kind, bytes = n, "console output");
                    if let Some(w) = writer.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
                        w.write(chunk);
                    }
                }
                Err(_) => break,
            }
        }
    })
}

fn jitter_ms(pause_sec: u64) -> u64 {
    if pause_sec == 0 {
        return 0;
    }
    let cap = pause_sec * RETRY_JITTER_MS_PER_SEC;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % (cap + 1)
}

/// Computes the backoff pause given elapsed time since the first unstable
/// run, mirroring the ladder table literally (§8 property 5).
fn compute_pause(since_first_unstable: Duration) -> u64 {
    let minutes = since_first_unstable.as_secs() / 60;
    if minutes > 60 {
        RETRY_PAUSE_OVER_60_MIN_SEC
    } else if minutes > 30 {
        RETRY_PAUSE_OVER_30_MIN_SEC
    } else if minutes > 10 {
        RETRY_PAUSE_OVER_10_MIN_SEC
    } else if minutes > 5 {
        RETRY_PAUSE_OVER_5_MIN_SEC
    } else if minutes >= 1 {
        RETRY_PAUSE_AT_LEAST_1_MIN_SEC
    } else {
        RETRY_PAUSE_BASE_SEC
    }
}

fn build_command(manifest: &SubServiceManifest, param: &str, ctx: &ExpanderContext) -> std::io::Result<Command> {
    let mut command = Command::new(DEFAULT_SHELL);
    command.arg(SHELL_COMMAND_FLAG).arg(param);

    if !manifest.start_work_dir.is_empty() {
        let dir = placeholder::expand(&manifest.start_work_dir, manifest, ctx)
            .unwrap_or_else(|_| manifest.start_work_dir.clone());
        command.current_dir(dir);
    }

    if !manifest.start_env.is_empty() {
        if manifest.start_options.so_replace_env {
            command.env_clear();
        }
        for entry in &manifest.start_env {
            if let Some((key, value)) = entry.split_once('=') {
                let expanded = placeholder::expand(value, manifest, ctx).unwrap_or_else(|_| value.to_string());
                command.env(key, expanded);
            }
        }
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // New process group per child (POSIX stand-in for the Windows job
    // object in §5): `abort` signals `-pid` to reach descendants too.
    command.process_group(0);
    Ok(command)
}

/// Spawns the monitored worker thread for `handle` using `param` as the
/// already-expanded command line. Returns the `RunnerControl` used to abort
/// or retry it.
pub fn spawn_monitored(
    handle: Arc<SubServiceHandle>,
    param: String,
    ctx: Arc<ExpanderContext>,
) -> RunnerControl {
    let control = RunnerControl::new();
    let worker_control = control.clone();

    thread::spawn(move || runner_loop(handle, param, ctx, worker_control));

    control
}

fn runner_loop(
    handle: Arc<SubServiceHandle>,
    param: String,
    ctx: Arc<ExpanderContext>,
    control: RunnerControl,
) {
    let manifest = handle.manifest.clone();
    let retry_stable_sec = manifest.retry_stable_sec;
    let abort_exit_codes = manifest.abort_exit_codes.clone();

    let redirect_writer: Option<Arc<Mutex<Option<RedirectWriter>>>> = if manifest.redirect_log_file.is_empty()
    {
        None
    } else {
        match placeholder::expand(&manifest.redirect_log_file, &manifest, &ctx) {
            Ok(path) => {
                match RedirectWriter::open(
                    manifest.name.clone(),
                    PathBuf::from(path),
                    manifest.redirect_log_rotate_bytes.0,
                    manifest.redirect_log_rotate_files,
                ) {
                    Ok(writer) => Some(Arc::new(Mutex::new(Some(writer)))),
                    Err(err) => {
                        warn!(service = %manifest.name, %err, "failed to open redirect log file");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(service = %manifest.name, %err, "failed to expand redirect log file template");
                None
            }
        }
    };

    let mut first_unstable: Option<Instant> = None;

    loop {
        handle.set_state(SubServiceState::Starting, param.clone());
        let start_tick = Instant::now();

        let mut command = match build_command(&manifest, &param, &ctx) {
            Ok(c) => c,
            Err(err) => {
                handle.set_state(SubServiceState::Failed, format!("command build error: {err}"));
                if !finish_cycle_and_should_retry(
                    &control,
                    &handle,
                    -1,
                    retry_stable_sec,
                    &abort_exit_codes,
                    start_tick,
                    &mut first_unstable,
                ) {
                    break;
                }
                continue;
            }
        };

        let exit_code = match command.spawn() {
            Ok(mut child) => {
                let pid = child.id() as i32;
                control
                    .child_pid
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .replace(pid);
                handle.set_state(SubServiceState::Running, format!("PID={pid}"));

                let stdout_handle = child.stdout.take().map(|stdout| {
                    redirect_writer.clone().map(|w| {
                        spawn_stream_reader(handle.clone(), stdout, w, "stdout")
                    })
                });
                let stderr_handle = child.stderr.take().map(|stderr| {
                    redirect_writer.clone().map(|w| {
                        spawn_stream_reader(handle.clone(), stderr, w, "stderr")
                    })
                });

                let status = child.wait();
                control.child_pid.lock().unwrap_or_else(|p| p.into_inner()).take();

                if let Some(Some(h)) = stdout_handle {
                    let _ = h.join();
                }
                if let Some(Some(h)) = stderr_handle {
                    let _ = h.join();
                }

                match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(err) => {
                        warn!(service = %manifest.name, %err, "failed to wait on child process");
                        -1
                    }
                }
            }
            Err(err) => {
                handle.set_state(SubServiceState::Failed, format!("spawn error: {err}"));
                -1
            }
        };

        handle.set_runner_exit_code(Some(exit_code));
        handle.set_state(SubServiceState::Stopped, format!("ExitCode={exit_code}"));

        if !finish_cycle_and_should_retry(
            &control,
            &handle,
            exit_code,
            retry_stable_sec,
            &abort_exit_codes,
            start_tick,
            &mut first_unstable,
        ) {
            break;
        }
    }

    handle.clear_runner();
}

/// Applies the retry/backoff decision after one run of the child completes.
/// Returns `true` when the loop should spawn again, `false` when it should
/// exit (aborted).
fn finish_cycle_and_should_retry(
    control: &RunnerControl,
    handle: &Arc<SubServiceHandle>,
    exit_code: i32,
    retry_stable_sec: u64,
    abort_exit_codes: &[i32],
    start_tick: Instant,
    first_unstable: &mut Option<Instant>,
) -> bool {
    if control.is_aborted() {
        return false;
    }

    if retry_stable_sec == 0 || abort_exit_codes.contains(&exit_code) {
        handle.set_state(SubServiceState::Paused, "Wait for abort or /retry");
        control.signal.wait_for(Duration::from_secs(u64::MAX / 2));
        return !control.is_aborted();
    }

    let elapsed = start_tick.elapsed();
    if elapsed >= Duration::from_secs(retry_stable_sec) {
        *first_unstable = None;
        return true;
    }

    let since_unstable = first_unstable.get_or_insert_with(Instant::now).elapsed();
    let pause_sec = compute_pause(since_unstable);
    handle.set_state(SubServiceState::Paused, format!("Wait {pause_sec} sec"));
    control
        .signal
        .wait_for(Duration::from_millis(pause_sec * 1000 + jitter_ms(pause_sec)));
    !control.is_aborted()
}
