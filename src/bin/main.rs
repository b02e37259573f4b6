use std::{
    error::Error,
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use nix::unistd::Uid;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agentsvc::{
    cli::{Cli, Commands, parse_args},
    constants::DEFAULT_MANIFEST_EXT,
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    manifest,
    runtime::{self, RuntimeMode},
    state,
    supervisor::Supervisor,
};

fn main() -> Result<(), Box<dyn Error>> {
    let cli = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if cli.sys {
        if !euid.is_root() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "--sys requires root privileges",
            )
            .into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(runtime_mode);
    runtime::set_drop_privileges(cli.drop_privileges);
    if cli.drop_privileges && !euid.is_root() {
        warn!("--drop-privileges has no effect when not running as root");
    }
    runtime::capture_socket_activation();
    init_logging(&cli);

    if euid.is_root() && runtime_mode == RuntimeMode::User {
        warn!("running as root without --sys; state will be stored in userspace paths");
    }

    match cli.command {
        Commands::Run { params } => run_foreground(cli.manifest_dir, cli.settings, params)?,
        Commands::Stop => send_stop()?,
        Commands::List { json } => list_state(cli.manifest_dir, cli.settings, json)?,
        Commands::Settings => print_settings(cli.manifest_dir, cli.settings)?,
        Commands::New {
            name,
            exe,
            params,
            level,
        } => new_manifest(cli.manifest_dir, cli.settings, &name, &exe, &params, level)?,
        Commands::Retry { service } | Commands::Resume { service } => send_resume(service)?,
    }

    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = if let Some(level) = cli.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_dir = runtime::log_dir();
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir:?}: {err}");
    }
    let log_path = log_dir.join("supervisor.log");

    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open supervisor log file {log_path:?}: {err}");
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().expect("clone log file handle"))
        .with_ansi(false)
        .try_init();
}

/// Resolves the manifest directory and extension the same way `Supervisor::new`
/// does, without the side effects of constructing a full supervisor (state
/// file validation/clearing). Used by `settings`, `list` and `new`, which
/// only need to read, not take ownership of, the supervisor's runtime state.
fn resolve_manifest_location(
    manifest_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
) -> Result<(PathBuf, String, manifest::SupervisorSettings), Box<dyn Error>> {
    let settings_path = settings_path.unwrap_or_else(|| {
        let mut dirs = runtime::config_dirs();
        let dir = dirs.pop().unwrap_or_else(|| PathBuf::from("."));
        dir.join("settings.yaml")
    });
    let settings = manifest::load_settings(&settings_path)?;

    let dir = manifest_dir
        .or_else(|| settings.manifest_dir.clone().map(PathBuf::from))
        .unwrap_or_else(runtime::default_manifest_dir);
    let ext = settings
        .manifest_ext
        .clone()
        .unwrap_or_else(|| DEFAULT_MANIFEST_EXT.to_string());

    Ok((dir, ext, settings))
}

fn run_foreground(
    manifest_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    params: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    let supervisor = Arc::new(Supervisor::new_with_params(manifest_dir, settings_path, params)?);
    info!("starting supervisor");
    supervisor.start()?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    register_signal_handler(stop_flag.clone());

    let control_supervisor = supervisor.clone();
    let control_stop_flag = stop_flag.clone();
    let control_thread = thread::spawn(move || {
        if let Err(err) = agentsvc::supervisor::run_control_loop(control_supervisor, control_stop_flag) {
            error!(%err, "control channel loop exited with an error");
        }
    });

    while !stop_flag.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(200));
    }

    let _ = control_thread.join();
    info!("stopping supervisor");
    supervisor.stop()?;
    Ok(())
}

fn register_signal_handler(stop_flag: Arc<AtomicBool>) {
    let _ = ctrlc::set_handler(move || {
        println!("agentsvc is shutting down...");
        stop_flag.store(true, Ordering::SeqCst);
    });
}

fn send_stop() -> Result<(), Box<dyn Error>> {
    send_control_command(ControlCommand::Stop)
}

fn send_resume(service: Option<String>) -> Result<(), Box<dyn Error>> {
    send_control_command(ControlCommand::Resume { service })
}

fn send_control_command(command: ControlCommand) -> Result<(), Box<dyn Error>> {
    match ipc::send_command(&command) {
        Ok(ControlResponse::Message(message)) => {
            println!("{message}");
            Ok(())
        }
        Ok(ControlResponse::Ok) => Ok(()),
        Ok(ControlResponse::Error(message)) => Err(ControlError::Server(message).into()),
        Err(ControlError::NotAvailable) => {
            warn!("no running supervisor found; command not sent");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn list_state(
    manifest_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let (_, _, settings) = resolve_manifest_location(manifest_dir, settings_path)?;
    let state_path = settings
        .state_file
        .map(PathBuf::from)
        .unwrap_or_else(runtime::default_state_file);

    let snapshot = state::read_snapshot(&state_path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.services)?);
        return Ok(());
    }

    if snapshot.services.is_empty() {
        println!("no sub-services found in state file {state_path:?}");
        return Ok(());
    }

    println!("{:<24} {:<22} {}", "NAME", "STATE", "INFO");
    for row in &snapshot.services {
        println!("{:<24} {:<22} {}", row.name, row.state, row.info);
    }
    Ok(())
}

fn print_settings(
    manifest_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let (dir, ext, _) = resolve_manifest_location(manifest_dir, settings_path)?;
    let manifests = manifest::load_manifests(&dir, &ext)?;
    let enabled = manifests.iter().filter(|m| m.is_enabled()).count();
    let disabled = manifests.len() - enabled;

    println!("manifest directory: {dir:?}");
    println!("manifest extension: .{ext}");
    println!(
        "discovered {} sub-service manifest(s): {enabled} enabled, {disabled} disabled",
        manifests.len()
    );
    Ok(())
}

fn new_manifest(
    manifest_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    name: &str,
    exe: &str,
    params: &[String],
    level: i64,
) -> Result<(), Box<dyn Error>> {
    let (dir, ext, _) = resolve_manifest_location(manifest_dir, settings_path)?;
    let path = manifest::write_new_manifest(&dir, &ext, name, exe, params, level)?;
    println!("wrote manifest {path:?}");
    Ok(())
}

