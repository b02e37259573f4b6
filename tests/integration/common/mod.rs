use std::{env, path::Path};

/// Serializes any test that touches the process-wide `HOME` environment
/// variable or the global runtime context, and restores the previous value
/// on drop.
pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = agentsvc::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        agentsvc::runtime::init(agentsvc::runtime::RuntimeMode::User);
        agentsvc::runtime::set_drop_privileges(false);
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
        agentsvc::runtime::init(agentsvc::runtime::RuntimeMode::User);
    }
}

#[allow(dead_code)]
pub fn write_manifest(dir: &Path, file: &str, body: &str) {
    std::fs::write(dir.join(file), body).expect("write manifest");
}
