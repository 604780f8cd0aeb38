//! Interpreter-level process state: the argv scripts observe and the module
//! search path. `run_script` substitutes both so a script sees itself as the
//! program being run, and restores them exactly on every exit path.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostState {
    pub argv: Vec<String>,
    pub search_path: Vec<PathBuf>,
}

fn state() -> &'static Mutex<HostState> {
    static STATE: OnceLock<Mutex<HostState>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(HostState {
            argv: std::env::args().collect(),
            search_path: vec![PathBuf::from(".")],
        })
    })
}

pub fn snapshot() -> HostState {
    state().lock().expect("host state lock poisoned").clone()
}

pub fn set_argv(argv: Vec<String>) {
    state().lock().expect("host state lock poisoned").argv = argv;
}

pub fn argv() -> Vec<String> {
    snapshot().argv
}

pub fn search_path() -> Vec<PathBuf> {
    snapshot().search_path
}

/// Put `dir` at the front of the search path, the slot a running script's
/// own directory occupies.
pub fn set_script_dir(dir: PathBuf) {
    let mut guard = state().lock().expect("host state lock poisoned");
    guard.search_path.insert(0, dir);
}

pub fn push_search_path(dir: PathBuf) {
    let mut guard = state().lock().expect("host state lock poisoned");
    guard.search_path.push(dir);
}

/// RAII restore of argv and search path. Dropping the guard writes back the
/// state captured at construction, whatever happened in between.
pub struct PreserveGuard {
    saved: HostState,
}

pub fn preserve() -> PreserveGuard {
    PreserveGuard { saved: snapshot() }
}

impl Drop for PreserveGuard {
    fn drop(&mut self) {
        let mut guard = state().lock().expect("host state lock poisoned");
        *guard = self.saved.clone();
    }
}

/// Serialises tests that touch the process-wide host state.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
