//! Registry of debuggable target threads.
//!
//! A thread becomes a debugging target by registering here; the chooser UI
//! lists exactly these entries. Threads belonging to the debugger itself
//! (the server loop, its workers) simply never register, which keeps them
//! out of the menu.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use nix::sys::pthread::{pthread_self, Pthread};
use tracing::debug;

use crate::inject::InjectionPayload;

/// Stable identity of a registered target thread. This is what the server
/// keys sessions by and what the chooser returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub id: u64,
    pub name: String,
}

impl std::fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (#{})", self.name, self.id)
    }
}

pub(crate) struct Entry {
    pub id: u64,
    pub name: String,
    pub pthread: Pthread,
    /// Payload parked by `inject` until the target reaches a safe point.
    pub pending: Mutex<Option<InjectionPayload>>,
    pub pending_flag: std::sync::atomic::AtomicBool,
}

fn registry() -> &'static Mutex<HashMap<u64, Arc<Entry>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<Entry>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

thread_local! {
    static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Guard returned by [`register_current_thread`]. Dropping it removes the
/// thread from the registry (unless the thread was already registered, in
/// which case the earlier registration stays in charge).
pub struct RegisteredThread {
    id: u64,
    owning: bool,
}

impl RegisteredThread {
    pub fn handle(&self) -> ThreadHandle {
        lookup(self.id)
            .map(|e| ThreadHandle {
                id: e.id,
                name: e.name.clone(),
            })
            .expect("registered thread must have an entry")
    }
}

impl Drop for RegisteredThread {
    fn drop(&mut self) {
        if !self.owning {
            return;
        }
        crate::trace::finish_thread();
        registry()
            .lock()
            .expect("registry lock poisoned")
            .remove(&self.id);
        CURRENT.with(|c| c.set(None));
        debug!(event = "engine.registry.thread_unregistered", id = self.id);
    }
}

/// Register the calling thread as a debugging target.
pub fn register_current_thread(name: &str) -> RegisteredThread {
    if let Some(id) = CURRENT.with(|c| c.get()) {
        return RegisteredThread { id, owning: false };
    }
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let entry = Arc::new(Entry {
        id,
        name: name.to_string(),
        pthread: pthread_self(),
        pending: Mutex::new(None),
        pending_flag: std::sync::atomic::AtomicBool::new(false),
    });
    registry()
        .lock()
        .expect("registry lock poisoned")
        .insert(id, entry);
    CURRENT.with(|c| c.set(Some(id)));
    debug!(event = "engine.registry.thread_registered", id = id, name = name);
    RegisteredThread { id, owning: true }
}

/// Handles of every currently registered target thread, ordered by id.
pub fn live_threads() -> Vec<ThreadHandle> {
    let guard = registry().lock().expect("registry lock poisoned");
    let mut handles: Vec<ThreadHandle> = guard
        .values()
        .map(|e| ThreadHandle {
            id: e.id,
            name: e.name.clone(),
        })
        .collect();
    handles.sort_by_key(|h| h.id);
    handles
}

/// The calling thread's handle, if it is registered.
pub fn current_thread_handle() -> Option<ThreadHandle> {
    let id = CURRENT.with(|c| c.get())?;
    lookup(id).map(|e| ThreadHandle {
        id: e.id,
        name: e.name.clone(),
    })
}

pub(crate) fn lookup(id: u64) -> Option<Arc<Entry>> {
    registry()
        .lock()
        .expect("registry lock poisoned")
        .get(&id)
        .cloned()
}

pub(crate) fn current_entry() -> Option<Arc<Entry>> {
    let id = CURRENT.with(|c| c.get())?;
    lookup(id)
}

pub(crate) fn is_current(id: u64) -> bool {
    CURRENT.with(|c| c.get()) == Some(id)
}
