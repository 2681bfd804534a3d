//! Live processing state shared between the engine and status readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub const IDLE_MESSAGE: &str = "Idle";

/// In-memory view of the current run, polled by the status boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub is_processing: bool,
    /// 0-100.
    pub progress: u8,
    pub current_identifier: Option<String>,
    pub status_message: String,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self {
            is_processing: false,
            progress: 0,
            current_identifier: None,
            status_message: IDLE_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    active: AtomicBool,
    state: Mutex<ProcessingState>,
}

/// Cloneable handle to the process-wide processing state.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Inner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProcessingState {
        self.lock().clone()
    }

    /// True while a [`RunPermit`] is alive.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Replace the status message without touching the rest of the state.
    pub fn set_message(&self, message: impl Into<String>) {
        self.lock().status_message = message.into();
    }

    /// Claim the single run slot. `None` if a run is already active.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.lock().is_processing = true;
        Some(RunPermit {
            state: self.clone(),
        })
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut ProcessingState)) {
        apply(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, ProcessingState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to run the engine. Dropping it returns the state to idle,
/// whether the run finished or bailed out early.
#[derive(Debug)]
pub struct RunPermit {
    state: SharedState,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.state.update(|s| {
            s.is_processing = false;
            s.progress = 0;
            s.current_identifier = None;
        });
        self.state.inner.active.store(false, Ordering::SeqCst);
    }
}
