//! Observer registry shared by the pipeline, the optimizer and the supply
//! controller.
//!
//! Observers (plots, loggers, run recorders) register closures and receive
//! every emitted event by reference. Emission clones the callback list out of
//! the lock first, so a callback may register or deregister others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Callback function type
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct CallbackRegistry<E> {
    callbacks: Mutex<HashMap<CallbackId, Callback<E>>>,
    next_callback_id: AtomicU64,
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(0),
        }
    }
}

impl<E> CallbackRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for events
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let callback_id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(callback_id, Arc::new(callback));
        callback_id
    }

    /// Deregister a callback
    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&callback_id)
            .is_some()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Emit an event to all registered callbacks
    pub fn emit_event(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}
