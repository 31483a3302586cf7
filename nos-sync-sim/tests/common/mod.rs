//! Common test utilities
//!
//! Shared helpers for the simulated-machine scenarios.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nos_sync::Priority;

/// Ordered record of what the simulated contexts did.
///
/// Contexts run one at a time, so the entries come out in execution order.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Shorthand for `Priority::new`.
pub fn pri(value: u8) -> Priority {
    Priority::new(value)
}
