//! Mutex that takes over poisoned locks instead of failing.

use std::sync::{MutexGuard, PoisonError};

/// Thin wrapper around [`std::sync::Mutex`].
#[derive(Debug, Default)]
pub struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    /// New unlocked mutex
    pub const fn new(data: T) -> Self {
        Self(std::sync::Mutex::new(data))
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
