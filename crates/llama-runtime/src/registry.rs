//! Handle registries.
//!
//! Handles are plain `i32`s so they can cross a C boundary (and be shared
//! between foreign isolates) without exposing pointers. They are issued from
//! a monotonic counter and never reused, so a stale handle can only ever miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque handle type.
pub type Handle = i32;

/// Sentinel returned across the boundary when no handle could be produced.
pub const INVALID_HANDLE: Handle = -1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Handle space exhausted")]
    Exhausted,
}

struct Slots<T> {
    /// Next handle to issue. Kept wider than `Handle` so exhaustion is detectable.
    next: i64,
    entries: HashMap<Handle, Arc<T>>,
}

/// Concurrent map from [`Handle`] to `Arc<T>`.
///
/// Lookups hand out clones of the `Arc`, so removing an entry never frees an
/// object another thread is still using.
pub struct HandleRegistry<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(next: i64) -> Self {
        Self {
            slots: Mutex::new(Slots {
                next,
                entries: HashMap::new(),
            }),
        }
    }

    /// Register `value` and return its handle.
    pub fn insert(&self, value: T) -> Result<Handle, RegistryError> {
        self.insert_arc(Arc::new(value))
    }

    /// Register an already shared value.
    ///
    /// # Errors
    /// - `Exhausted`: every non-negative `i32` has been issued
    pub fn insert_arc(&self, value: Arc<T>) -> Result<Handle, RegistryError> {
        let mut slots = self.slots.lock();
        let handle = Handle::try_from(slots.next).map_err(|_| RegistryError::Exhausted)?;
        slots.next += 1;
        slots.entries.insert(handle, value);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.slots.lock().entries.get(&handle).cloned()
    }

    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.slots.lock().entries.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.lock().entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry. The counter keeps running.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.slots.lock().entries.drain().map(|(_, v)| v).collect()
    }
}

/// Issues process-stable identities, starting at 0.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_start_at_zero() {
        let reg = HandleRegistry::new();
        assert_eq!(reg.insert("a").unwrap(), 0);
        assert_eq!(reg.insert("b").unwrap(), 1);
    }

    #[test]
    fn removed_handles_are_not_reused() {
        let reg = HandleRegistry::new();
        let a = reg.insert(1).unwrap();
        reg.remove(a);
        let b = reg.insert(2).unwrap();
        assert!(b > a);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn fails_closed_past_i32_max() {
        let reg = HandleRegistry::starting_at(i32::MAX as i64);
        assert_eq!(reg.insert(()).unwrap(), i32::MAX);
        assert_eq!(reg.insert(()), Err(RegistryError::Exhausted));
        assert_eq!(reg.insert(()), Err(RegistryError::Exhausted));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn removed_value_outlives_entry() {
        let reg = HandleRegistry::new();
        let h = reg.insert(String::from("model")).unwrap();
        let held = reg.get(h).unwrap();
        reg.remove(h);
        assert_eq!(held.as_str(), "model");
    }

    #[test]
    fn drain_empties_registry() {
        let reg = HandleRegistry::new();
        reg.insert(1).unwrap();
        reg.insert(2).unwrap();
        assert_eq!(reg.drain().len(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.insert(3).unwrap(), 2);
    }

    #[test]
    fn id_generator_is_monotonic() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }
}
