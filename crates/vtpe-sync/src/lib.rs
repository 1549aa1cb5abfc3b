//! Synchronization primitives used throughout the paging engine.
//!
//! Currently this just re-exports and aliases objects from `std::sync`, but
//! isolating them behind this crate means every lock in the engine can be
//! swapped for a different implementation (e.g. a parking-lot style mutex,
//! should contention ever justify the dependency) from a single place.

pub use std::sync::{Condvar, MutexGuard, OnceLock};

/// The lock guarding the mutable state of a single component (the page
/// array + free list + reverse map of `PhysicalSpace`, the pending-request
/// vector of `Scheduler`, the FIFO or active-request map of `AsyncLoader`).
pub type Mutex<T> = std::sync::Mutex<T>;

/// A value that is computed once, lazily, the first time it is accessed.
pub type Lazy<T, F = fn() -> T> = std::sync::LazyLock<T, F>;

/// Locks `mutex`, recovering the guard even if a prior holder panicked
/// while holding the lock.
///
/// None of the engine's locked sections are expected to panic (every
/// mutating operation documents its invariants precisely so that it
/// shouldn't need to), so poisoning here most likely comes from a test
/// harness deliberately panicking mid-test; recovering keeps the rest of
/// the suite runnable instead of cascading one failure into every other
/// test that happens to touch the same lock.
pub fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
