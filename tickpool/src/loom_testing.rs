//! Switchable re-exports so the whole crate can be model-checked under
//! [loom](https://docs.rs/loom) by building with `RUSTFLAGS="--cfg loom"`.
//!
//! Only the atomics that participate in cross-thread protocols are shimmed.
//! Plain cells stay `std`; everything behind them is thread-private by
//! construction and loom has nothing to explore there.

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

#[cfg(not(loom))]
pub use antidote::Mutex;

#[cfg(loom)]
#[derive(Debug, Default)]
pub struct Mutex<T>(loom::sync::Mutex<T>);

#[cfg(loom)]
impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self(loom::sync::Mutex::new(t))
    }

    pub fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
        self.0.lock().unwrap()
    }
}

#[cfg(not(loom))]
pub use crossbeam_utils::Backoff;

/// Under loom, spinning burns the model checker's time without adding any
/// interleavings, so every backoff point becomes an explicit yield instead.
#[cfg(loom)]
#[derive(Debug)]
pub struct Backoff;

#[cfg(loom)]
impl Backoff {
    pub fn new() -> Self {
        Backoff
    }

    pub fn spin(&self) {
        loom::thread::yield_now();
    }
}
