//! Park/unpark on a 32-bit counter.
//!
//! Native builds use the `atomic-wait` crate (futex-backed where the OS has
//! one). Under `--features loom` the wait degrades to a yield so the model
//! checker can explore the interleavings of the retry loops built on top.

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU32;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU32;

#[cfg(feature = "loom")]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        let _ = (atomic, expected);
        loom::thread::yield_now();
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        let _ = atomic;
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        atomic_wait::wait(atomic, expected);
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        atomic_wait::wake_one(atomic as *const AtomicU32);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Parks while `atomic` still holds `expected`. May return spuriously;
/// callers re-check their condition in a loop.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) {
    imp::wait_u32(atomic, expected)
}

/// Wakes at most one thread parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32) {
    imp::wake_one(atomic)
}

/// Wakes every thread parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}
