//! Blocking rendezvous between a notification callback and the thread
//! running the handshake.
//!
//! Callbacks only ever [`Rendezvous::post`]; orchestration code only ever
//! waits. A binary rendezvous holds at most one pending post and reports
//! extra posts as [`PostOutcome::Coalesced`], so callers that cannot afford
//! to lose a wakeup keep their payloads elsewhere and treat the rendezvous
//! purely as a wake signal.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

use crate::wait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendezvousMode {
    /// Capacity-one slot; posts while full coalesce.
    Binary,
    /// Every post is counted and consumed by exactly one wait.
    Counting,
}

/// Result of a post.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    Accepted,
    /// The binary slot was already full.
    Coalesced,
}

#[derive(Debug)]
pub struct Rendezvous {
    mode: RendezvousMode,
    count: AtomicU32,
}

impl Rendezvous {
    pub fn new(mode: RendezvousMode) -> Self {
        Self {
            mode,
            count: AtomicU32::new(0),
        }
    }

    pub fn binary() -> Self {
        Self::new(RendezvousMode::Binary)
    }

    pub fn counting() -> Self {
        Self::new(RendezvousMode::Counting)
    }

    pub fn mode(&self) -> RendezvousMode {
        self.mode
    }

    pub fn post(&self) -> PostOutcome {
        let outcome = match self.mode {
            RendezvousMode::Binary => {
                if self.count.swap(1, Ordering::AcqRel) == 0 {
                    PostOutcome::Accepted
                } else {
                    PostOutcome::Coalesced
                }
            }
            RendezvousMode::Counting => {
                self.count.fetch_add(1, Ordering::AcqRel);
                PostOutcome::Accepted
            }
        };
        wait::wake_one(&self.count);
        outcome
    }

    /// Consumes one post if any is pending.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Blocks until a post is available and consumes it. No timeout.
    pub fn wait_forever(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            wait::wait_u32(&self.count, 0);
        }
    }

    /// Posts not yet consumed.
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    #[ignore = "slow loom model"]
    fn slow_loom_binary_post_is_observed_once() {
        loom::model(|| {
            let rendezvous = Arc::new(Rendezvous::binary());
            let poster = {
                let rendezvous = Arc::clone(&rendezvous);
                thread::spawn(move || {
                    rendezvous.post();
                })
            };
            rendezvous.wait_forever();
            poster.join().expect("poster");
            assert!(!rendezvous.try_wait());
        });
    }

    #[test]
    #[ignore = "slow loom model"]
    fn slow_loom_counting_posts_are_not_lost() {
        loom::model(|| {
            let rendezvous = Arc::new(Rendezvous::counting());
            let posters: Vec<_> = (0..2)
                .map(|_| {
                    let rendezvous = Arc::clone(&rendezvous);
                    thread::spawn(move || {
                        rendezvous.post();
                    })
                })
                .collect();
            rendezvous.wait_forever();
            rendezvous.wait_forever();
            for poster in posters {
                poster.join().expect("poster");
            }
            assert_eq!(rendezvous.pending(), 0);
        });
    }
}
