//! Long-poll wait coordination.
//!
//! Waiters block on one condition variable that is signalled only when a new
//! best tip is accepted. Mempool changes never signal; a waiter notices them
//! by comparing the update counter each time its re-check timer fires.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::MiningError;
use crate::primitives::BlockHash;

pub const DEFAULT_MEMPOOL_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// `(watched tip, mempool version)` a client last saw. Rendered as 64 hex
/// characters of the tip hash followed by the decimal version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPollToken {
    pub tip: BlockHash,
    pub mempool_version: u64,
}

impl fmt::Display for LongPollToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tip, self.mempool_version)
    }
}

impl FromStr for LongPollToken {
    type Err = MiningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| MiningError::InvalidInput(format!("longpollid {why}"));
        if s.len() < 64 || !s.is_char_boundary(64) {
            return Err(bad("too short"));
        }
        let (tip, version) = s.split_at(64);
        let tip: BlockHash = tip.parse().map_err(|e| bad(&format!("{e}")))?;
        let mempool_version = if version.is_empty() {
            0
        } else {
            version
                .parse()
                .map_err(|_| bad("has a non-numeric mempool version"))?
        };
        Ok(LongPollToken {
            tip,
            mempool_version,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    TipChanged(BlockHash),
    MempoolChanged,
    TimedOut,
    ShuttingDown,
}

#[derive(Debug)]
struct WaitState {
    best_tip: BlockHash,
    mempool_version: u64,
}

pub struct LongPollCoordinator {
    state: Mutex<WaitState>,
    tip_changed: Condvar,
    /// Written under `state`'s lock so a waiter cannot miss the wakeup;
    /// read without it by search loops on every nonce.
    shutting_down: AtomicBool,
    mempool_grace: Duration,
    recheck_interval: Duration,
}

impl LongPollCoordinator {
    pub fn new(best_tip: BlockHash, mempool_grace: Duration, recheck_interval: Duration) -> Self {
        LongPollCoordinator {
            state: Mutex::new(WaitState {
                best_tip,
                mempool_version: 0,
            }),
            tip_changed: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            mempool_grace,
            recheck_interval,
        }
    }

    /// Records a newly accepted best tip and wakes every waiter. Call only
    /// after the engine's own tip pointer has been updated: a released
    /// waiter goes straight to the template cache, which reads the tip from
    /// the engine, and must see the new one there.
    pub fn tip_updated(&self, tip: BlockHash) {
        let mut state = self.lock();
        if state.best_tip == tip {
            return;
        }
        state.best_tip = tip;
        drop(state);
        debug!(%tip, "best tip changed, releasing long polls");
        self.tip_changed.notify_all();
    }

    /// Bumps the mempool counter. Deliberately does not wake anyone.
    pub fn mempool_updated(&self) -> u64 {
        let mut state = self.lock();
        state.mempool_version += 1;
        state.mempool_version
    }

    pub fn mempool_version(&self) -> u64 {
        self.lock().mempool_version
    }

    pub fn best_tip(&self) -> BlockHash {
        self.lock().best_tip
    }

    /// Token describing the world as it is right now.
    pub fn current_token(&self) -> LongPollToken {
        let state = self.lock();
        LongPollToken {
            tip: state.best_tip,
            mempool_version: state.mempool_version,
        }
    }

    pub fn shutdown(&self) {
        let state = self.lock();
        self.shutting_down.store(true, Ordering::SeqCst);
        drop(state);
        self.tip_changed.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Blocks until the best tip differs from `token.tip`, the mempool moved
    /// past `token.mempool_version` at a re-check, `max_wait` elapsed, or the
    /// coordinator shuts down.
    ///
    /// The first mempool re-check happens after the grace period and then
    /// every re-check interval.
    pub fn wait(&self, token: &LongPollToken, max_wait: Duration) -> WaitOutcome {
        let start = Instant::now();
        // None: too far out to represent, i.e. never
        let deadline = start.checked_add(max_wait);
        let mut next_check = start.checked_add(self.mempool_grace);

        let mut state = self.lock();
        let outcome = loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break WaitOutcome::ShuttingDown;
            }
            if state.best_tip != token.tip {
                break WaitOutcome::TipChanged(state.best_tip);
            }

            let now = Instant::now();
            if let Some(at) = next_check
                && now >= at
            {
                if state.mempool_version != token.mempool_version {
                    break WaitOutcome::MempoolChanged;
                }
                next_check = at.checked_add(self.recheck_interval);
                continue;
            }
            if deadline.is_some_and(|d| now >= d) {
                break WaitOutcome::TimedOut;
            }

            let wake_at = match (next_check, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let woken = match wake_at {
                Some(at) => self
                    .tip_changed
                    .wait_timeout(state, at - now)
                    .map(|(g, _)| g)
                    .map_err(|p| p.into_inner().0),
                None => self.tip_changed.wait(state).map_err(|p| p.into_inner()),
            };
            state = match woken {
                Ok(g) | Err(g) => g,
            };
        };
        drop(state);

        debug!(
            ?outcome,
            waited_ms = start.elapsed().as_millis() as u64,
            "long poll returned"
        );
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;
    use std::sync::Arc;
    use std::thread;

    fn coordinator(grace_ms: u64, recheck_ms: u64) -> Arc<LongPollCoordinator> {
        Arc::new(LongPollCoordinator::new(
            BlockHash::hash(b"a"),
            Duration::from_millis(grace_ms),
            Duration::from_millis(recheck_ms),
        ))
    }

    #[test]
    fn token_round_trips_through_text() {
        let token = LongPollToken {
            tip: BlockHash::hash(b"tip"),
            mempool_version: 42,
        };
        let text = token.to_string();
        assert_eq!(text.len(), 66);
        assert_eq!(text.parse::<LongPollToken>().unwrap(), token);
    }

    #[test]
    fn malformed_tokens_are_input_errors() {
        assert!(matches!(
            "abc".parse::<LongPollToken>(),
            Err(MiningError::InvalidInput(_))
        ));
        let bad_version = format!("{}x1", BlockHash::all_zeros());
        assert!(bad_version.parse::<LongPollToken>().is_err());
    }

    #[test]
    fn returns_immediately_when_tip_already_moved() {
        let c = coordinator(1_000, 1_000);
        let stale = LongPollToken {
            tip: BlockHash::hash(b"old"),
            mempool_version: 0,
        };
        let started = Instant::now();
        assert_eq!(
            c.wait(&stale, Duration::from_secs(5)),
            WaitOutcome::TipChanged(BlockHash::hash(b"a"))
        );
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn tip_change_releases_all_waiters() {
        let c = coordinator(10_000, 10_000);
        let token = c.current_token();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.wait(&token, Duration::from_secs(30)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let b = BlockHash::hash(b"b");
        c.tip_updated(b);

        for w in waiters {
            assert_eq!(w.join().unwrap(), WaitOutcome::TipChanged(b));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn mempool_change_is_seen_at_recheck() {
        let c = coordinator(40, 20);
        let token = c.current_token();
        c.mempool_updated();

        let started = Instant::now();
        assert_eq!(
            c.wait(&token, Duration::from_secs(5)),
            WaitOutcome::MempoolChanged
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn unchanged_mempool_waits_until_deadline() {
        let c = coordinator(10, 10);
        let token = c.current_token();
        let started = Instant::now();
        assert_eq!(
            c.wait(&token, Duration::from_millis(80)),
            WaitOutcome::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn mempool_update_does_not_wake_before_recheck() {
        let c = coordinator(300, 300);
        let token = c.current_token();
        let waiter = {
            let c = c.clone();
            thread::spawn(move || {
                let started = Instant::now();
                (c.wait(&token, Duration::from_secs(5)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        c.mempool_updated();

        let (outcome, waited) = waiter.join().unwrap();
        assert_eq!(outcome, WaitOutcome::MempoolChanged);
        assert!(waited >= Duration::from_millis(300));
    }

    #[test]
    fn unbounded_wait_still_answers_stale_token() {
        let c = coordinator(u64::MAX, u64::MAX);
        let stale = LongPollToken {
            tip: BlockHash::hash(b"old"),
            mempool_version: 0,
        };
        assert_eq!(
            c.wait(&stale, Duration::MAX),
            WaitOutcome::TipChanged(BlockHash::hash(b"a"))
        );
    }

    #[test]
    fn unbounded_wait_is_released_by_tip_change() {
        let c = coordinator(u64::MAX, u64::MAX);
        let token = c.current_token();
        let waiter = {
            let c = c.clone();
            thread::spawn(move || c.wait(&token, Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        let b = BlockHash::hash(b"b");
        c.tip_updated(b);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::TipChanged(b));
    }

    #[test]
    fn shutdown_releases_waiters() {
        let c = coordinator(10_000, 10_000);
        let token = c.current_token();
        let waiter = {
            let c = c.clone();
            thread::spawn(move || c.wait(&token, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        c.shutdown();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::ShuttingDown);
        assert!(c.is_shutting_down());
    }
}
