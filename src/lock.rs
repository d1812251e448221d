//! # Four-Level Transaction Lock
//!
//! Advisory lock coordinating one writer with many readers, modeled after the
//! classic shared/reserved/pending/exclusive protocol:
//!
//! - **Shared**: any number of readers; new acquisitions are blocked only
//!   while Pending is held.
//! - **Reserved**: at most one writer intends to modify; never blocks
//!   readers.
//! - **Pending**: announces "no new shared locks" while the writer prepares
//!   the swap; existing shared holders are unaffected.
//! - **Exclusive**: requires Pending held and zero outstanding shared locks;
//!   only then may the writer flip the active meta page.
//!
//! The whole thing is one explicit state machine behind a single mutex with
//! per-level condvars, not nested mutexes. Every level has a non-blocking
//! `check_*` predicate so tests can assert acquirability without blocking.
//!
//! Writer progress is guaranteed: once Pending is set no new readers get in,
//! so the shared count can only fall. Deadlock between writers is impossible
//! because Reserved serializes them long before Pending.

use eyre::{ensure, Result};
use parking_lot::{Condvar, Mutex};

use crate::error::StorageError;

#[derive(Debug, Default)]
struct LockState {
    shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

/// The file-wide transaction lock.
#[derive(Debug, Default)]
pub struct TxLock {
    state: Mutex<LockState>,
    /// Signaled when the shared count drops to zero.
    shared_drained: Condvar,
    /// Signaled when Pending clears, releasing blocked shared acquirers.
    pending_cleared: Condvar,
    /// Signaled when Reserved clears, releasing the next writer.
    reserved_cleared: Condvar,
}

impl TxLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while Pending is held, then registers a shared holder.
    pub fn lock_shared(&self) {
        let mut state = self.state.lock();
        while state.pending || state.exclusive {
            self.pending_cleared.wait(&mut state);
        }
        state.shared += 1;
    }

    pub fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0, "unlock_shared without a holder");
        state.shared -= 1;
        if state.shared == 0 {
            self.shared_drained.notify_all();
        }
    }

    /// True if a shared lock could be acquired right now.
    pub fn check_shared(&self) -> bool {
        let state = self.state.lock();
        !state.pending && !state.exclusive
    }

    /// Blocks until no other writer holds Reserved.
    pub fn lock_reserved(&self) {
        let mut state = self.state.lock();
        while state.reserved {
            self.reserved_cleared.wait(&mut state);
        }
        state.reserved = true;
    }

    pub fn unlock_reserved(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reserved, "unlock_reserved without holding it");
        state.reserved = false;
        self.reserved_cleared.notify_one();
    }

    pub fn check_reserved(&self) -> bool {
        !self.state.lock().reserved
    }

    /// Sets Pending. The caller must hold Reserved.
    pub fn lock_pending(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reserved, "pending requires reserved");
        debug_assert!(!state.pending, "pending already held");
        state.pending = true;
    }

    pub fn unlock_pending(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending, "unlock_pending without holding it");
        state.pending = false;
        self.pending_cleared.notify_all();
    }

    pub fn check_pending(&self) -> bool {
        let state = self.state.lock();
        state.reserved && !state.pending
    }

    /// Waits for all existing shared holders to release, then takes the
    /// exclusive lock. The caller must hold Pending, which guarantees the
    /// shared count only falls while we wait.
    pub fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending, "exclusive requires pending");
        while state.shared > 0 {
            self.shared_drained.wait(&mut state);
        }
        state.exclusive = true;
    }

    /// Non-blocking exclusive acquisition. `LockUnavailable` means shared
    /// holders remain and the caller may retry or abort.
    pub fn try_lock_exclusive(&self) -> Result<()> {
        let mut state = self.state.lock();
        debug_assert!(state.pending, "exclusive requires pending");
        ensure!(state.shared == 0, StorageError::LockUnavailable);
        state.exclusive = true;
        Ok(())
    }

    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "unlock_exclusive without holding it");
        state.exclusive = false;
        self.pending_cleared.notify_all();
    }

    /// True if the exclusive lock could be acquired right now: Pending held
    /// and no shared holders left.
    pub fn check_exclusive(&self) -> bool {
        let state = self.state.lock();
        state.pending && !state.exclusive && state.shared == 0
    }

    /// Invariant checker usable directly in tests, never blocks.
    pub fn check(&self) -> bool {
        let state = self.state.lock();
        let pending_implies_reserved = !state.pending || state.reserved;
        let exclusive_implies_pending = !state.exclusive || state.pending;
        let exclusive_excludes_shared = !state.exclusive || state.shared == 0;
        pending_implies_reserved && exclusive_implies_pending && exclusive_excludes_shared
    }

    #[cfg(test)]
    fn shared_count(&self) -> u32 {
        self.state.lock().shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn multiple_shared_locks() {
        let lock = TxLock::new();
        lock.lock_shared();
        lock.lock_shared();

        assert!(lock.check_shared());
        assert_eq!(lock.shared_count(), 2);

        lock.unlock_shared();
        lock.unlock_shared();
        assert!(lock.check());
    }

    #[test]
    fn shared_allowed_while_reserved_held() {
        let lock = TxLock::new();
        lock.lock_reserved();

        assert!(lock.check_shared());
        lock.lock_shared();
        lock.unlock_shared();
        lock.unlock_reserved();
    }

    #[test]
    fn shared_blocked_while_pending_held() {
        let lock = TxLock::new();
        lock.lock_reserved();
        lock.lock_pending();

        assert!(!lock.check_shared());

        lock.unlock_pending();
        lock.unlock_reserved();
    }

    #[test]
    fn shared_allowed_again_after_pending_release() {
        let lock = TxLock::new();
        lock.lock_reserved();
        lock.lock_pending();
        lock.unlock_pending();

        assert!(lock.check_shared());
        lock.unlock_reserved();
    }

    #[test]
    fn reserved_can_be_retaken_after_release() {
        let lock = TxLock::new();
        lock.lock_reserved();
        lock.unlock_reserved();

        // would deadlock the test if the release were lost
        lock.lock_reserved();
        lock.unlock_reserved();
    }

    #[test]
    fn exclusive_requires_no_shared_holders() {
        let lock = TxLock::new();
        lock.lock_reserved();
        lock.lock_pending();

        assert!(lock.check_exclusive());

        lock.unlock_pending();
        lock.unlock_reserved();
    }

    #[test]
    fn exclusive_blocked_while_shared_held() {
        let lock = TxLock::new();
        lock.lock_shared();
        lock.lock_reserved();
        lock.lock_pending();

        assert!(!lock.check_exclusive());
        let err = lock.try_lock_exclusive().unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::LockUnavailable)
        );

        lock.unlock_shared();
        lock.unlock_pending();
        lock.unlock_reserved();
    }

    #[test]
    fn exclusive_acquirable_after_last_shared_release() {
        let lock = TxLock::new();
        lock.lock_shared();
        lock.lock_reserved();
        lock.lock_pending();

        lock.unlock_shared();
        assert!(lock.check_exclusive());
        lock.try_lock_exclusive().unwrap();
        assert!(lock.check());

        lock.unlock_exclusive();
        lock.unlock_pending();
        lock.unlock_reserved();
    }

    #[test]
    fn pending_starves_out_new_readers_until_writer_finishes() {
        let lock = Arc::new(TxLock::new());
        lock.lock_shared();
        lock.lock_reserved();
        lock.lock_pending();

        let blocked = Arc::clone(&lock);
        let reader = std::thread::spawn(move || {
            blocked.lock_shared();
            blocked.unlock_shared();
        });

        // the existing reader leaves; the writer gets its swap window
        lock.unlock_shared();
        lock.lock_exclusive();
        assert_eq!(lock.shared_count(), 0);
        lock.unlock_exclusive();
        lock.unlock_pending();
        lock.unlock_reserved();

        reader.join().unwrap();
        assert!(lock.check());
    }

    #[test]
    fn exclusive_wait_wakes_on_shared_drain() {
        let lock = Arc::new(TxLock::new());
        lock.lock_shared();
        lock.lock_reserved();
        lock.lock_pending();

        let writer_lock = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            writer_lock.lock_exclusive();
            writer_lock.unlock_exclusive();
            writer_lock.unlock_pending();
            writer_lock.unlock_reserved();
        });

        std::thread::sleep(Duration::from_millis(20));
        lock.unlock_shared();

        writer.join().unwrap();
        assert!(lock.check());
    }
}
