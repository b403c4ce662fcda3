//! Lock manager: named, exclusive, reentrant locks with an optional
//! global lock, a waits-for graph deadlock detector, and the
//! release-and-rerun primitives used around callbacks (`spec.md` §4.9).
//!
//! Ownership is keyed by [`LogicalThreadId`], never by OS thread or async
//! task, so that N client threads multiplexed over a worker pool share
//! lock ownership correctly (`spec.md` §9 design notes).

use std::{
    collections::{HashMap, HashSet},
    sync::{Condvar, Mutex},
};

use crate::{error::LockError, ids::LogicalThreadId};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<LogicalThreadId>,
    depth: u32,
}

#[derive(Debug, Default)]
struct ManagerState {
    locks: HashMap<String, LockState>,
    /// Who each logical thread is currently blocked waiting on, by lock
    /// name. Used to walk the waits-for graph before blocking.
    waits_for: HashMap<LogicalThreadId, String>,
}

impl ManagerState {
    /// Name of the distinguished global lock.
    const GLOBAL: &'static str = "\u{0}global";

    fn would_deadlock(&self, requester: LogicalThreadId, target_lock: &str) -> bool {
        let Some(lock) = self.locks.get(target_lock) else {
            return false;
        };
        let Some(mut holder) = lock.owner else {
            return false;
        };
        let mut seen: HashSet<LogicalThreadId> = HashSet::new();
        loop {
            if holder == requester {
                return true;
            }
            if !seen.insert(holder) {
                return false;
            }
            let Some(waiting_on) = self.waits_for.get(&holder) else {
                return false;
            };
            let Some(next_lock) = self.locks.get(waiting_on) else {
                return false;
            };
            let Some(next_holder) = next_lock.owner else {
                return false;
            };
            holder = next_holder;
        }
    }
}

/// Reentrant named lock manager, one per connection-family group that
/// shares the global lock (`spec.md` §4.9, §5).
pub struct LockManager {
    state: Mutex<ManagerState>,
    released: Condvar,
    global_lock_enabled: bool,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("global_lock_enabled", &self.global_lock_enabled)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Construct a lock manager. `global_lock_enabled` controls whether
    /// [`LockManager::acquire_global`] is meaningful for this manager; when
    /// `false` it always succeeds immediately without serialising anything.
    #[must_use]
    pub fn new(global_lock_enabled: bool) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            released: Condvar::new(),
            global_lock_enabled,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Acquire the named lock `name` on behalf of `thread`, reentrantly if
    /// `thread` already holds it. Blocks the calling OS thread while the
    /// lock is held elsewhere (`spec.md` §5 names the named lock as a
    /// suspension point for a worker); callers running on an async task
    /// must offload this call rather than invoke it inline.
    ///
    /// # Errors
    /// Returns [`LockError::Deadlock`] if granting this acquisition would
    /// close a cycle in the waits-for graph. Detection happens before the
    /// caller blocks, so a deadlocked acquirer never parks.
    pub fn acquire(&self, thread: LogicalThreadId, name: &str) -> Result<(), LockError> {
        let mut state = self.lock();
        loop {
            let entry = state.locks.entry(name.to_owned()).or_default();
            if entry.owner == Some(thread) {
                entry.depth += 1;
                state.waits_for.remove(&thread);
                return Ok(());
            }
            if entry.owner.is_none() {
                entry.owner = Some(thread);
                entry.depth = 1;
                state.waits_for.remove(&thread);
                return Ok(());
            }
            if state.would_deadlock(thread, name) {
                return Err(LockError::Deadlock(name.to_owned()));
            }
            state.waits_for.insert(thread, name.to_owned());
            state = self
                .released
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Release one level of `name` held by `thread`.
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `thread` does not currently hold
    /// `name`.
    pub fn release(&self, thread: LogicalThreadId, name: &str) -> Result<(), LockError> {
        let mut state = self.lock();
        let Some(entry) = state.locks.get_mut(name) else {
            return Err(LockError::NotHeld(name.to_owned()));
        };
        if entry.owner != Some(thread) {
            return Err(LockError::NotHeld(name.to_owned()));
        }
        entry.depth -= 1;
        if entry.depth == 0 {
            entry.owner = None;
        }
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    /// Acquire the distinguished global lock. No-op (always succeeds) when
    /// this manager was constructed with `global_lock_enabled = false`.
    ///
    /// # Errors
    /// Returns [`LockError::Deadlock`] under the same conditions as
    /// [`LockManager::acquire`].
    pub fn acquire_global(&self, thread: LogicalThreadId) -> Result<(), LockError> {
        if !self.global_lock_enabled {
            return Ok(());
        }
        self.acquire(thread, ManagerState::GLOBAL)
    }

    /// Release one level of the distinguished global lock.
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] under the same conditions as
    /// [`LockManager::release`].
    pub fn release_global(&self, thread: LogicalThreadId) -> Result<(), LockError> {
        if !self.global_lock_enabled {
            return Ok(());
        }
        self.release(thread, ManagerState::GLOBAL)
    }

    /// Current reentrant depth `thread` holds on the global lock, or 0.
    #[must_use]
    pub fn global_depth(&self, thread: LogicalThreadId) -> u32 {
        let state = self.lock();
        state
            .locks
            .get(ManagerState::GLOBAL)
            .filter(|entry| entry.owner == Some(thread))
            .map_or(0, |entry| entry.depth)
    }

    /// Run `action` after fully releasing `thread`'s hold on the global
    /// lock, then reacquire the same reentrant depth before returning
    /// (`spec.md` §4.9 "run-and-rethrow without global lock").
    ///
    /// # Errors
    /// Propagates `action`'s error, or a [`LockError::Deadlock`] if
    /// reacquiring the prior depth would deadlock.
    pub fn run_without_global_lock<T, E>(
        &self,
        thread: LogicalThreadId,
        action: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, RerunError<E>> {
        let depth = self.global_depth(thread);
        for _ in 0..depth {
            self.release_global(thread).map_err(RerunError::Lock)?;
        }
        let result = action();
        for _ in 0..depth {
            self.acquire_global(thread).map_err(RerunError::Lock)?;
        }
        result.map_err(RerunError::Action)
    }
}

/// Error from [`LockManager::run_without_global_lock`]: either the action
/// itself failed, or reacquiring the lock afterwards deadlocked.
#[derive(Debug)]
pub enum RerunError<E> {
    /// The wrapped action returned an error.
    Action(E),
    /// Releasing or reacquiring the global lock failed.
    Lock(LockError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(connection: u64, client_thread: u64) -> LogicalThreadId {
        LogicalThreadId::new(connection, crate::ids::ClientThreadId(client_thread))
    }

    #[test]
    fn reentrant_lock_unlock_by_same_thread_succeeds() {
        let manager = LockManager::new(false);
        let t = thread(1, 1);
        manager.acquire(t, "A").expect("first acquire");
        manager.acquire(t, "A").expect("reentrant acquire");
        manager.release(t, "A").expect("first release");
        manager.release(t, "A").expect("second release");
    }

    #[test]
    fn second_thread_blocks_until_the_first_releases() {
        use std::sync::Arc;

        let manager = Arc::new(LockManager::new(false));
        let t1 = thread(1, 1);
        let t2 = thread(1, 2);
        manager.acquire(t1, "A").expect("t1 acquires A");

        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.acquire(t2, "A"))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        manager.release(t1, "A").expect("t1 releases A");
        waiter.join().expect("waiter thread did not panic").expect("t2 now acquires A");
    }

    #[test]
    fn opposite_order_acquisition_is_detected_as_deadlock() {
        use std::sync::Arc;

        let manager = Arc::new(LockManager::new(false));
        let t1 = thread(1, 1);
        let t2 = thread(1, 2);
        manager.acquire(t1, "A").expect("t1 acquires A");
        manager.acquire(t2, "B").expect("t2 acquires B");

        // t1 now blocks waiting for B (held by t2).
        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.acquire(t1, "B"))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));

        // t2 now tries for A (held by t1): this closes the cycle, so t2
        // fails immediately without blocking.
        let err_t2 = manager.acquire(t2, "A").unwrap_err();
        assert!(matches!(err_t2, LockError::Deadlock(_)));

        // t2 proceeds to unlock its locks; t1's wait for B can now succeed.
        manager.release(t2, "B").expect("t2 releases B");
        waiter.join().expect("waiter thread did not panic").expect("t1 now acquires B");
    }

    #[test]
    fn unlock_by_non_owner_is_not_held_error() {
        let manager = LockManager::new(false);
        let t1 = thread(1, 1);
        let t2 = thread(1, 2);
        manager.acquire(t1, "A").expect("t1 acquires A");
        let err = manager.release(t2, "A").unwrap_err();
        assert!(matches!(err, LockError::NotHeld(_)));
    }

    #[test]
    fn global_lock_disabled_always_succeeds() {
        let manager = LockManager::new(false);
        let t = thread(1, 1);
        manager.acquire_global(t).expect("disabled global lock is a no-op");
        assert_eq!(manager.global_depth(t), 0);
    }

    #[test]
    fn run_without_global_lock_restores_depth() {
        let manager = LockManager::new(true);
        let t = thread(1, 1);
        manager.acquire_global(t).expect("first acquire");
        manager.acquire_global(t).expect("second acquire");
        assert_eq!(manager.global_depth(t), 2);

        let result: Result<i32, RerunError<()>> =
            manager.run_without_global_lock(t, || Ok::<i32, ()>(42));
        assert_eq!(result.expect("action succeeds"), 42);
        assert_eq!(manager.global_depth(t), 2);
    }
}
