//! Bounded, TTL-based cache of idle v2 sessions.
//!
//! The pool is the only structure shared across sessions. Borrowed
//! entries are wrapped in a [`Lease`]: dropping the lease returns the
//! session unless [`Lease::mark_unusable`] was called, in which case the
//! session is closed instead. Entries past their lease deadline are
//! discarded on the way out; when the pool is full the oldest idle entry
//! is evicted to make room.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default capacity of idle sessions.
pub const DEFAULT_CAPACITY: usize = 10;

/// Default idle lease duration.
pub const DEFAULT_LEASE: Duration = Duration::from_millis(150_000);

struct Entry<T> {
    value: T,
    deadline: Instant,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    lease: Duration,
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    closed: bool,
}

impl<T> Shared<T> {
    fn put(&self, value: T) {
        let mut state = self.state.lock();
        // Returns after close are no-ops; the session just closes.
        if state.closed {
            return;
        }
        if state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(Entry {
            value,
            deadline: Instant::now() + self.lease,
        });
    }
}

/// A bounded store of idle values with per-entry expiry.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Pool<T> {
    /// Create a pool holding at most `capacity` idle entries, each valid
    /// for `lease` after its return.
    pub fn new(capacity: usize, lease: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: VecDeque::new(),
                    closed: false,
                }),
                capacity,
                lease,
            }),
        }
    }

    /// Borrow an idle entry whose deadline has not passed, discarding any
    /// expired ones encountered.
    pub fn get(&self) -> Option<Lease<T>> {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        while let Some(entry) = state.entries.pop_front() {
            if entry.deadline > now {
                drop(state);
                return Some(self.lease(entry.value));
            }
            // expired; drop it
        }
        None
    }

    /// Wrap a freshly created value in a lease tied to this pool.
    pub fn lease(&self, value: T) -> Lease<T> {
        Lease {
            value: Some(value),
            shared: Arc::clone(&self.shared),
            unusable: false,
        }
    }

    /// Drop all idle entries and turn future returns into no-ops.
    ///
    /// In-flight leases are not cancelled.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.entries.clear();
    }

    /// Number of idle entries currently held.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().entries.len()
    }
}

/// A borrowed pool entry; dropping it returns the value to the pool
/// unless it was marked unusable.
pub struct Lease<T> {
    value: Option<T>,
    shared: Arc<Shared<T>>,
    unusable: bool,
}

impl<T> Lease<T> {
    /// Force the entry to be closed instead of returned.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    /// Access the borrowed value.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("lease not yet released")
    }
}

impl<T> std::ops::Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease not yet released")
    }
}

impl<T> std::ops::DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.get_mut()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if !self.unusable {
                self.shared.put(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_returns_on_drop() {
        let pool: Pool<u32> = Pool::new(4, Duration::from_secs(60));
        {
            let _lease = pool.lease(7);
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(*pool.get().unwrap(), 7);
    }

    #[test]
    fn test_unusable_entries_are_discarded() {
        let pool: Pool<u32> = Pool::new(4, Duration::from_secs(60));
        {
            let mut lease = pool.lease(7);
            lease.mark_unusable();
        }
        assert_eq!(pool.idle(), 0);
        assert!(pool.get().is_none());
    }

    #[test]
    fn test_capacity_evicts_the_oldest() {
        let pool: Pool<u32> = Pool::new(2, Duration::from_secs(60));
        for v in 0..3 {
            drop(pool.lease(v));
        }
        assert_eq!(pool.idle(), 2);
        assert_eq!(*pool.get().unwrap(), 1);
        assert_eq!(*pool.get().unwrap(), 2);
    }

    #[test]
    fn test_expired_entries_are_not_reused() {
        let pool: Pool<u32> = Pool::new(4, Duration::from_millis(0));
        drop(pool.lease(7));
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.get().is_none());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_close_discards_idle_and_ignores_returns() {
        let pool: Pool<u32> = Pool::new(4, Duration::from_secs(60));
        drop(pool.lease(1));
        let outstanding = pool.lease(2);
        pool.close();
        assert_eq!(pool.idle(), 0);
        drop(outstanding);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_concurrent_borrow_and_return() {
        let pool: Pool<u32> = Pool::new(DEFAULT_CAPACITY, Duration::from_secs(60));
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    match pool.get() {
                        Some(lease) => drop(lease),
                        None => drop(pool.lease(i)),
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= DEFAULT_CAPACITY);
    }
}
