//! Process-wide shared client handles
//!
//! Some client libraries keep process-global state that must be initialised
//! once and torn down only after the last user is gone. `ProcessShared` holds
//! such a handle behind a mutex together with its owner count.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

pub struct ProcessShared<T> {
    state: Mutex<SharedState<T>>,
}

struct SharedState<T> {
    value: Option<Arc<T>>,
    owners: usize,
}

impl<T> ProcessShared<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                value: None,
                owners: 0,
            }),
        }
    }

    /// Take a reference, running `init` if nobody holds one yet.
    ///
    /// A failed `init` leaves the handle uninitialised.
    pub fn acquire<E>(
        &'static self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<SharedLease<T>, E> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let value = match &state.value {
            Some(value) => Arc::clone(value),
            None => {
                let value = Arc::new(init()?);
                state.value = Some(Arc::clone(&value));
                value
            }
        };
        state.owners += 1;
        log::debug!("shared client acquired, {} owner(s)", state.owners);

        Ok(SharedLease {
            shared: self,
            value: Some(value),
        })
    }

    /// Current number of owners
    pub fn owners(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owners
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .is_some()
    }

}

impl<T> Default for ProcessShared<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One owner's reference; releases on drop
///
/// Teardown of the last reference runs with the mutex held, so a
/// concurrent `acquire` cannot initialise while the old handle is
/// still being destroyed.
pub struct SharedLease<T: 'static> {
    shared: &'static ProcessShared<T>,
    /// `None` only once `drop` has started
    value: Option<Arc<T>>,
}

impl<T> Deref for SharedLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("shared lease used after release"),
        }
    }
}

impl<T> Drop for SharedLease<T> {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let lease = self.value.take();
        state.owners = state.owners.saturating_sub(1);
        let last = if state.owners == 0 {
            log::debug!("last owner released shared client, tearing down");
            state.value.take()
        } else {
            None
        };
        drop(lease);
        drop(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Library {
        generation: usize,
    }

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static SHARED: ProcessShared<Library> = ProcessShared::new();

    fn init() -> Result<Library, String> {
        let generation = INITS.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Library { generation })
    }

    #[test]
    fn test_shared_lifecycle() {
        let first = SHARED.acquire(init).unwrap();
        let second = SHARED.acquire(init).unwrap();
        assert_eq!(SHARED.owners(), 2);
        assert_eq!(first.generation, second.generation);

        drop(first);
        assert!(SHARED.is_initialized());
        drop(second);
        assert_eq!(SHARED.owners(), 0);
        assert!(!SHARED.is_initialized());

        // a new acquire after teardown re-initialises
        let third = SHARED.acquire(init).unwrap();
        assert_eq!(third.generation, 2);
    }

    #[test]
    fn test_failed_init() {
        static FAILING: ProcessShared<Library> = ProcessShared::new();
        let result = FAILING.acquire(|| Err::<Library, _>("no library"));
        assert!(result.is_err());
        assert_eq!(FAILING.owners(), 0);
        assert!(!FAILING.is_initialized());
    }

    struct SlowTeardown;

    static TEARING_DOWN: AtomicBool = AtomicBool::new(false);
    static OVERLAPPED: AtomicBool = AtomicBool::new(false);

    impl Drop for SlowTeardown {
        fn drop(&mut self) {
            TEARING_DOWN.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            TEARING_DOWN.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_reinit_waits_for_teardown() {
        static SLOW: ProcessShared<SlowTeardown> = ProcessShared::new();
        let init = || {
            if TEARING_DOWN.load(Ordering::SeqCst) {
                OVERLAPPED.store(true, Ordering::SeqCst);
            }
            Ok::<_, String>(SlowTeardown)
        };

        let lease = SLOW.acquire(init).unwrap();
        let releaser = thread::spawn(move || drop(lease));
        thread::sleep(Duration::from_millis(50));
        let again = SLOW.acquire(init).unwrap();
        releaser.join().unwrap();

        assert!(!OVERLAPPED.load(Ordering::SeqCst));
        assert_eq!(SLOW.owners(), 1);
        drop(again);
    }
}
