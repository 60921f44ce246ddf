use core::fmt;
use std::{
    collections::HashMap,
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::warn;

use crate::{
    error::{DomError, ErrorKind},
    types::DomResult,
};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockInner {
    // exclusive holder with its re-entrance count
    exclusive: Option<(u64, u32)>,

    // shared holders, owner -> re-entrance count
    shared: HashMap<u64, u32>,
}

impl LockInner {
    // Try to add one acquisition for the given owner. This api is
    // non-blocking; the caller retries until its budget runs out.
    fn try_acquire(&mut self, owner: u64, mode: LockMode) -> bool {
        if let Some((holder, _)) = self.exclusive {
            if holder != owner {
                return false;
            }
        }

        match mode {
            LockMode::Exclusive => {
                // readers other than the requester keep the writer out
                if self.shared.keys().any(|o| *o != owner) {
                    return false;
                }

                match &mut self.exclusive {
                    Some((_, count)) => *count += 1,
                    None => self.exclusive = Some((owner, 1)),
                }
            }
            LockMode::Shared => {
                *self.shared.entry(owner).or_insert(0) += 1;
            }
        }

        true
    }

    fn release(&mut self, owner: u64, mode: LockMode) {
        match mode {
            LockMode::Exclusive => match &mut self.exclusive {
                Some((holder, count)) if *holder == owner => {
                    *count -= 1;
                    if *count == 0 {
                        self.exclusive = None;
                    }
                }
                _ => warn!("release of exclusive lock not held, owner: {}", owner),
            },
            LockMode::Shared => match self.shared.get_mut(&owner) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&owner);
                    }
                }
                None => warn!("release of shared lock not held, owner: {}", owner),
            },
        }
    }
}

/// One lock per DOM file, owner-aware. Re-entrance by the same owner does
/// not deadlock; an owner holding the only shared acquisition may upgrade.
/// Acquisition blocks up to the configured timeout, then fails with
/// `LockTimeout`.
pub struct TimeoutLock {
    inner: Mutex<LockInner>,
    timeout: Duration,
}

/// Proof of one acquisition; releasing happens on drop, so an iterator (or
/// any error path) can never leak a hold.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a TimeoutLock,
    owner: u64,
    mode: LockMode,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.owner, self.mode);
    }
}

impl TimeoutLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(LockInner::default()),
            timeout,
        }
    }

    /// Acquire a single hold for `owner`, blocking up to the timeout.
    pub fn acquire(&self, owner: u64, mode: LockMode) -> DomResult<LockGuard<'_>> {
        let start_time = Instant::now();
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.try_acquire(owner, mode) {
                    return Ok(LockGuard {
                        lock: self,
                        owner,
                        mode,
                    });
                }
            }
            // release the mutex before sleeping

            if start_time.elapsed() >= self.timeout {
                let err = DomError::new(
                    ErrorKind::LockTimeout,
                    &format!(
                        "acquire lock timeout after {:?}, owner: {}, mode: {:?}",
                        self.timeout, owner, mode
                    ),
                );
                err.show_backtrace();
                return Err(err);
            }

            sleep(RETRY_INTERVAL);
        }
    }

    fn release(&self, owner: u64, mode: LockMode) {
        self.inner.lock().unwrap().release(owner, mode);
    }
}

impl fmt::Debug for TimeoutLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(
            f,
            "TimeoutLock {{ exclusive: {:?}, shared: {:?} }}",
            inner.exclusive, inner.shared
        )
    }
}
