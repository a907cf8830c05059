//! Blocking wait/wake on 32-bit shared cells.
//!
//! On Linux this is the futex syscall with `FUTEX_PRIVATE_FLAG` (all waiters
//! live in this process). Elsewhere a process-global parking table keyed by
//! cell address provides the same observable contract.

use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

/// Result of a wait, mirroring the async wait resolution values
/// `'ok' | 'not-equal' | 'timed-out'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a notify (or a spurious wakeup).
    Ok,
    /// The cell did not hold the expected value.
    NotEqual,
    /// The timeout elapsed first.
    TimedOut,
}

/// Wall-clock budget for a wait choreography. Retry loops thread one budget
/// through every step so the residual timeout shrinks by elapsed time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Budget {
    deadline: Option<Instant>,
}

impl Budget {
    /// `None` means wait forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Residual timeout; `None` when unbounded, zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.deadline
            .is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn futex_wait(cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let budget = Budget::new(timeout);
    loop {
        if budget.expired() {
            return WaitOutcome::TimedOut;
        }
        let ts = budget.remaining().map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                cell.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
            )
        };
        if rc == 0 {
            return WaitOutcome::Ok;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => return WaitOutcome::NotEqual,
            Some(libc::ETIMEDOUT) => return WaitOutcome::TimedOut,
            // Interrupted: re-wait under the residual budget
            Some(libc::EINTR) => continue,
            _ => return WaitOutcome::Ok,
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn futex_wake(cell: &AtomicU32, count: u32) -> usize {
    let n = count.min(i32::MAX as u32) as libc::c_int;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            cell.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
        )
    };
    if rc < 0 { 0 } else { rc as usize }
}

#[cfg(not(target_os = "linux"))]
pub(crate) use fallback::{futex_wait, futex_wake};

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use once_cell::sync::Lazy;

    use super::{Budget, WaitOutcome};

    struct Spot {
        /// Wake generation; bumped under the lock before notifying.
        generation: Mutex<u64>,
        cv: Condvar,
    }

    static PARKING: Lazy<Mutex<HashMap<usize, Arc<Spot>>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));

    fn spot_for(addr: usize) -> Arc<Spot> {
        let mut table = PARKING.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(addr)
            .or_insert_with(|| {
                Arc::new(Spot {
                    generation: Mutex::new(0),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    pub(crate) fn futex_wait(
        cell: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let spot = spot_for(cell.as_ptr() as usize);
        let budget = Budget::new(timeout);
        let mut generation = spot.generation.lock().unwrap_or_else(|e| e.into_inner());
        // Wakers bump the generation under this same lock before notifying,
        // so a wake between this check and the wait below cannot be missed.
        if cell.load(Ordering::SeqCst) != expected {
            return WaitOutcome::NotEqual;
        }
        let start = *generation;
        loop {
            if *generation != start {
                return WaitOutcome::Ok;
            }
            match budget.remaining() {
                None => {
                    generation = spot
                        .cv
                        .wait(generation)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(d) if d.is_zero() => return WaitOutcome::TimedOut,
                Some(d) => {
                    let (guard, timed) = spot
                        .cv
                        .wait_timeout(generation, d)
                        .unwrap_or_else(|e| e.into_inner());
                    generation = guard;
                    if timed.timed_out() && *generation == start {
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }

    pub(crate) fn futex_wake(cell: &AtomicU32, count: u32) -> usize {
        let spot = spot_for(cell.as_ptr() as usize);
        let mut generation = spot.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        if count <= 1 {
            spot.cv.notify_one();
        } else {
            spot.cv.notify_all();
        }
        0
    }
}
