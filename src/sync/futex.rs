//! Cross-process futex waits on words living in shared memory.

use crate::error::Result;
use rustix::io::Errno;
use rustix::thread::futex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Block while `word` still holds `expected`.
///
/// Returns `Ok(true)` once the value differs, `Ok(false)` if `deadline`
/// passed first. `None` waits indefinitely. Shared (non-private) futexes are
/// used so the wake can come from the peer process.
pub(crate) fn wait_while(word: &AtomicU32, expected: u32, deadline: Option<Instant>) -> Result<bool> {
    loop {
        if word.load(Ordering::Acquire) != expected {
            return Ok(true);
        }

        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                Some(to_timespec(deadline - now))
            }
            None => None,
        };

        match futex::wait(word, futex::Flags::empty(), expected, timeout.as_ref()) {
            Ok(()) | Err(Errno::AGAIN) | Err(Errno::INTR) | Err(Errno::TIMEDOUT) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wake every waiter blocked on `word`.
pub(crate) fn wake_all(word: &AtomicU32) {
    // Waking has no failure mode we could act on.
    let _ = futex::wake(word, futex::Flags::empty(), i32::MAX as u32);
}

/// Convert an optional relative timeout into an absolute deadline.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

fn to_timespec(d: Duration) -> futex::Timespec {
    futex::Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(3);
        assert!(wait_while(&word, 1, None).unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(1);
        let start = Instant::now();
        let changed = wait_while(&word, 1, deadline_after(Some(Duration::from_millis(20)))).unwrap();
        assert!(!changed);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wake_from_other_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let waker = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                word.store(1, Ordering::Release);
                wake_all(&word);
            })
        };

        let changed = wait_while(&word, 0, deadline_after(Some(Duration::from_secs(5)))).unwrap();
        assert!(changed);
        waker.join().unwrap();
    }
}
