//! Counting semaphore built on Mutex + Condvar
//!
//! Used to park the ring consumer threads and the INS workers. Posts are
//! counted, so an event-channel callback that fires while the consumer is
//! mid-drain is not lost; a wait after that consumes the count immediately.
//! Spurious wakeups are absorbed by the count check.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        drop(count);
        self.condvar.notify_one();
    }

    /// Wake every waiter without consuming a count each. Used on teardown
    /// so parked consumers notice a shutdown flag.
    pub fn post_all(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        drop(count);
        self.condvar.notify_all();
    }

    /// Block until the count is non-zero, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Like `wait`, but gives up after `timeout`. Returns true if a count
    /// was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.condvar.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Consume a count if one is available, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait(); // must not block
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_initial_count() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cross_thread_wake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || {
            sem2.wait();
        });
        std::thread::sleep(Duration::from_millis(10));
        sem.post();
        handle.join().unwrap();
    }

    #[test]
    fn test_posts_are_counted() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }
}
