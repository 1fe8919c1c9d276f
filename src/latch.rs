use std::sync::{Condvar, Mutex};

/// Countdown latch with a blocking wait-on-zero.
///
/// A step's `remaining` latch starts at its dependency count; every completed
/// dependency decrements it exactly once, success or failure.
pub struct Latch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement the counter, waking waiters when it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero; that means a child completed
    /// twice, which the executor forbids.
    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        assert!(*count > 0, "latch decremented below zero");
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Block the calling thread until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.zero.wait(count).unwrap();
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::Latch;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_latch_never_blocks() {
        let latch = Latch::new(0);
        latch.wait();
    }

    #[test]
    fn wait_returns_after_all_decrements() {
        let latch = Arc::new(Latch::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.count_down())
            })
            .collect();

        latch.wait();
        assert_eq!(latch.remaining(), 0);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn underflow_is_a_bug() {
        let latch = Latch::new(1);
        latch.count_down();
        latch.count_down();
    }
}
