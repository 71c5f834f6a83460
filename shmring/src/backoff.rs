use std::cmp;
use std::hint;
use std::thread;
use std::time::Duration;

const SPIN_LIMIT: u32 = 6;
const DEFAULT_MAX_SLEEP: Duration = Duration::from_millis(10);

/// Retry pacing for callers that hit `Full` or an empty ring: a few rounds of
/// spinning, then sleeps doubling from 1µs up to `max_sleep`.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: u32,
    max_sleep: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_MAX_SLEEP)
    }
}

impl Backoff {
    pub fn new(max_sleep: Duration) -> Self {
        Backoff { step: 0, max_sleep }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// True once spinning is over and every further call sleeps.
    pub fn is_sleeping(&self) -> bool {
        self.step > SPIN_LIMIT
    }

    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::sleep(self.current_sleep());
        }
        self.step = self.step.saturating_add(1);
    }

    fn current_sleep(&self) -> Duration {
        let exp = cmp::min(self.step - SPIN_LIMIT - 1, 20);
        cmp::min(Duration::from_micros(1u64 << exp), self.max_sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spins_then_sleeps() {
        let mut backoff = Backoff::new(Duration::from_micros(50));
        for _ in 0..=SPIN_LIMIT {
            assert!(!backoff.is_sleeping());
            backoff.snooze();
        }
        assert!(backoff.is_sleeping());
        assert_eq!(backoff.current_sleep(), Duration::from_micros(1));
        for _ in 0..10 {
            backoff.snooze();
        }
        assert_eq!(backoff.current_sleep(), Duration::from_micros(50));
        backoff.reset();
        assert!(!backoff.is_sleeping());
    }
}
