//! Randomized exponential backoff delays.

use std::time::Duration;

use rand::Rng;

/// Generates successive intervals for random exponential backoff. A high
/// water mark doubles on each draw up to `max_delay`; draws are uniform
/// below the mark, except the first draw after a reset, which returns the
/// initial delay itself.
pub struct ExponentialBackoffDelayGenerator<R: Rng> {
    max_delay: Duration,
    initial_max_delay: Duration,
    current_max_delay: Duration,
    in_retry_mode: bool,
    rng: R,
}

impl<R: Rng> ExponentialBackoffDelayGenerator<R> {
    pub fn new(rng: R, max_delay: Duration, initial_max_delay: Duration) -> Self {
        assert!(max_delay > Duration::ZERO, "max delay must be positive");
        assert!(
            initial_max_delay > Duration::ZERO,
            "initial delay must be positive"
        );
        assert!(
            initial_max_delay <= max_delay,
            "initial delay cannot exceed max delay"
        );
        let mut generator = Self {
            max_delay,
            initial_max_delay,
            current_max_delay: initial_max_delay,
            in_retry_mode: false,
            rng,
        };
        generator.reset();
        generator
    }

    /// Starts delays over from the initial delay.
    pub fn reset(&mut self) {
        self.current_max_delay = self.initial_max_delay;
        self.in_retry_mode = false;
    }

    /// The next delay interval to use.
    pub fn next_delay(&mut self) -> Duration {
        if !self.in_retry_mode {
            self.in_retry_mode = true;
            return self.initial_max_delay;
        }
        let max_ms = (self.current_max_delay.as_millis() as u64).max(1);
        let delay = Duration::from_millis(self.rng.gen_range(0..max_ms));
        self.current_max_delay = (self.current_max_delay * 2).min(self.max_delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn generator(max_ms: u64, initial_ms: u64) -> ExponentialBackoffDelayGenerator<StdRng> {
        ExponentialBackoffDelayGenerator::new(
            StdRng::seed_from_u64(42),
            Duration::from_millis(max_ms),
            Duration::from_millis(initial_ms),
        )
    }

    #[test]
    fn first_delay_is_the_initial_delay() {
        let mut generator = generator(8_000, 100);
        assert_eq!(generator.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn delays_stay_below_the_doubling_mark() {
        let mut generator = generator(8_000, 100);
        generator.next_delay();
        let mut mark = Duration::from_millis(100);
        for _ in 0..10 {
            let delay = generator.next_delay();
            assert!(delay < mark.max(Duration::from_millis(1)), "{delay:?} vs {mark:?}");
            mark = (mark * 2).min(Duration::from_millis(8_000));
        }
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut generator = generator(8_000, 100);
        for _ in 0..5 {
            generator.next_delay();
        }
        generator.reset();
        assert_eq!(generator.next_delay(), Duration::from_millis(100));
    }

    #[test]
    #[should_panic(expected = "initial delay cannot exceed max delay")]
    fn initial_delay_above_max_panics() {
        generator(100, 8_000);
    }
}
