use rand::Rng;
use std::time::Duration;

const JITTER_RATIO: f64 = 0.25;

/// Exponential reconnect delay: doubles from `base` up to `max`, with up to
/// 25% additive jitter clamped to `max`. Successive delays never shrink until
/// `reset` is called.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn nominal(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal();
        let spread = nominal.mul_f64(JITTER_RATIO).as_secs_f64();
        let jitter = if spread > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..spread))
        } else {
            Duration::ZERO
        };
        self.failures = self.failures.saturating_add(1);
        (nominal + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_monotonically_to_the_cap() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(10);
        for _ in 0..50 {
            let mut backoff = Backoff::new(base, max);
            let mut previous = Duration::ZERO;
            for _ in 0..20 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay >= base);
                assert!(delay <= max);
                previous = delay;
            }
            assert_eq!(previous, max);
        }
    }

    #[test]
    fn first_delay_stays_within_jitter_band() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(250));
        assert!(delay < Duration::from_millis(313));
        assert_eq!(backoff.failures(), 1);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
        for _ in 0..6 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() >= Duration::from_secs(10));

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(313));
    }
}
