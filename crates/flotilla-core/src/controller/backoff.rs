//! Exponential backoff with full jitter for failed reconciles.

use std::time::Duration;

use rand::Rng as _;

/// Per-key failure backoff. Delay doubles per consecutive failure from
/// `base` up to `cap`, then a random factor in `[0.5, 1.0]` spreads retries
/// out.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

/// The queue default: 5ms initial, capped at 1000s.
pub const DEFAULT_BACKOFF: Backoff = Backoff {
    base: Duration::from_millis(5),
    cap: Duration::from_secs(1000),
};

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let uncapped = self
            .base
            .saturating_mul(2_u32.saturating_pow(exponent));
        let capped = uncapped.min(self.cap);
        let jitter = rand::rng().random_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(5),
            cap: Duration::from_secs(1000),
        };

        assert!(backoff.delay(1) <= Duration::from_millis(5));
        assert!(backoff.delay(1) >= Duration::from_micros(2500));

        // 2^40 * 5ms far exceeds the cap.
        let late = backoff.delay(41);
        assert!(late <= Duration::from_secs(1000));
        assert!(late >= Duration::from_secs(500));
    }
}
