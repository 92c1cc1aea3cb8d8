use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Jittered exponential backoff for reconnect attempts.
///
/// The first delay after a reset is zero. Each later delay is the current
/// base plus up to ±50% jitter, after which the base grows by the backoff
/// factor and is clamped between the initial and maximum delays.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0.0,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Used after a resource-exhausted error so the next attempt waits the maximum.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay.as_millis() as f64;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let jitter = RANDOM_FACTOR * self.current_base_millis * rng.gen_range(-1.0..=1.0);
        let delay = (self.current_base_millis + jitter).round().max(0.0);

        let initial = self.config.initial_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        self.current_base_millis = (self.current_base_millis * self.config.backoff_factor).clamp(initial, max.max(initial));

        Duration::from_millis(delay as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_delay_is_immediate() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }

    #[test]
    fn delays_stay_within_jitter_bounds() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        backoff.next_delay_with_rng(&mut rng);
        let mut base = 1_000.0_f64;
        for _ in 0..20 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as f64;
            assert!(delay >= (base * 0.5).floor(), "{delay} below {base}");
            assert!(delay <= (base * 1.5).ceil(), "{delay} above {base}");
            base = (base * 1.5).min(60_000.0);
        }
    }

    #[test]
    fn reset_to_max_jumps_to_ceiling() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(30_000));
        assert!(delay <= Duration::from_millis(90_000));
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
