//! Uniform jittered pacing shared by the ARP and DNS senders (spec.md §4.2).

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use eavesarp_core::config::RateGateConfig;

/// Sleeps for a random duration in `[min, max]` before every operation,
/// with a secondary +/- jitter of up to `jitter_pct` percent of the
/// window. Constructed once by the configuration root and shared by
/// reference (DESIGN NOTES §9: no rng process-globals).
pub struct RateGate {
    config: RateGateConfig,
    rng: Mutex<StdRng>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    pub fn with_seed(config: RateGateConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The duration this gate would sleep for its next turn, without
    /// actually sleeping. Exposed so tests can assert on bounds.
    pub fn next_delay(&self) -> Duration {
        let window = self.config.max.saturating_sub(self.config.min);
        let mut rng = self.rng.lock().expect("rate gate rng poisoned");
        let base = if window.is_zero() {
            self.config.min
        } else {
            self.config.min + Duration::from_secs_f64(rng.gen_range(0.0..=window.as_secs_f64()))
        };
        let jitter_span = base.as_secs_f64() * (self.config.jitter_pct / 100.0);
        let jitter = rng.gen_range(-jitter_span..=jitter_span);
        let total = (base.as_secs_f64() + jitter).max(0.0);
        Duration::from_secs_f64(total)
    }

    pub async fn wait(&self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jittered_bounds() {
        let cfg = RateGateConfig {
            min: Duration::from_millis(100),
            max: Duration::from_millis(200),
            jitter_pct: 10.0,
        };
        let gate = RateGate::with_seed(cfg, 42);
        for _ in 0..100 {
            let d = gate.next_delay();
            assert!(d.as_secs_f64() >= 0.0);
            assert!(d.as_secs_f64() <= 0.220_001);
        }
    }
}
