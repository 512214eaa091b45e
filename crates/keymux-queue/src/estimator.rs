//! Dual-EMA wait-time estimation per model family.
//!
//! `historical` smooths the mean wait of recently completed requests;
//! `current` smooths the longest wait still sitting in the queue. The
//! published estimate is their midpoint, which reacts to building backlog
//! before any of it completes.

use std::collections::HashMap;
use std::time::Duration;

use keymux_keys::ModelFamily;

const HISTORICAL_ALPHA: f64 = 0.2;
const CURRENT_ALPHA: f64 = 0.3;
/// Completed-wait samples older than this stop informing the estimate.
pub const SAMPLE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
pub struct WaitSample {
    pub family: ModelFamily,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FamilyEstimate {
    historical: f64,
    current: f64,
}

#[derive(Debug, Default)]
pub struct WaitEstimator {
    samples: Vec<WaitSample>,
    estimates: HashMap<ModelFamily, FamilyEstimate>,
}

impl WaitEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: WaitSample) {
        self.samples.push(sample);
    }

    pub fn prune(&mut self, now_ms: u64) {
        let ttl = SAMPLE_TTL.as_millis() as u64;
        self.samples
            .retain(|sample| now_ms.saturating_sub(sample.end_ms) < ttl);
    }

    /// One estimator tick: fold the recent completions and the present
    /// backlog into the per-family EMAs.
    ///
    /// `longest_current_wait_ms` maps each family to the age of its oldest
    /// queued request, zero when the partition is empty.
    pub fn tick(&mut self, now_ms: u64, longest_current_wait_ms: &HashMap<ModelFamily, u64>) {
        self.prune(now_ms);

        for family in ModelFamily::ALL {
            let recent: Vec<u64> = self
                .samples
                .iter()
                .filter(|sample| sample.family == *family)
                .map(|sample| sample.end_ms.saturating_sub(sample.start_ms))
                .collect();
            let longest = longest_current_wait_ms.get(family).copied().unwrap_or(0);
            if recent.is_empty() && longest == 0 {
                // Nothing in flight and nothing recent: decay toward zero so
                // the estimate drains once a family goes quiet.
                if let Some(entry) = self.estimates.get_mut(family) {
                    entry.historical *= 1.0 - HISTORICAL_ALPHA;
                    entry.current *= 1.0 - CURRENT_ALPHA;
                }
                continue;
            }

            let entry = self.estimates.entry(*family).or_default();
            if !recent.is_empty() {
                let mean = recent.iter().sum::<u64>() as f64 / recent.len() as f64;
                let updated =
                    HISTORICAL_ALPHA * mean + (1.0 - HISTORICAL_ALPHA) * entry.historical;
                // With an empty partition the estimate must not climb toward
                // old samples still inside the window; only fold them in
                // while they pull the average down.
                entry.historical = if longest == 0 {
                    updated.min(entry.historical)
                } else {
                    updated
                };
            }
            entry.current = CURRENT_ALPHA * longest as f64 + (1.0 - CURRENT_ALPHA) * entry.current;
        }
    }

    pub fn estimate(&self, family: ModelFamily) -> Duration {
        let entry = self.estimates.get(&family).copied().unwrap_or_default();
        Duration::from_millis(((entry.historical + entry.current) / 2.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rises_with_backlog_and_drains_when_idle() {
        let mut estimator = WaitEstimator::new();
        let family = ModelFamily::Gpt4o;
        let mut backlog = HashMap::new();
        backlog.insert(family, 8_000u64);

        estimator.record(WaitSample {
            family,
            start_ms: 0,
            end_ms: 4_000,
        });
        estimator.tick(10_000, &backlog);
        let busy = estimator.estimate(family);
        assert!(busy > Duration::ZERO);

        // Family drains: estimate is non-increasing across idle ticks.
        let empty = HashMap::new();
        let mut last = busy;
        for tick in 1..=20u64 {
            estimator.tick(10_000 + tick * 3_000, &empty);
            let next = estimator.estimate(family);
            assert!(next <= last);
            last = next;
        }
        assert!(last < busy);
    }

    #[test]
    fn samples_age_out() {
        let mut estimator = WaitEstimator::new();
        estimator.record(WaitSample {
            family: ModelFamily::Claude,
            start_ms: 0,
            end_ms: 1_000,
        });
        estimator.prune(1_000 + SAMPLE_TTL.as_millis() as u64 + 1);
        assert!(estimator.samples.is_empty());
    }
}
