use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runtime counters reported by `GET /statistics`.
#[derive(Debug, Default)]
pub struct RouterStatistics {
    active_fallbacks: AtomicI64,
    /// Seconds, 0.0 until the first completed turn
    avg_latency: Mutex<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub total_fallbacks: u64,
    pub active_fallbacks: u64,
    pub health_checks: u64,
    pub health_failures: u64,
    /// Seconds
    pub average_latency: f64,
}

impl RouterStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64();
        let mut avg = self.avg_latency.lock();
        if *avg == 0.0 {
            *avg = sample;
        } else {
            // Exponential moving average with α = 0.3
            *avg = *avg * 0.7 + sample * 0.3;
        }
    }

    pub fn average_latency(&self) -> f64 {
        *self.avg_latency.lock()
    }

    pub fn active_fallbacks(&self) -> u64 {
        self.active_fallbacks.load(Ordering::Relaxed).max(0) as u64
    }

    /// Count a turn in flight against an alternate until the guard drops.
    pub fn fallback_in_flight(self: &Arc<Self>) -> ActiveFallbackGuard {
        self.active_fallbacks.fetch_add(1, Ordering::Relaxed);
        ActiveFallbackGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(
        &self,
        total_fallbacks: u64,
        health_checks: u64,
        health_failures: u64,
    ) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_fallbacks,
            active_fallbacks: self.active_fallbacks(),
            health_checks,
            health_failures,
            average_latency: self.average_latency(),
        }
    }
}

pub struct ActiveFallbackGuard {
    stats: Arc<RouterStatistics>,
}

impl Drop for ActiveFallbackGuard {
    fn drop(&mut self) {
        self.stats.active_fallbacks.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_moving_average() {
        let stats = RouterStatistics::new();
        assert_eq!(stats.average_latency(), 0.0);

        stats.record_latency(Duration::from_secs(1));
        assert!((stats.average_latency() - 1.0).abs() < 1e-9);

        stats.record_latency(Duration::from_secs(2));
        assert!((stats.average_latency() - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_gauge_follows_guards() {
        let stats = Arc::new(RouterStatistics::new());
        let first = stats.fallback_in_flight();
        let second = stats.fallback_in_flight();
        assert_eq!(stats.active_fallbacks(), 2);

        drop(first);
        assert_eq!(stats.active_fallbacks(), 1);
        drop(second);

        let snapshot = stats.snapshot(4, 10, 3);
        assert_eq!(snapshot.active_fallbacks, 0);
        assert_eq!(snapshot.total_fallbacks, 4);
        assert_eq!(snapshot.health_failures, 3);
    }
}
