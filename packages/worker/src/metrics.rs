//! Worker metrics plug-point.
//!
//! Counters and histograms live in a private `prometheus::Registry`
//! exposed through an accessor; no exporter is wired here. A process
//! supervisor that wants an endpoint can mount the registry itself.

use std::time::Duration;

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

pub struct WorkerMetrics {
    registry: Registry,
    attempts_total: IntCounterVec,
    attempt_duration_seconds: Histogram,
    records_collected_total: IntCounter,
    retries_total: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let attempts_total = IntCounterVec::new(
            Opts::new("attempts_total", "Execution attempts by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let attempt_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "attempt_duration_seconds",
            "Wall-clock duration of execution attempts",
        ))?;
        registry.register(Box::new(attempt_duration_seconds.clone()))?;

        let records_collected_total = IntCounter::new(
            "records_collected_total",
            "Records successfully collected and stored",
        )?;
        registry.register(Box::new(records_collected_total.clone()))?;

        let retries_total = IntCounter::new("retries_total", "Retry iterations across all jobs")?;
        registry.register(Box::new(retries_total.clone()))?;

        Ok(Self {
            registry,
            attempts_total,
            attempt_duration_seconds,
            records_collected_total,
            retries_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_attempt(&self, status: &str, duration: Duration, records_collected: u64) {
        self.attempts_total.with_label_values(&[status]).inc();
        self.attempt_duration_seconds.observe(duration.as_secs_f64());
        if records_collected > 0 {
            self.records_collected_total.inc_by(records_collected);
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_attempt("success", Duration::from_secs(2), 5);
        metrics.record_attempt("failed", Duration::from_secs(1), 0);
        metrics.record_retry();

        let families = metrics.registry().gather();
        let attempts = families
            .iter()
            .find(|f| f.get_name() == "attempts_total")
            .unwrap();
        let total: u64 = attempts
            .get_metric()
            .iter()
            .map(|m| m.get_counter().value() as u64)
            .sum();
        assert_eq!(total, 2);

        let records = families
            .iter()
            .find(|f| f.get_name() == "records_collected_total")
            .unwrap();
        assert_eq!(records.get_metric()[0].get_counter().value() as u64, 5);
    }
}
