//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_entries_total` - Total number of entries committed
//! - `ledger_commits_total` - Committed transactions
//! - `ledger_rejected_total` - Transactions rejected at commit (balance check)
//! - `ledger_lock_contention_total` - Fail-fast lock acquisitions that lost
//! - `ledger_commit_duration_seconds` - Histogram of commit latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Total entries committed
    pub entries_total: IntCounter,

    /// Committed transactions
    pub commits_total: IntCounter,

    /// Transactions rejected by the balance check
    pub rejected_total: IntCounter,

    /// Lock contention errors
    pub lock_contention_total: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total =
            IntCounter::new("ledger_entries_total", "Total number of entries committed")?;
        registry.register(Box::new(entries_total.clone()))?;

        let commits_total = IntCounter::new("ledger_commits_total", "Committed transactions")?;
        registry.register(Box::new(commits_total.clone()))?;

        let rejected_total = IntCounter::new(
            "ledger_rejected_total",
            "Transactions rejected by the commit-time balance check",
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let lock_contention_total = IntCounter::new(
            "ledger_lock_contention_total",
            "Fail-fast lock acquisitions that found the row held",
        )?;
        registry.register(Box::new(lock_contention_total.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("ledger_commit_duration_seconds", "Histogram of commit latencies")
                .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            entries_total,
            commits_total,
            rejected_total,
            lock_contention_total,
            commit_duration,
            registry,
        })
    }

    /// Record a successful commit
    pub fn record_commit(&self, entries: usize, duration_seconds: f64) {
        self.commits_total.inc();
        self.entries_total.inc_by(entries as u64);
        self.commit_duration.observe(duration_seconds);
    }

    /// Record a commit rejected by the balance check
    pub fn record_rejected(&self) {
        self.rejected_total.inc();
    }

    /// Record lock contention
    pub fn record_lock_contention(&self) {
        self.lock_contention_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_total.get(), 0);
        assert_eq!(metrics.commits_total.get(), 0);
    }

    #[test]
    fn test_record_commit() {
        let metrics = Metrics::new().unwrap();
        metrics.record_commit(2, 0.001);
        metrics.record_commit(1, 0.002);
        assert_eq!(metrics.commits_total.get(), 2);
        assert_eq!(metrics.entries_total.get(), 3);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_rejected();
        assert_eq!(a.rejected_total.get(), 1);
        assert_eq!(b.rejected_total.get(), 0);
    }
}
