//! Metrics for [super::Engine].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::Engine].
#[derive(Default)]
pub struct Metrics {
    /// Write transactions committed.
    pub commits: Counter,
    /// Write transactions discarded.
    pub rollbacks: Counter,
    /// Times free pages were returned to the filesystem.
    pub compactions: Counter,
    /// Buckets currently stored.
    pub buckets: Gauge,
    /// Size of the database in bytes.
    pub size: Gauge,
    /// Bytes held by free pages.
    pub free: Gauge,
}

impl Metrics {
    /// Register all metrics with the given registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register("commits", "Committed transactions", self.commits.clone());
        registry.register(
            "rollbacks",
            "Rolled back transactions",
            self.rollbacks.clone(),
        );
        registry.register("compactions", "Compactions", self.compactions.clone());
        registry.register("buckets", "Stored buckets", self.buckets.clone());
        registry.register("size", "Size of the database in bytes", self.size.clone());
        registry.register("free", "Bytes held by free pages", self.free.clone());
    }
}
