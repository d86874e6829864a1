use crate::error::Result;
use prometheus::{IntCounter, IntGauge, Registry, opts};
use serde::Serialize;

/// Prometheus-backed counters for the filtering engine.
///
/// The admin API reports these as a flat JSON object, so the snapshot
/// struct keeps the wire field names.
pub struct Metrics {
    registry: Registry,

    total_queries: IntCounter,
    blocked_queries: IntCounter,
    blocked_domains: IntGauge,
}

/// JSON view served by the admin `/metrics` endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    #[serde(rename = "TotalQueries")]
    pub total_queries: u64,
    #[serde(rename = "BlockedQueries")]
    pub blocked_queries: u64,
    #[serde(rename = "BlockedDomains")]
    pub blocked_domains: i64,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let total_queries = IntCounter::with_opts(opts!(
            "dnsgate_queries_total",
            "Total number of DNS queries seen by the filter"
        ))?;

        let blocked_queries = IntCounter::with_opts(opts!(
            "dnsgate_blocked_queries_total",
            "Total number of DNS queries answered with NXDOMAIN by the filter"
        ))?;

        let blocked_domains = IntGauge::with_opts(opts!(
            "dnsgate_blocked_domains",
            "Number of domains in the active block index"
        ))?;

        registry.register(Box::new(total_queries.clone()))?;
        registry.register(Box::new(blocked_queries.clone()))?;
        registry.register(Box::new(blocked_domains.clone()))?;

        Ok(Self {
            registry,
            total_queries,
            blocked_queries,
            blocked_domains,
        })
    }

    pub fn record_query(&self) {
        self.total_queries.inc();
    }

    pub fn record_blocked(&self) {
        self.blocked_queries.inc();
    }

    /// Called after every staging swap with the fresh index count.
    pub fn set_blocked_domains(&self, count: i64) {
        self.blocked_domains.set(count);
    }

    pub fn blocked_domains(&self) -> i64 {
        self.blocked_domains.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries.get(),
            blocked_queries: self.blocked_queries.get(),
            blocked_domains: self.blocked_domains.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_counters() {
        let metrics = Metrics::new().unwrap();

        metrics.record_query();
        metrics.record_query();
        metrics.record_blocked();
        metrics.set_blocked_domains(42);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_queries, 2);
        assert_eq!(snap.blocked_queries, 1);
        assert_eq!(snap.blocked_domains, 42);
    }

    #[test]
    fn test_snapshot_wire_names() {
        let metrics = Metrics::new().unwrap();
        metrics.record_query();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["TotalQueries"], 1);
        assert_eq!(json["BlockedQueries"], 0);
        assert_eq!(json["BlockedDomains"], 0);
    }
}
