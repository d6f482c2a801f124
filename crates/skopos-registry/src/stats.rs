//! Per-host call statistics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
struct HostStats {
    calls: u64,
    cache_hits: u64,
    coalesced: u64,
    errors_by_status: BTreeMap<u16, u64>,
    transport_errors: u64,
    total_latency: Duration,
}

/// Point-in-time counters for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatsSnapshot {
    /// Registry host.
    pub host: String,
    /// Network calls attempted, including failed ones.
    pub calls: u64,
    /// Lookups served from the cache.
    pub cache_hits: u64,
    /// Lookups that joined a fetch already in flight.
    #[serde(default)]
    pub coalesced: u64,
    /// Error responses by HTTP status.
    pub errors_by_status: BTreeMap<u16, u64>,
    /// Calls that received no response.
    pub transport_errors: u64,
    /// Mean latency of network calls.
    #[serde(with = "duration_millis")]
    pub avg_latency: Duration,
}

/// Aggregates call statistics across hosts.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    hosts: Arc<Mutex<HashMap<String, HostStats>>>,
}

impl CallStats {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call that received a response.
    pub fn record_call(&self, host: &str, status: u16, latency: Duration) {
        let mut hosts = self.hosts.lock();
        let stats = hosts.entry(host.to_string()).or_default();
        stats.calls += 1;
        stats.total_latency += latency;
        if status >= 400 {
            *stats.errors_by_status.entry(status).or_default() += 1;
        }
    }

    /// Records a call that failed below HTTP.
    pub fn record_transport_error(&self, host: &str, latency: Duration) {
        let mut hosts = self.hosts.lock();
        let stats = hosts.entry(host.to_string()).or_default();
        stats.calls += 1;
        stats.transport_errors += 1;
        stats.total_latency += latency;
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self, host: &str) {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_default()
            .cache_hits += 1;
    }

    /// Records a lookup that joined an in-flight fetch.
    pub fn record_coalesced(&self, host: &str) {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_default()
            .coalesced += 1;
    }

    /// Returns counters for every host, sorted by host.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HostStatsSnapshot> {
        let hosts = self.hosts.lock();
        let mut snapshot: Vec<HostStatsSnapshot> = hosts
            .iter()
            .map(|(host, stats)| HostStatsSnapshot {
                host: host.clone(),
                calls: stats.calls,
                cache_hits: stats.cache_hits,
                coalesced: stats.coalesced,
                errors_by_status: stats.errors_by_status.clone(),
                transport_errors: stats.transport_errors,
                avg_latency: u32::try_from(stats.calls)
                    .ok()
                    .filter(|calls| *calls > 0)
                    .map_or(Duration::ZERO, |calls| stats.total_latency / calls),
            })
            .collect();
        drop(hosts);
        snapshot.sort_by(|a, b| a.host.cmp(&b.host));
        snapshot
    }

    /// Returns counters for one host.
    #[must_use]
    pub fn host(&self, host: &str) -> Option<HostStatsSnapshot> {
        self.snapshot().into_iter().find(|s| s.host == host)
    }

    /// Resets all counters.
    pub fn reset(&self) {
        self.hosts.lock().clear();
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_host() {
        let stats = CallStats::new();
        stats.record_call("ghcr.io", 200, Duration::from_millis(100));
        stats.record_call("ghcr.io", 404, Duration::from_millis(50));
        stats.record_call("ghcr.io", 429, Duration::from_millis(30));
        stats.record_transport_error("ghcr.io", Duration::from_millis(20));
        stats.record_cache_hit("ghcr.io");
        stats.record_coalesced("ghcr.io");
        stats.record_coalesced("ghcr.io");
        stats.record_call("docker.io", 200, Duration::from_millis(10));

        let ghcr = stats.host("ghcr.io").unwrap();
        assert_eq!(ghcr.calls, 4);
        assert_eq!(ghcr.cache_hits, 1);
        assert_eq!(ghcr.coalesced, 2);
        assert_eq!(ghcr.transport_errors, 1);
        assert_eq!(ghcr.errors_by_status, BTreeMap::from([(404, 1), (429, 1)]));
        assert_eq!(ghcr.avg_latency, Duration::from_millis(50));

        let docker = stats.host("docker.io").unwrap();
        assert_eq!(docker.calls, 1);
        assert_eq!(docker.coalesced, 0);
        assert!(docker.errors_by_status.is_empty());
    }

    #[test]
    fn test_cache_only_host_has_zero_latency() {
        let stats = CallStats::new();
        stats.record_cache_hit("quay.io");
        let quay = stats.host("quay.io").unwrap();
        assert_eq!(quay.calls, 0);
        assert_eq!(quay.avg_latency, Duration::ZERO);
    }

    #[test]
    fn test_snapshot_sorted_and_serializable() {
        let stats = CallStats::new();
        stats.record_call("z.io", 200, Duration::from_millis(5));
        stats.record_call("a.io", 500, Duration::from_millis(7));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot[0].host, "a.io");
        assert_eq!(snapshot[1].host, "z.io");

        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(json["avg_latency"], 7);
        assert_eq!(json["errors_by_status"]["500"], 1);

        stats.reset();
        assert!(stats.snapshot().is_empty());
    }
}
