//! Metrics collection utilities.
//!
//! Aggregates response statistics per host (with latency percentiles) and
//! challenge-cycle counters per realm.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Aggregated metrics across all hosts.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Host-scoped response statistics.
#[derive(Debug, Clone)]
pub struct HostStats {
    pub host: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub challenged: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

impl HostStats {
    fn from_accumulator(host: &str, acc: &HostAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            host: host.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            challenged: acc.challenged,
            average_latency: avg,
            p95_latency: p95,
            last_status: acc.last_status,
        }
    }
}

/// Challenge-cycle counters for one realm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmStats {
    pub realm: String,
    pub cycles_started: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub requests_parked: u64,
    pub requests_replayed: u64,
    pub requests_rejected: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
    pub realms: Vec<RealmStats>,
}

impl MetricsSnapshot {
    pub fn realm(&self, realm: &str) -> Option<&RealmStats> {
        self.realms.iter().find(|stats| stats.realm == realm)
    }

    pub fn host(&self, host: &str) -> Option<&HostStats> {
        self.hosts.iter().find(|stats| stats.host == host)
    }
}

#[derive(Debug)]
struct HostAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    challenged: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<u16>,
}

impl HostAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            challenged: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
        }
    }

    fn record(&mut self, status: u16, latency: Duration) {
        self.total_requests += 1;
        self.last_status = Some(status);

        match status {
            401 | 403 => self.challenged += 1,
            s if s < 500 => self.successes += 1,
            _ => self.failures += 1,
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        (Some(Duration::from_secs_f64(avg)), Some(percentile_95(&samples)))
    }
}

fn percentile_95(sorted: &[Duration]) -> Duration {
    let index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    sorted[index]
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    hosts: HashMap<String, HostAccumulator>,
    realms: HashMap<String, RealmStats>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            hosts: HashMap::new(),
            realms: HashMap::new(),
        }
    }

    fn host_mut(&mut self, host: &str) -> &mut HostAccumulator {
        let window = self.max_window;
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostAccumulator::new(window))
    }

    fn realm_mut(&mut self, realm: &str) -> &mut RealmStats {
        self.realms
            .entry(realm.to_string())
            .or_insert_with(|| RealmStats {
                realm: realm.to_string(),
                ..RealmStats::default()
            })
    }
}

/// Thread-safe metrics collector shared by the pipeline and the client.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_response(&self, host: &str, status: u16, latency: Duration) {
        let mut guard = self.state();
        guard.global.total_requests += 1;
        if status < 500 {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        guard.host_mut(host).record(status, latency);

        let mut samples: Vec<_> = guard
            .hosts
            .values()
            .flat_map(|host| host.latencies.iter())
            .cloned()
            .collect();
        samples.sort_unstable();
        if !samples.is_empty() {
            guard.global.p95_latency = Some(percentile_95(&samples));
        }
    }

    /// Transport failure with no response.
    pub fn record_error(&self, host: &str) {
        let mut guard = self.state();
        guard.global.total_requests += 1;
        guard.global.failures += 1;
        let acc = guard.host_mut(host);
        acc.total_requests += 1;
        acc.failures += 1;
        acc.last_status = Some(0);
    }

    pub fn record_cycle_started(&self, realm: &str) {
        self.state().realm_mut(realm).cycles_started += 1;
    }

    pub fn record_cycle_finished(&self, realm: &str, succeeded: bool) {
        let mut guard = self.state();
        let stats = guard.realm_mut(realm);
        if succeeded {
            stats.cycles_succeeded += 1;
        } else {
            stats.cycles_failed += 1;
        }
    }

    pub fn record_parked(&self, realm: &str) {
        self.state().realm_mut(realm).requests_parked += 1;
    }

    pub fn record_replayed(&self, realm: &str, count: usize) {
        self.state().realm_mut(realm).requests_replayed += count as u64;
    }

    pub fn record_rejected(&self, realm: &str, count: usize) {
        self.state().realm_mut(realm).requests_rejected += count as u64;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let mut hosts: Vec<_> = guard
            .hosts
            .iter()
            .map(|(host, acc)| HostStats::from_accumulator(host, acc))
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        let mut realms: Vec<_> = guard.realms.values().cloned().collect();
        realms.sort_by(|a, b| a.realm.cmp(&b.realm));
        MetricsSnapshot {
            global: guard.global.clone(),
            hosts,
            realms,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_responses_per_host() {
        let metrics = MetricsCollector::new();
        metrics.record_response("mfp.example.com", 200, Duration::from_millis(150));
        metrics.record_response("mfp.example.com", 401, Duration::from_millis(90));
        metrics.record_response("mfp.example.com", 503, Duration::from_millis(800));
        metrics.record_error("mfp.example.com");

        let snapshot = metrics.snapshot();
        let host = snapshot.host("mfp.example.com").unwrap();
        assert_eq!(host.total_requests, 4);
        assert_eq!(host.successes, 1);
        assert_eq!(host.challenged, 1);
        assert_eq!(host.failures, 2);
        assert_eq!(host.p95_latency, Some(Duration::from_millis(800)));
    }

    #[test]
    fn counts_challenge_cycles_per_realm() {
        let metrics = MetricsCollector::new();
        metrics.record_cycle_started("AuthRealm");
        metrics.record_parked("AuthRealm");
        metrics.record_parked("AuthRealm");
        metrics.record_cycle_finished("AuthRealm", true);
        metrics.record_replayed("AuthRealm", 2);
        metrics.record_cycle_started("Other");
        metrics.record_cycle_finished("Other", false);
        metrics.record_rejected("Other", 1);

        let snapshot = metrics.snapshot();
        let auth = snapshot.realm("AuthRealm").unwrap();
        assert_eq!(auth.cycles_succeeded, 1);
        assert_eq!(auth.requests_parked, 2);
        assert_eq!(auth.requests_replayed, 2);
        let other = snapshot.realm("Other").unwrap();
        assert_eq!(other.cycles_failed, 1);
        assert_eq!(other.requests_rejected, 1);
    }
}
