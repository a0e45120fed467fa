//! In-process metrics for the redemption service
//!
//! Counters, gauges and bucketed histograms keyed by name, exportable as
//! JSON or Prometheus text.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Bucket bounds for latency histograms, in seconds
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Bucket bounds for risk scores
pub const RISK_SCORE_BUCKETS: &[f64] = &[0.0, 10.0, 25.0, 30.0, 50.0, 70.0, 75.0, 100.0];

/// Metrics registry shared by the coordinator and workers
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().await.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }

        self.counters
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().await.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }

        self.gauges
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .await
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record into a latency histogram
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        self.observe_with_buckets(name, LATENCY_BUCKETS, value).await;
    }

    /// Record into a histogram, creating it with `buckets` on first use
    pub async fn observe_with_buckets(&self, name: &str, buckets: &[f64], value: f64) {
        if let Some(histogram) = self.histograms.read().await.get(name) {
            histogram.observe(value);
            return;
        }

        self.histograms
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new(buckets.to_vec())))
            .observe(value);
    }

    /// Observation count of a histogram (0 if absent)
    pub async fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .await
            .get(name)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Prometheus text exposition, names sorted
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP voucher_uptime_seconds Time since service start\n");
        output.push_str("# TYPE voucher_uptime_seconds gauge\n");
        output.push_str(&format!("voucher_uptime_seconds {}\n\n", self.uptime_seconds()));

        let counters = self.counters.read().await;
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            let prom = prometheus_name(name);
            output.push_str(&format!("# TYPE {prom} counter\n"));
            output.push_str(&format!("{prom} {}\n", counters[name].load(Ordering::Relaxed)));
        }
        drop(counters);

        let gauges = self.gauges.read().await;
        let mut names: Vec<_> = gauges.keys().collect();
        names.sort();
        for name in names {
            let prom = prometheus_name(name);
            output.push_str(&format!("# TYPE {prom} gauge\n"));
            output.push_str(&format!("{prom} {}\n", gauges[name].load(Ordering::Relaxed)));
        }
        drop(gauges);

        let histograms = self.histograms.read().await;
        let mut names: Vec<_> = histograms.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&histograms[name].to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum in thousandths
    sum_milli: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.sum_milli
            .fetch_add((value.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bound| value <= *bound) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum(),
            "count": self.count(),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let prom = prometheus_name(name);
        let mut output = format!("# TYPE {prom} histogram\n");

        let mut cumulative = 0u64;
        for (bound, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{prom}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
        }
        output.push_str(&format!("{prom}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        output.push_str(&format!("{prom}_sum {}\n", self.sum()));
        output.push_str(&format!("{prom}_count {}\n", self.count()));

        output
    }
}

/// Predefined metric names
pub mod metric_names {
    pub const REDEMPTIONS_ACCEPTED: &str = "redemptions.accepted";
    /// Suffixed with the error label, e.g. `redemptions.rejected.quota_exceeded`
    pub const REDEMPTIONS_REJECTED_PREFIX: &str = "redemptions.rejected";
    pub const REDEMPTION_LATENCY: &str = "redemptions.latency_seconds";
    pub const COMMIT_RETRIES: &str = "redemptions.commit_retries";

    pub const FRAUD_CASES_OPENED: &str = "fraud.cases_opened";
    pub const FRAUD_RISK_SCORE: &str = "fraud.risk_score";

    pub const VOUCHERS_EXPIRED: &str = "vouchers.expired";
}

/// Time an async operation into a latency histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(metric_name, start.elapsed().as_secs_f64())
        .await;
    result
}
