use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Observations kept per histogram for quantile estimates.
const HISTOGRAM_WINDOW: usize = 4096;

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
}

/// Integer gauge. Connection counts and queue depths never need fractions.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
}

/// Sliding window of recent observations plus lifetime count and sum.
struct Histogram {
    window: Mutex<VecDeque<f64>>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(64)),
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
        }
    }

    fn observe(&self, value: f64) {
        {
            let mut window = self.window.lock();
            if window.len() == HISTOGRAM_WINDOW {
                window.pop_front();
            }
            window.push_back(value);
        }
        *self.sum.lock() += value;
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs: Vec<f64> = self.window.lock().iter().copied().collect();
        let count = self.count.load(Ordering::Relaxed);
        let sum = *self.sum.lock();
        if obs.is_empty() {
            return HistogramSummary {
                count,
                sum,
                ..Default::default()
            };
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let at = |q: f64| obs[((obs.len() as f64 * q) as usize).min(obs.len() - 1)];
        HistogramSummary {
            count,
            sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric name plus sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn render_labels(&self, extra: Option<(&str, &str)>) -> String {
        let mut parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
            .collect();
        if let Some((k, v)) = extra {
            parts.push(format!("{k}=\"{v}\""));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Thread-safe in-process metrics recorder rendered in Prometheus text format.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<BTreeMap<MetricKey, Counter>>,
    gauges: RwLock<BTreeMap<MetricKey, Gauge>>,
    histograms: RwLock<BTreeMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.value.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write();
        let c = counters.entry(key).or_insert_with(Counter::new);
        c.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.value.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut gauges = self.gauges.write();
        let g = gauges.entry(key).or_insert_with(Gauge::new);
        g.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.value.store(value, Ordering::Relaxed);
            return;
        }
        let mut gauges = self.gauges.write();
        let g = gauges.entry(key).or_insert_with(Gauge::new);
        g.value.store(value, Ordering::Relaxed);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        let mut histograms = self.histograms.write();
        let h = histograms.entry(key).or_insert_with(Histogram::new);
        h.observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.value.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.value.load(Ordering::Relaxed))
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut last_name = "";

        let counters = self.counters.read();
        for (key, c) in counters.iter() {
            if key.name != last_name {
                let _ = writeln!(out, "# TYPE {} counter", key.name);
                last_name = &key.name;
            }
            let _ = writeln!(
                out,
                "{}{} {}",
                key.name,
                key.render_labels(None),
                c.value.load(Ordering::Relaxed)
            );
        }

        let gauges = self.gauges.read();
        for (key, g) in gauges.iter() {
            if key.name != last_name {
                let _ = writeln!(out, "# TYPE {} gauge", key.name);
                last_name = &key.name;
            }
            let _ = writeln!(
                out,
                "{}{} {}",
                key.name,
                key.render_labels(None),
                g.value.load(Ordering::Relaxed)
            );
        }

        let histograms = self.histograms.read();
        for (key, h) in histograms.iter() {
            if key.name != last_name {
                let _ = writeln!(out, "# TYPE {} summary", key.name);
                last_name = &key.name;
            }
            let s = h.summary();
            for (q, v) in [("0.5", s.p50), ("0.95", s.p95), ("0.99", s.p99)] {
                let _ = writeln!(
                    out,
                    "{}{} {v}",
                    key.name,
                    key.render_labels(Some(("quantile", q)))
                );
            }
            let labels = key.render_labels(None);
            let _ = writeln!(out, "{}_sum{labels} {}", key.name, s.sum);
            let _ = writeln!(out, "{}_count{labels} {}", key.name, s.count);
        }

        out
    }
}
