//! Pull-based metrics for the call engine.
//!
//! Handles are cheap `Arc`s over atomic cells: the frame path clones
//! them once per call and increments without taking a lock, so a slow
//! scrape can never stall audio. `render` produces the Prometheus text
//! exposition consumed by the engine's `/metrics` route.

use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Upper bounds (seconds) for latency histograms.
const BUCKETS: [f64; 10] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

type SeriesKey = (&'static str, String);

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct HistogramCell {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

#[derive(Clone, Default)]
pub struct Histogram(Arc<HistogramCell>);

impl Histogram {
    pub fn observe(&self, seconds: f64) {
        for (i, le) in BUCKETS.iter().enumerate() {
            if seconds <= *le {
                self.0.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.0.count.fetch_add(1, Ordering::Relaxed);
        self.0
            .sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.0.count.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Registry {
    counters: Mutex<BTreeMap<SeriesKey, Counter>>,
    gauges: Mutex<BTreeMap<SeriesKey, Gauge>>,
    histograms: Mutex<BTreeMap<SeriesKey, Histogram>>,
}

#[derive(Clone, Default)]
pub struct Metrics {
    registry: Arc<Registry>,
}

fn label_block(labels: &[(&'static str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", body)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the counter series for `name` + `labels`.
    pub fn counter(
        &self,
        name: &'static str,
        labels: &[(&'static str, &str)],
    ) -> Counter {
        let key = (name, label_block(labels));
        self.registry
            .counters
            .lock()
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn gauge(
        &self,
        name: &'static str,
        labels: &[(&'static str, &str)],
    ) -> Gauge {
        let key = (name, label_block(labels));
        self.registry.gauges.lock().entry(key).or_default().clone()
    }

    pub fn histogram(
        &self,
        name: &'static str,
        labels: &[(&'static str, &str)],
    ) -> Histogram {
        let key = (name, label_block(labels));
        self.registry
            .histograms
            .lock()
            .entry(key)
            .or_default()
            .clone()
    }

    /// Drop every series labeled `label="value"`. Used at call teardown
    /// so per-call series don't accumulate for the life of the process.
    pub fn drop_series(&self, label: &str, value: &str) {
        let needle = format!("{}=\"{}\"", label, value);
        self.registry
            .counters
            .lock()
            .retain(|(_, block), _| !block.contains(&needle));
        self.registry
            .gauges
            .lock()
            .retain(|(_, block), _| !block.contains(&needle));
        self.registry
            .histograms
            .lock()
            .retain(|(_, block), _| !block.contains(&needle));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let counters = self.registry.counters.lock();
        let mut last = "";
        for ((name, block), cell) in counters.iter() {
            if *name != last {
                out.push_str(&format!("# TYPE {} counter\n", name));
                last = *name;
            }
            out.push_str(&format!("{}{} {}\n", name, block, cell.get()));
        }
        drop(counters);

        let gauges = self.registry.gauges.lock();
        let mut last = "";
        for ((name, block), cell) in gauges.iter() {
            if *name != last {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                last = *name;
            }
            out.push_str(&format!("{}{} {}\n", name, block, cell.get()));
        }
        drop(gauges);

        let histograms = self.registry.histograms.lock();
        let mut last = "";
        for ((name, block), cell) in histograms.iter() {
            if *name != last {
                out.push_str(&format!("# TYPE {} histogram\n", name));
                last = *name;
            }
            let inner = block.trim_start_matches('{').trim_end_matches('}');
            for (i, le) in BUCKETS.iter().enumerate() {
                let mut labels = vec![format!("le=\"{}\"", le)];
                if !inner.is_empty() {
                    labels.insert(0, inner.to_string());
                }
                out.push_str(&format!(
                    "{}_bucket{{{}}} {}\n",
                    name,
                    labels.join(","),
                    cell.0.buckets[i].load(Ordering::Relaxed)
                ));
            }
            let mut labels = vec!["le=\"+Inf\"".to_string()];
            if !inner.is_empty() {
                labels.insert(0, inner.to_string());
            }
            out.push_str(&format!(
                "{}_bucket{{{}}} {}\n",
                name,
                labels.join(","),
                cell.count()
            ));
            out.push_str(&format!(
                "{}_sum{} {}\n",
                name,
                block,
                cell.0.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
            ));
            out.push_str(&format!("{}_count{} {}\n", name, block, cell.count()));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_series_shared_by_key() {
        let metrics = Metrics::new();
        let a = metrics.counter("frames_total", &[("call", "C1")]);
        let b = metrics.counter("frames_total", &[("call", "C1")]);
        a.inc();
        b.add(2);
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn render_counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.counter("frames_total", &[("call", "C1")]).add(5);
        metrics.gauge("active_calls", &[]).set(2);
        let text = metrics.render();
        assert!(text.contains("# TYPE frames_total counter"));
        assert!(text.contains("frames_total{call=\"C1\"} 5"));
        assert!(text.contains("active_calls 2"));
    }

    #[test]
    fn render_histogram_buckets() {
        let metrics = Metrics::new();
        let h = metrics.histogram("turn_latency_seconds", &[("call", "C1")]);
        h.observe(0.02);
        h.observe(0.3);
        let text = metrics.render();
        assert!(text
            .contains("turn_latency_seconds_bucket{call=\"C1\",le=\"0.025\"} 1"));
        assert!(text
            .contains("turn_latency_seconds_bucket{call=\"C1\",le=\"0.5\"} 2"));
        assert!(text.contains("turn_latency_seconds_count{call=\"C1\"} 2"));
    }

    #[test]
    fn drop_series_removes_call_labels() {
        let metrics = Metrics::new();
        metrics.counter("frames_total", &[("call", "C1")]).inc();
        metrics.counter("frames_total", &[("call", "C2")]).inc();
        metrics.drop_series("call", "C1");
        let text = metrics.render();
        assert!(!text.contains("call=\"C1\""));
        assert!(text.contains("call=\"C2\""));
    }

    #[test]
    fn observe_duration_accumulates_sum() {
        let metrics = Metrics::new();
        let h = metrics.histogram("stt_tts_seconds", &[]);
        h.observe_duration(Duration::from_millis(40));
        assert_eq!(h.count(), 1);
        let text = metrics.render();
        assert!(text.contains("stt_tts_seconds_sum 0.04"));
    }
}
