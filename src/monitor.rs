//! System Monitor: uniform metrics and health for every other component.
//!
//! Grounded on the parent infrastructure's `monitoring_alerting.rs`, trimmed
//! of its PagerDuty/Slack/Discord paging integrations (no counterpart in the
//! ingestion pipeline's design) and its bounded-ring idiom from
//! `volume_tracker.rs`'s `VecDeque`-based eviction.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::now_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Rate,
    Duration,
}

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub ts: f64,
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub component: Option<String>,
}

/// A bounded ring of samples for one named series; oldest sample evicted first.
struct Series {
    kind: MetricKind,
    max_size: usize,
    samples: VecDeque<MetricSample>,
    counter_total: f64,
}

impl Series {
    fn new(kind: MetricKind, max_size: usize) -> Self {
        Self {
            kind,
            max_size,
            samples: VecDeque::new(),
            counter_total: 0.0,
        }
    }

    fn push(&mut self, sample: MetricSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.max_size {
            self.samples.pop_front();
        }
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.len() < 4 {
            return None;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((values.len() as f64 - 1.0) * p).round() as usize;
        values.get(idx).copied()
    }

    /// Mean of first half vs second half with a ±10% deadband.
    fn trend(&self) -> Trend {
        if self.samples.len() < 2 {
            return Trend::Stable;
        }
        let mid = self.samples.len() / 2;
        let first: Vec<f64> = self.samples.iter().take(mid).map(|s| s.value).collect();
        let second: Vec<f64> = self.samples.iter().skip(mid).map(|s| s.value).collect();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let (m1, m2) = (mean(&first), mean(&second));
        if m1 == 0.0 {
            return Trend::Stable;
        }
        let delta = (m2 - m1) / m1;
        if delta > 0.10 {
            Trend::Increasing
        } else if delta < -0.10 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
    Error,
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub last_update_ts: f64,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportHealth {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub metric: String,
    pub threshold: f64,
    pub observed: f64,
    pub critical: bool,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub timestamp: f64,
    pub health: ReportHealth,
    pub components: HashMap<String, HealthStatus>,
    pub alerts: Vec<Alert>,
}

/// Default thresholds from §4.6, in milliseconds unless noted.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub websocket_connect_ms: f64,
    pub message_processing_ms: f64,
    pub event_processing_ms: f64,
    pub price_update_latency_ms: f64,
    pub circuit_breaker_failure_rate_pct: f64,
    pub trade_execution_ms: f64,
    pub strategy_evaluation_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            websocket_connect_ms: 5000.0,
            message_processing_ms: 100.0,
            event_processing_ms: 50.0,
            price_update_latency_ms: 200.0,
            circuit_breaker_failure_rate_pct: 10.0,
            trade_execution_ms: 500.0,
            strategy_evaluation_ms: 100.0,
        }
    }
}

/// Process-wide singleton. Per-series lock around append; counters/gauges use
/// atomic updates on the hot path.
pub struct SystemMonitor {
    series: Mutex<HashMap<String, Series>>,
    health: Mutex<HashMap<String, ComponentHealth>>,
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    gauges: Mutex<HashMap<String, Arc<AtomicI64>>>,
    thresholds: Thresholds,
    default_ring_size: usize,
    stale_after_secs: f64,
}

impl SystemMonitor {
    pub fn new(thresholds: Thresholds, default_ring_size: usize) -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            thresholds,
            default_ring_size,
            stale_after_secs: 300.0,
        }
    }

    pub fn record_metric(&self, name: &str, kind: MetricKind, value: f64, labels: HashMap<String, String>, component: Option<&str>) {
        let mut series = self.series.lock();
        let entry = series
            .entry(name.to_string())
            .or_insert_with(|| Series::new(kind, self.default_ring_size));
        entry.counter_total += value;
        entry.push(MetricSample {
            name: name.to_string(),
            ts: now_ts(),
            value,
            labels,
            component: component.map(|s| s.to_string()),
        });
    }

    pub fn increment_counter(&self, name: &str, by: u64) {
        let counter = {
            let mut counters = self.counters.lock();
            counters.entry(name.to_string()).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone()
        };
        counter.fetch_add(by, Ordering::Relaxed);
        self.record_metric(name, MetricKind::Counter, by as f64, HashMap::new(), None);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        let gauge = {
            let mut gauges = self.gauges.lock();
            gauges.entry(name.to_string()).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
        };
        gauge.store(value, Ordering::Relaxed);
        self.record_metric(name, MetricKind::Gauge, value as f64, HashMap::new(), None);
    }

    pub fn record_duration(&self, name: &str, duration: std::time::Duration, component: Option<&str>) {
        self.record_metric(name, MetricKind::Duration, duration.as_secs_f64() * 1000.0, HashMap::new(), component);
    }

    pub fn record_trade_operation(&self, op_type: &str, duration: std::time::Duration, success: bool, labels: HashMap<String, String>) {
        let mut labels = labels;
        labels.insert("op_type".to_string(), op_type.to_string());
        labels.insert("success".to_string(), success.to_string());
        self.record_metric("trade_operation_ms", MetricKind::Duration, duration.as_secs_f64() * 1000.0, labels, None);
    }

    pub fn record_strategy_evaluation(&self, name: &str, duration: std::time::Duration, decision: &str, confidence: f64) {
        let mut labels = HashMap::new();
        labels.insert("strategy".to_string(), name.to_string());
        labels.insert("decision".to_string(), decision.to_string());
        labels.insert("confidence".to_string(), confidence.to_string());
        self.record_metric("strategy_evaluation_ms", MetricKind::Duration, duration.as_secs_f64() * 1000.0, labels, None);
    }

    pub fn update_component_health(&self, component: &str, status: HealthStatus, details: HashMap<String, String>) {
        self.health.lock().insert(
            component.to_string(),
            ComponentHealth {
                component: component.to_string(),
                status,
                last_update_ts: now_ts(),
                details,
            },
        );
    }

    pub fn component_health(&self, component: &str) -> Option<ComponentHealth> {
        self.health.lock().get(component).cloned()
    }

    pub fn percentile(&self, name: &str, p: f64) -> Option<f64> {
        self.series.lock().get(name).and_then(|s| s.percentile(p))
    }

    pub fn trend(&self, name: &str) -> Option<Trend> {
        self.series.lock().get(name).map(|s| s.trend())
    }

    /// Overall health is the worst component health within the window; stale
    /// health (no update within `stale_after_secs`) is treated as warning.
    pub fn health_summary(&self) -> Summary {
        let health = self.health.lock();
        let now = now_ts();
        let mut worst = ReportHealth::Healthy;
        let mut components = HashMap::new();

        for (name, h) in health.iter() {
            components.insert(name.clone(), h.status);
            let is_stale = now - h.last_update_ts > self.stale_after_secs;
            let this = if is_stale {
                ReportHealth::Warning
            } else {
                match h.status {
                    HealthStatus::Healthy | HealthStatus::Initializing => ReportHealth::Healthy,
                    HealthStatus::Degraded => ReportHealth::Warning,
                    HealthStatus::Unhealthy | HealthStatus::Error => ReportHealth::Critical,
                }
            };
            worst = worst.max(this);
        }

        let alerts = self.check_thresholds();
        if alerts.iter().any(|a| a.critical) {
            worst = worst.max(ReportHealth::Critical);
        } else if !alerts.is_empty() {
            worst = worst.max(ReportHealth::Warning);
        }

        Summary {
            timestamp: now,
            health: worst,
            components,
            alerts,
        }
    }

    /// A metric that exceeds its registered threshold generates an alert;
    /// exceeding 1.5x threshold escalates to critical.
    fn check_thresholds(&self) -> Vec<Alert> {
        let series = self.series.lock();
        let mut alerts = Vec::new();
        let checks: [(&str, f64); 7] = [
            ("websocket_connect_ms", self.thresholds.websocket_connect_ms),
            ("message_processing_ms", self.thresholds.message_processing_ms),
            ("event_processing_ms", self.thresholds.event_processing_ms),
            ("price_update_latency_ms", self.thresholds.price_update_latency_ms),
            ("circuit_breaker_failure_rate_pct", self.thresholds.circuit_breaker_failure_rate_pct),
            ("trade_execution_ms", self.thresholds.trade_execution_ms),
            ("strategy_evaluation_ms", self.thresholds.strategy_evaluation_ms),
        ];
        for (name, threshold) in checks {
            if let Some(s) = series.get(name) {
                if let Some(latest) = s.samples.back() {
                    if latest.value > threshold {
                        alerts.push(Alert {
                            metric: name.to_string(),
                            threshold,
                            observed: latest.value,
                            critical: latest.value > threshold * 1.5,
                        });
                    }
                }
            }
        }
        alerts
    }

    /// Render every counter/gauge as Prometheus text exposition. Optional;
    /// the `MetricSample` ring above remains the source of truth.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, counter) in self.counters.lock().iter() {
            out.push_str(&format!("# TYPE {name} counter\n{name} {}\n", counter.load(Ordering::Relaxed)));
        }
        for (name, gauge) in self.gauges.lock().iter() {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {}\n", gauge.load(Ordering::Relaxed)));
        }
        out
    }

    /// Spawn the periodic report-interval background task (§4.6, §5).
    pub fn spawn_report_loop(self: &Arc<Self>, interval: std::time::Duration, cancel: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("system monitor report loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let summary = monitor.health_summary();
                        if !summary.alerts.is_empty() {
                            warn!(alerts = summary.alerts.len(), health = ?summary.health, "system monitor threshold alerts");
                        } else {
                            info!(health = ?summary.health, components = summary.components.len(), "system monitor report");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_ring_evicts_oldest_first() {
        let monitor = SystemMonitor::new(Thresholds::default(), 3);
        for i in 0..5 {
            monitor.record_metric("m", MetricKind::Gauge, i as f64, HashMap::new(), None);
        }
        let series = monitor.series.lock();
        let s = series.get("m").unwrap();
        assert_eq!(s.samples.len(), 3);
        let values: Vec<f64> = s.samples.iter().map(|x| x.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn threshold_breach_escalates_to_critical_past_1_5x() {
        let monitor = SystemMonitor::new(Thresholds::default(), 10);
        monitor.record_metric("message_processing_ms", MetricKind::Duration, 500.0, HashMap::new(), None);
        let alerts = monitor.check_thresholds();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].critical);
    }

    #[test]
    fn stale_health_is_reported_as_warning() {
        let monitor = SystemMonitor::new(Thresholds::default(), 10);
        let mut h = HashMap::new();
        h.insert("x".into(), ComponentHealth {
            component: "x".into(),
            status: HealthStatus::Healthy,
            last_update_ts: now_ts() - 1000.0,
            details: HashMap::new(),
        });
        *monitor.health.lock() = h;
        let summary = monitor.health_summary();
        assert_eq!(summary.health, ReportHealth::Warning);
    }

    #[test]
    fn overall_health_is_worst_component() {
        let monitor = SystemMonitor::new(Thresholds::default(), 10);
        monitor.update_component_health("a", HealthStatus::Healthy, HashMap::new());
        monitor.update_component_health("b", HealthStatus::Unhealthy, HashMap::new());
        let summary = monitor.health_summary();
        assert_eq!(summary.health, ReportHealth::Critical);
    }
}
