//! Prometheus-compatible replication metrics.
//!
//! Per-agreement counters updated by the cycle engine, plus coordinator
//! counters for urgent waves, rendered in Prometheus text exposition format.

use crate::agreement::AgreementId;
use crate::mutator::ApplyOutcome;
use std::collections::BTreeMap;

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "dirsync_repl_entries_applied_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a new gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        if self.labels.is_empty() {
            output.push_str(&format!("{} {}\n", self.name, self.format_value()));
        } else {
            let label_str = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!("{}{{{}}} {}\n", self.name, label_str, self.format_value()));
        }
        output
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

/// Counters for one replication agreement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgreementMetrics {
    /// Agreement these counters belong to.
    pub agreement: AgreementId,
    /// Cycles that committed watermark and vector.
    pub cycles_completed: u64,
    /// Cycles that ended with the recovery flag set.
    pub cycles_incomplete: u64,
    /// Cycles skipped because the partner could not be reached or bound.
    pub cycles_skipped: u64,
    /// Pages received.
    pub pages_fetched: u64,
    /// Entries that wrote something.
    pub entries_applied: u64,
    /// Entries that resolved entirely to the local side.
    pub entries_unchanged: u64,
    /// Entries that went through the retry queue and then applied.
    pub entries_retried: u64,
    /// Entries dropped after the retry queue stopped shrinking.
    pub entries_dropped: u64,
    /// Entries skipped because the local vector already covered them.
    pub entries_known: u64,
    /// Entries skipped as unresolved conflicts.
    pub unresolved_conflicts: u64,
    /// Attributes where both sides held different generations.
    pub conflicts_resolved: u64,
    /// Incoming attribute records that lost to local ones.
    pub attrs_rejected: u64,
    /// Value changes applied.
    pub values_applied: u64,
    /// Value changes authored against a losing attribute generation.
    pub values_rejected: u64,
    /// Failed binds, previous credential included.
    pub auth_failures: u64,
    /// Agreement watermark (partner USN).
    pub watermark: u64,
}

impl AgreementMetrics {
    /// Create zeroed counters for an agreement.
    pub fn new(agreement: impl Into<AgreementId>) -> Self {
        Self {
            agreement: agreement.into(),
            ..Self::default()
        }
    }

    /// Fold one entry outcome into the counters.
    pub fn record_outcome(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(_) => self.entries_applied += 1,
            ApplyOutcome::NoChange(_) => self.entries_unchanged += 1,
            ApplyOutcome::NotPresent => {}
        }
        let stats = outcome.stats();
        self.conflicts_resolved += u64::from(stats.conflicts);
        self.attrs_rejected += u64::from(stats.attrs_lost);
        self.values_applied += u64::from(stats.values_applied);
        self.values_rejected += u64::from(stats.values_rejected);
    }

    /// Produce the full list of Prometheus metrics.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let labels = vec![("agreement".to_string(), self.agreement.clone())];
        let counter = |name: &str, help: &str, value: u64| {
            Metric::counter(name, help, labels.clone(), value as f64)
        };
        vec![
            counter("dirsync_repl_cycles_completed_total", "Cycles that committed their watermark", self.cycles_completed),
            counter("dirsync_repl_cycles_incomplete_total", "Cycles that ended in recovery", self.cycles_incomplete),
            counter("dirsync_repl_cycles_skipped_total", "Cycles skipped for an unreachable partner", self.cycles_skipped),
            counter("dirsync_repl_pages_fetched_total", "Sync pages received", self.pages_fetched),
            counter("dirsync_repl_entries_applied_total", "Entries that changed local state", self.entries_applied),
            counter("dirsync_repl_entries_unchanged_total", "Entries resolved to local state", self.entries_unchanged),
            counter("dirsync_repl_entries_retried_total", "Entries applied from the retry queue", self.entries_retried),
            counter("dirsync_repl_entries_dropped_total", "Entries dropped after retries", self.entries_dropped),
            counter("dirsync_repl_entries_known_total", "Entries already covered by the local vector", self.entries_known),
            counter("dirsync_repl_unresolved_conflicts_total", "Entries skipped as unresolved conflicts", self.unresolved_conflicts),
            counter("dirsync_repl_conflicts_resolved_total", "Attribute conflicts resolved", self.conflicts_resolved),
            counter("dirsync_repl_attrs_rejected_total", "Incoming attributes that lost resolution", self.attrs_rejected),
            counter("dirsync_repl_values_applied_total", "Value changes applied", self.values_applied),
            counter("dirsync_repl_values_rejected_total", "Value changes from losing generations", self.values_rejected),
            counter("dirsync_repl_auth_failures_total", "Failed partner binds", self.auth_failures),
            Metric::gauge(
                "dirsync_repl_watermark",
                "Last partner USN fully processed",
                labels.clone(),
                self.watermark as f64,
            ),
        ]
    }

    /// Format all metrics as Prometheus text exposition format.
    pub fn format_prometheus(&self) -> String {
        self.to_metrics().iter().map(Metric::format).collect()
    }
}

/// Counters for the urgent replication coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrgentMetrics {
    /// Waves dispatched.
    pub waves_started: u64,
    /// Waves that reached the acknowledgement threshold.
    pub waves_acknowledged: u64,
    /// Waves that hit the per-wave timeout short of the threshold.
    pub waves_timed_out: u64,
    /// Writers released.
    pub writers_released: u64,
}

impl UrgentMetrics {
    /// Produce the full list of Prometheus metrics.
    pub fn to_metrics(&self) -> Vec<Metric> {
        vec![
            Metric::counter("dirsync_urgent_waves_total", "Urgent waves dispatched", vec![], self.waves_started as f64),
            Metric::counter(
                "dirsync_urgent_waves_acknowledged_total",
                "Urgent waves that reached the threshold",
                vec![],
                self.waves_acknowledged as f64,
            ),
            Metric::counter(
                "dirsync_urgent_waves_timed_out_total",
                "Urgent waves that timed out",
                vec![],
                self.waves_timed_out as f64,
            ),
            Metric::counter(
                "dirsync_urgent_writers_released_total",
                "Writers released by urgent waves",
                vec![],
                self.writers_released as f64,
            ),
        ]
    }
}

/// Metrics of every agreement plus the urgent coordinator.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    per_agreement: BTreeMap<AgreementId, AgreementMetrics>,
    /// Urgent coordinator counters.
    pub urgent: UrgentMetrics,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for an agreement, created on first use.
    pub fn agreement_mut(&mut self, id: &str) -> &mut AgreementMetrics {
        self.per_agreement
            .entry(id.to_string())
            .or_insert_with(|| AgreementMetrics::new(id))
    }

    /// Counters for an agreement.
    pub fn get(&self, id: &str) -> Option<&AgreementMetrics> {
        self.per_agreement.get(id)
    }

    /// Forget a purged agreement.
    pub fn remove(&mut self, id: &str) {
        self.per_agreement.remove(id);
    }

    /// Number of agreements tracked.
    pub fn agreement_count(&self) -> usize {
        self.per_agreement.len()
    }

    /// Entries applied across all agreements.
    pub fn total_entries_applied(&self) -> u64 {
        self.per_agreement.values().map(|m| m.entries_applied).sum()
    }

    /// Everything as one Prometheus exposition.
    pub fn format_all(&self) -> String {
        let mut output: String = self
            .per_agreement
            .values()
            .map(AgreementMetrics::format_prometheus)
            .collect();
        for metric in self.urgent.to_metrics() {
            output.push_str(&metric.format());
        }
        output
    }
}
