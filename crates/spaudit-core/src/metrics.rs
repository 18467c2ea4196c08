//! Per-stage run metrics.
//!
//! The orchestrator times every stage and records item and error counts; stages add
//! custom numeric metrics (storage totals, exposure counts). [`MetricsCollector::render`]
//! exposes everything in Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Measurements of one stage execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMetrics {
    /// Stage name.
    pub stage: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Items in the run context after the stage.
    pub items: u64,
    /// Errors recorded by the stage.
    pub errors: u64,
    /// Whether the stage succeeded.
    pub succeeded: bool,
    /// Custom metrics set while the stage ran.
    pub custom: BTreeMap<String, f64>,
}

/// A single exported metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// `counter` or `gauge`.
    pub metric_type: &'static str,
    /// Label pairs.
    pub labels: Vec<(String, String)>,
    /// Value.
    pub value: f64,
}

impl Metric {
    fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Metric {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge",
            labels,
            value,
        }
    }

    /// Sample line in text exposition format, without the HELP/TYPE header.
    pub fn sample(&self) -> String {
        let value = if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        };
        if self.labels.is_empty() {
            format!("{} {}", self.name, value)
        } else {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{}{{{}}} {}", self.name, labels, value)
        }
    }
}

/// Collects stage and custom metrics for one run.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    stages: Vec<StageMetrics>,
    custom: BTreeMap<String, f64>,
    pending: BTreeMap<String, f64>,
}

impl MetricsCollector {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a run-level custom metric; it is also attributed to the next recorded stage.
    pub fn set_custom(&mut self, name: &str, value: f64) {
        self.custom.insert(name.to_string(), value);
        self.pending.insert(name.to_string(), value);
    }

    /// Custom metric by name.
    pub fn custom(&self, name: &str) -> Option<f64> {
        self.custom.get(name).copied()
    }

    /// Records one stage execution.
    pub fn record_stage(
        &mut self,
        stage: &str,
        duration: Duration,
        items: u64,
        errors: u64,
        succeeded: bool,
    ) {
        self.stages.push(StageMetrics {
            stage: stage.to_string(),
            duration,
            items,
            errors,
            succeeded,
            custom: std::mem::take(&mut self.pending),
        });
    }

    /// Recorded stages in execution order.
    pub fn stages(&self) -> &[StageMetrics] {
        &self.stages
    }

    /// Most recent record of `stage`.
    pub fn stage(&self, stage: &str) -> Option<&StageMetrics> {
        self.stages.iter().rev().find(|s| s.stage == stage)
    }

    /// Sum of recorded stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    fn metrics(&self, run_id: &str) -> Vec<Metric> {
        let mut out = Vec::new();
        for s in &self.stages {
            let labels = vec![
                ("run_id".to_string(), run_id.to_string()),
                ("stage".to_string(), s.stage.clone()),
            ];
            out.push(Metric::gauge(
                "spaudit_stage_duration_seconds",
                "Stage wall-clock duration",
                labels.clone(),
                s.duration.as_secs_f64(),
            ));
            out.push(Metric::gauge(
                "spaudit_stage_items",
                "Items in the run context after the stage",
                labels.clone(),
                s.items as f64,
            ));
            out.push(Metric::gauge(
                "spaudit_stage_errors",
                "Errors recorded by the stage",
                labels,
                s.errors as f64,
            ));
        }
        for (name, value) in &self.custom {
            out.push(Metric::gauge(
                &format!("spaudit_{}", name),
                "Custom run metric",
                vec![("run_id".to_string(), run_id.to_string())],
                *value,
            ));
        }
        out
    }

    /// Text exposition of every metric, one HELP/TYPE header per metric name.
    pub fn render(&self, run_id: &str) -> String {
        let mut grouped: BTreeMap<String, Vec<Metric>> = BTreeMap::new();
        for metric in self.metrics(run_id) {
            grouped.entry(metric.name.clone()).or_default().push(metric);
        }
        let mut output = String::new();
        for (name, metrics) in grouped {
            if let Some(first) = metrics.first() {
                let _ = writeln!(output, "# HELP {} {}", name, first.help);
                let _ = writeln!(output, "# TYPE {} {}", name, first.metric_type);
            }
            for metric in metrics {
                let _ = writeln!(output, "{}", metric.sample());
            }
        }
        output
    }
}
