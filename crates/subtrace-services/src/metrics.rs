//! Request metrics for the demo services.
//!
//! Hand-rolled labeled counters and histograms behind short synchronous
//! locks, rendered in Prometheus text exposition format and served at
//! `GET /metrics`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;

type LabelSet = Vec<(String, String)>;

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Monotonic counter with a label set per series.
pub struct Counter {
    name: String,
    help: String,
    series: RwLock<HashMap<LabelSet, u64>>,
}

impl Counter {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.inc_by(labels, 1);
    }

    pub fn inc_by(&self, labels: &[(&str, &str)], n: u64) {
        let mut series = self.series.write();
        *series.entry(label_set(labels)).or_insert(0) += n;
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.series
            .read()
            .get(&label_set(labels))
            .copied()
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        write_metric_header(out, &self.name, &self.help, "counter");
        for (labels, value) in self.series.read().iter() {
            append_sample_line(out, &self.name, labels, *value as f64);
        }
    }
}

#[derive(Debug, Clone)]
struct HistogramSeries {
    count: u64,
    sum: f64,
    bucket_counts: Vec<u64>,
}

/// Histogram with fixed upper bounds and a label set per series.
pub struct Histogram {
    name: String,
    help: String,
    bounds: Vec<f64>,
    series: RwLock<HashMap<LabelSet, HistogramSeries>>,
}

impl Histogram {
    pub fn new(name: impl Into<String>, help: impl Into<String>, bounds: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            bounds,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, labels: &[(&str, &str)], value: f64) {
        let mut series = self.series.write();
        let entry = series
            .entry(label_set(labels))
            .or_insert_with(|| HistogramSeries {
                count: 0,
                sum: 0.0,
                bucket_counts: vec![0; self.bounds.len()],
            });
        entry.count += 1;
        entry.sum += value;
        for (idx, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                entry.bucket_counts[idx] += 1;
            }
        }
    }

    pub fn count(&self, labels: &[(&str, &str)]) -> u64 {
        self.series
            .read()
            .get(&label_set(labels))
            .map(|s| s.count)
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        write_metric_header(out, &self.name, &self.help, "histogram");
        for (labels, sample) in self.series.read().iter() {
            for (idx, bound) in self.bounds.iter().enumerate() {
                let mut with_le = labels.clone();
                with_le.push(("le".to_string(), format_float(*bound)));
                append_sample_line(
                    out,
                    &format!("{}_bucket", self.name),
                    &with_le,
                    sample.bucket_counts[idx] as f64,
                );
            }
            let mut with_inf = labels.clone();
            with_inf.push(("le".to_string(), "+Inf".to_string()));
            append_sample_line(
                out,
                &format!("{}_bucket", self.name),
                &with_inf,
                sample.count as f64,
            );
            append_sample_line(out, &format!("{}_sum", self.name), labels, sample.sum);
            append_sample_line(
                out,
                &format!("{}_count", self.name),
                labels,
                sample.count as f64,
            );
        }
    }
}

/// The metric set every demo service exposes.
pub struct ServiceMetrics {
    /// `<service>_requests_total{endpoint,status}`
    pub requests_total: Counter,
    /// `<service>_processing_seconds{endpoint}`
    pub processing_seconds: Histogram,
    /// `<service>_db_calls_total{table,operation}`
    pub db_calls_total: Counter,
    /// `<service>_payments_total{status}`
    pub payments_total: Counter,
}

impl ServiceMetrics {
    pub fn new(service: &str) -> Self {
        Self {
            requests_total: Counter::new(
                format!("{service}_requests_total"),
                format!("Total number of requests handled by the {service} service"),
            ),
            processing_seconds: Histogram::new(
                format!("{service}_processing_seconds"),
                format!("Time spent processing requests in the {service} service"),
                vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
            db_calls_total: Counter::new(
                format!("{service}_db_calls_total"),
                "Total number of simulated database calls".to_string(),
            ),
            payments_total: Counter::new(
                format!("{service}_payments_total"),
                "Total number of payment attempts by outcome".to_string(),
            ),
        }
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4 * 1024);
        self.requests_total.render(&mut out);
        self.processing_seconds.render(&mut out);
        self.db_calls_total.render(&mut out);
        self.payments_total.render(&mut out);
        out
    }
}

fn write_metric_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn append_sample_line(out: &mut String, name: &str, labels: &[(String, String)], value: f64) {
    if labels.is_empty() {
        let _ = writeln!(out, "{name} {}", format_float(value));
        return;
    }

    let rendered_labels = labels
        .iter()
        .map(|(k, v)| {
            let escaped = escape_label_value(v);
            format!("{k}=\"{escaped}\"")
        })
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(out, "{name}{{{rendered_labels}}} {}", format_float(value));
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_series_independently() {
        let counter = Counter::new("demo_requests_total", "help");
        counter.inc(&[("endpoint", "/api/process"), ("status", "success")]);
        counter.inc(&[("endpoint", "/api/process"), ("status", "success")]);
        counter.inc(&[("endpoint", "/api/process"), ("status", "error")]);

        assert_eq!(
            counter.get(&[("endpoint", "/api/process"), ("status", "success")]),
            2
        );
        assert_eq!(
            counter.get(&[("endpoint", "/api/process"), ("status", "error")]),
            1
        );
        assert_eq!(counter.get(&[("endpoint", "/other"), ("status", "success")]), 0);
    }

    #[test]
    fn histogram_buckets_accumulate() {
        let histogram = Histogram::new("demo_seconds", "help", vec![0.1, 1.0]);
        histogram.observe(&[("endpoint", "/api/data")], 0.05);
        histogram.observe(&[("endpoint", "/api/data")], 0.5);
        histogram.observe(&[("endpoint", "/api/data")], 2.0);

        assert_eq!(histogram.count(&[("endpoint", "/api/data")]), 3);

        let mut out = String::new();
        histogram.render(&mut out);
        assert!(out.contains(r#"demo_seconds_bucket{endpoint="/api/data",le="0.1"} 1"#));
        assert!(out.contains(r#"demo_seconds_bucket{endpoint="/api/data",le="1"} 2"#));
        assert!(out.contains(r#"demo_seconds_bucket{endpoint="/api/data",le="+Inf"} 3"#));
        assert!(out.contains(r#"demo_seconds_count{endpoint="/api/data"} 3"#));
    }

    #[test]
    fn render_emits_help_and_type_lines() {
        let metrics = ServiceMetrics::new("gateway");
        metrics
            .requests_total
            .inc(&[("endpoint", "/api/process"), ("status", "success")]);

        let out = metrics.render();
        assert!(out.contains("# HELP gateway_requests_total"));
        assert!(out.contains("# TYPE gateway_requests_total counter"));
        assert!(out.contains(r#"gateway_requests_total{endpoint="/api/process",status="success"} 1"#));
        assert!(out.contains("# TYPE gateway_processing_seconds histogram"));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label_value("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }
}
