//! Turning statistic records into named, labelled samples.
//!
//! Each record's identity labels are attached to every sample emitted from
//! its value columns. Samples are grouped into `prometheus` metric families
//! and rendered with its text encoder.

use std::collections::HashMap;

use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::collector::StatRecord;
use crate::sources::StatSource;

/// Metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// One observation of a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Emits samples for every metric of `source` and every record.
///
/// Output is grouped by metric in the source's order; within a metric,
/// records are ordered by composite key.
pub fn emit(source: &StatSource, records: &HashMap<String, StatRecord>) -> Vec<Sample> {
    let mut keys: Vec<&String> = records.keys().collect();
    keys.sort();

    let mut samples = Vec::with_capacity(keys.len() * source.metrics.len());
    for spec in &source.metrics {
        for key in &keys {
            let record = &records[*key];
            let Some(value) = record.value(&spec.column) else {
                continue;
            };
            samples.push(Sample {
                name: spec.name.clone(),
                help: spec.help.clone(),
                kind: spec.kind,
                labels: record.labels.clone(),
                value: value * spec.scale,
            });
        }
    }
    samples
}

/// Groups samples into metric families, in order of first appearance.
pub fn families(samples: &[Sample]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        let i = *index.entry(sample.name.as_str()).or_insert_with(|| {
            families.push(family(sample));
            families.len() - 1
        });
        families[i].mut_metric().push(metric(sample));
    }
    families
}

fn family(sample: &Sample) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(sample.name.clone());
    family.set_help(sample.help.clone());
    family.set_field_type(match sample.kind {
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Gauge => MetricType::GAUGE,
    });
    family
}

fn metric(sample: &Sample) -> Metric {
    let mut metric = Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
    match sample.kind {
        MetricKind::Counter => {
            let mut counter = Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
        }
        MetricKind::Gauge => {
            let mut gauge = Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
        }
    }
    metric
}

/// Renders samples in the Prometheus text exposition format.
///
/// `# HELP` and `# TYPE` are written once per metric name; samples of the
/// same name are grouped together in order of first appearance.
pub fn render_text(samples: &[Sample]) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families(samples), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::StatValue;
    use crate::sources::SourceRegistry;

    fn record(labels: &[(&str, &str)], values: &[(&str, i128)]) -> StatRecord {
        StatRecord {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), StatValue::Int(*v)))
                .collect(),
        }
    }

    fn function_records() -> HashMap<String, StatRecord> {
        let labels = |f| [("datname", "db"), ("schemaname", "public"), ("funcname", f)];
        HashMap::from([
            (
                "db/public/b".to_string(),
                record(
                    &labels("b"),
                    &[("calls", 2), ("total_time", 500), ("self_time", 250)],
                ),
            ),
            (
                "db/public/a".to_string(),
                record(
                    &labels("a"),
                    &[("calls", 15), ("total_time", 1500), ("self_time", 900)],
                ),
            ),
        ])
    }

    fn sample(name: &str, kind: MetricKind, db: &str, value: f64) -> Sample {
        Sample {
            name: name.to_string(),
            help: "Help text.".to_string(),
            kind,
            labels: vec![("datname".to_string(), db.to_string())],
            value,
        }
    }

    #[test]
    fn emit_scales_and_labels_function_samples() {
        let registry = SourceRegistry::builtin();
        let source = registry.get("postgres_functions").unwrap();

        let samples = emit(source, &function_records());

        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0].name, "postgres_function_calls_total");
        assert_eq!(
            samples[0].labels[2],
            ("funcname".to_string(), "a".to_string())
        );
        assert_eq!(samples[0].value, 15.0);
        assert_eq!(samples[1].labels[2].1, "b");
        assert_eq!(samples[2].name, "postgres_function_total_time_seconds");
        assert_eq!(samples[2].value, 1.5);
        assert_eq!(samples[5].name, "postgres_function_self_time_seconds");
        assert_eq!(samples[5].value, 0.25);
        assert_eq!(samples[5].kind, MetricKind::Counter);
    }

    #[test]
    fn emit_skips_columns_absent_from_record() {
        let registry = SourceRegistry::builtin();
        let source = registry.get("postgres_functions").unwrap();
        let records = HashMap::from([(
            "db/public/f".to_string(),
            record(&[("funcname", "f")], &[("calls", 1)]),
        )]);

        let samples = emit(source, &records);

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "postgres_function_calls_total");
    }

    #[test]
    fn families_group_by_name_in_first_appearance_order() {
        let samples = vec![
            sample("m_total", MetricKind::Counter, "a", 1.0),
            sample("up", MetricKind::Gauge, "a", 1.0),
            sample("m_total", MetricKind::Counter, "b", 3.0),
        ];

        let families = families(&samples);

        assert_eq!(families.len(), 2);
        assert_eq!(families[0].get_name(), "m_total");
        assert_eq!(families[0].get_field_type(), MetricType::COUNTER);
        assert_eq!(families[0].get_metric().len(), 2);
        assert_eq!(families[0].get_metric()[1].get_counter().get_value(), 3.0);
        assert_eq!(families[1].get_field_type(), MetricType::GAUGE);
        assert_eq!(families[1].get_metric()[0].get_gauge().get_value(), 1.0);
    }

    #[test]
    fn render_text_writes_one_header_per_metric() {
        let samples = vec![
            sample("m_total", MetricKind::Counter, "a", 1.0),
            sample("other_total", MetricKind::Counter, "a", 2.5),
            sample("m_total", MetricKind::Counter, "b", 3.0),
        ];

        let text = render_text(&samples).unwrap();

        assert_eq!(text.matches("# TYPE m_total counter").count(), 1);
        assert_eq!(text.matches("# HELP m_total Help text.").count(), 1);
        assert!(text.contains("m_total{datname=\"a\"} 1\n"));
        assert!(text.contains("m_total{datname=\"b\"} 3\n"));
        assert!(text.contains("other_total{datname=\"a\"} 2.5\n"));
        let a = text.find("m_total{datname=\"b\"}").unwrap();
        let other = text.find("# TYPE other_total").unwrap();
        assert!(a < other);
    }

    #[test]
    fn render_text_escapes_label_values() {
        let samples = vec![sample("m_total", MetricKind::Counter, "a\"b\\c", 1.0)];

        let text = render_text(&samples).unwrap();

        assert!(text.contains(r#"m_total{datname="a\"b\\c"} 1"#), "{}", text);
    }

    #[test]
    fn render_text_of_nothing_is_empty() {
        assert_eq!(render_text(&[]).unwrap(), "");
    }
}
