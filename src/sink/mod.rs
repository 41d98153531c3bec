pub mod elastic;
pub mod prometheus;
pub mod pushgateway;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::record::{Record, Token};

pub use elastic::ElasticSink;
pub use prometheus::PrometheusSink;
pub use pushgateway::PushgatewaySink;

/// Job name applied to pushed metric groups.
pub const METRIC_JOB: &str = "shui";
/// Prefix for all exported metric names.
pub const METRIC_PREFIX: &str = "shui";
/// Metric label carrying the record label name.
pub const METRIC_LABEL: &str = "shui_label";
/// Help text attached to all exported gauges.
pub const METRIC_HELP: &str = "Produced by shui.";

/// A token that cannot be exported as a numeric metric value.
#[derive(Debug, Error)]
#[error("attempted to use non-numeric value in numerical context: {value:?}")]
pub struct NotANumber {
    pub value: String,
}

/// External sink dispatch. Enum dispatch rather than trait objects, so sink
/// calls stay plain async fns.
pub enum Sink {
    Prometheus(PrometheusSink),
    Pushgateway(PushgatewaySink),
    Elastic(ElasticSink),
}

impl Sink {
    /// Returns the sink's name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Prometheus(_) => "prometheus",
            Self::Pushgateway(_) => "pushgateway",
            Self::Elastic(_) => "elasticsearch",
        }
    }

    /// Initialize the sink (only the pull sink has a server to start).
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Prometheus(s) => s.start(cancel).await,
            Self::Pushgateway(_) | Self::Elastic(_) => Ok(()),
        }
    }

    /// Observe one successfully appended record.
    pub async fn put(&self, key: &str, labels: &[String], record: &Record) -> Result<()> {
        match self {
            Self::Prometheus(s) => s.put(key, labels, record),
            Self::Pushgateway(s) => s.put(key, labels, record).await,
            Self::Elastic(s) => s.put(key, labels, record).await,
        }
    }
}

/// Replaces runs of characters outside `[A-Za-z0-9_]` with a single
/// underscore and trims leading/trailing underscores, producing names safe
/// for external systems.
pub fn normalize_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;

    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }

    out.trim_matches('_').to_string()
}

/// Pairs labels with numeric token values for gauge emission. The first
/// non-numeric token aborts with `NotANumber`.
pub(crate) fn numeric_values(
    labels: &[String],
    record: &Record,
) -> Result<Vec<(String, f64)>, NotANumber> {
    labels
        .iter()
        .zip(record.tokens.iter())
        .map(|(label, token)| match token.as_f64() {
            Some(v) => Ok((label.clone(), v)),
            None => Err(NotANumber {
                value: token.to_string(),
            }),
        })
        .collect()
}

/// Typed JSON view of a token for document payloads.
pub(crate) fn token_json(token: &Token) -> serde_json::Value {
    match token {
        Token::Int(i) => serde_json::json!(i),
        Token::Float(f) => serde_json::json!(f),
        Token::Text(s) => serde_json::json!(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("echo 1 2 3"), "echo_1_2_3");
        assert_eq!(normalize_name("df -h | head"), "df_h_head");
        assert_eq!(normalize_name("__x__"), "x");
        assert_eq!(normalize_name("CPU Usage (%)"), "CPU_Usage");
        assert_eq!(normalize_name("a:b"), "a_b");
        assert_eq!(normalize_name("already_fine_9"), "already_fine_9");
    }

    #[test]
    fn test_numeric_values_accepts_ints_and_floats() {
        let record = Record::new("1 2.5", vec![Token::Int(1), Token::Float(2.5)]);
        let labels = vec!["a".to_string(), "b".to_string()];

        let values = numeric_values(&labels, &record).unwrap();
        assert_eq!(values, vec![("a".to_string(), 1.0), ("b".to_string(), 2.5)]);
    }

    #[test]
    fn test_numeric_values_rejects_text() {
        let record = Record::new("1 foo", vec![Token::Int(1), Token::Text("foo".into())]);
        let labels = vec!["a".to_string(), "b".to_string()];

        let err = numeric_values(&labels, &record).unwrap_err();
        assert_eq!(err.value, "foo");
    }

    #[test]
    fn test_numeric_values_tolerates_width_drift() {
        // More tokens than labels: the unpaired tail is ignored rather
        // than rejected.
        let record = Record::new("1 2 3", vec![Token::Int(1), Token::Int(2), Token::Int(3)]);
        let labels = vec!["a".to_string()];

        let values = numeric_values(&labels, &record).unwrap();
        assert_eq!(values.len(), 1);
    }
}
