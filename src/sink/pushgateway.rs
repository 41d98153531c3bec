use std::net::UdpSocket;

use anyhow::{Context, Result};
use dashmap::DashMap;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::record::Record;
use crate::sink::{
    normalize_name, numeric_values, METRIC_HELP, METRIC_JOB, METRIC_LABEL, METRIC_PREFIX,
};

/// Outbound address probed to learn the local IP used for the push
/// grouping. No packet is sent; the socket is only connected.
const DUMMY_OUTBOUND_ADDR: &str = "8.8.8.8:80";

/// Push-style metrics sink: converts each record into gauges and pushes the
/// registry to a Prometheus Pushgateway, grouped by a derived instance
/// identifier.
pub struct PushgatewaySink {
    addr: String,
    registry: Registry,
    gauges: DashMap<String, GaugeVec>,
    client: reqwest::Client,
}

impl PushgatewaySink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            registry: Registry::new(),
            gauges: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Converts a record into gauges and pushes the whole registry. A
    /// non-numeric token aborts before anything is pushed.
    pub async fn put(&self, key: &str, labels: &[String], record: &Record) -> Result<()> {
        let values = numeric_values(labels, record)?;
        let gauge = self.gauge_for(key)?;

        for (label, value) in values {
            gauge.with_label_values(&[&label]).set(value);
        }

        let instance = local_instance();
        let body = self.encoded_metrics()?;
        let url = format!(
            "{}/metrics/job/{METRIC_JOB}/instance/{instance}",
            self.addr.trim_end_matches('/'),
        );

        tracing::debug!(key, instance, "pushing to pushgateway");

        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .with_context(|| format!("pushing metrics to {url}"))?
            .error_for_status()
            .context("pushgateway rejected metrics")?;

        Ok(())
    }

    fn gauge_for(&self, key: &str) -> Result<GaugeVec> {
        let name = normalize_name(key);

        if let Some(existing) = self.gauges.get(&name) {
            return Ok(existing.clone());
        }

        let gauge = GaugeVec::new(
            Opts::new(format!("{METRIC_PREFIX}_{name}"), METRIC_HELP),
            &[METRIC_LABEL],
        )?;
        self.registry
            .register(Box::new(gauge.clone()))
            .with_context(|| format!("registering gauge for {key:?}"))?;
        self.gauges.insert(name, gauge.clone());

        Ok(gauge)
    }

    fn encoded_metrics(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics for push")?;
        Ok(buffer)
    }
}

/// Resolves the local outbound IP by connecting a datagram socket toward a
/// well-known endpoint and reading its bound address. Falls back to the
/// loopback address when no route is available.
fn local_instance() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(DUMMY_OUTBOUND_ADDR)?;
        Ok(socket.local_addr()?.ip().to_string())
    };

    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!(error = %e, "outbound address probe failed, using loopback");
            "127.0.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Token;
    use crate::sink::NotANumber;

    #[test]
    fn test_local_instance_is_an_ip() {
        let instance = local_instance();
        assert!(instance.parse::<std::net::IpAddr>().is_ok());
    }

    #[tokio::test]
    async fn test_put_rejects_non_numeric_before_pushing() {
        // The address is never contacted: the NaN check fires first.
        let sink = PushgatewaySink::new("http://127.0.0.1:1");
        let labels = vec!["a".to_string()];
        let record = Record::new("foo", vec![Token::Text("foo".into())]);

        let err = sink.put("q", &labels, &record).await.unwrap_err();
        assert!(err.downcast_ref::<NotANumber>().is_some());
    }

    #[test]
    fn test_encoded_metrics_contains_gauge() {
        let sink = PushgatewaySink::new("http://127.0.0.1:1");
        let gauge = sink.gauge_for("echo hi").unwrap();
        gauge.with_label_values(&["x"]).set(7.0);

        let body = sink.encoded_metrics().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("shui_echo_hi{shui_label=\"x\"} 7"));
    }
}
