use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::record::Record;
use crate::sink::{normalize_name, numeric_values, METRIC_HELP, METRIC_LABEL, METRIC_PREFIX};

/// Pull-style metrics sink: maintains an in-process registry of one gauge
/// family per producer key and serves it over HTTP at `/metrics`.
pub struct PrometheusSink {
    addr: String,
    registry: Registry,
    gauges: DashMap<String, GaugeVec>,
}

impl PrometheusSink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            registry: Registry::new(),
            gauges: DashMap::new(),
        }
    }

    /// Starts the HTTP server exposing the registry, shutting down when
    /// `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "prometheus exporter started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "prometheus exporter error");
            }
        });

        Ok(())
    }

    /// Updates the gauge family for `key` from a record. Non-numeric tokens
    /// abort the update with `NotANumber` before any value is set.
    pub fn put(&self, key: &str, labels: &[String], record: &Record) -> Result<()> {
        let values = numeric_values(labels, record)?;
        let gauge = self.gauge_for(key)?;

        for (label, value) in values {
            gauge.with_label_values(&[&label]).set(value);
        }

        tracing::debug!(key, "updated prometheus gauges");

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
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}
