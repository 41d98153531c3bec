use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::store::{SeriesData, Store};

/// Remote query surface: exposes stored series to remote callers.
///
/// The contract is exact equality of the returned records with the
/// in-memory log at the time of reply.
pub struct QueryServer {
    addr: String,
    store: Arc<Store>,
}

impl QueryServer {
    pub fn new(addr: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            addr: addr.into(),
            store,
        }
    }

    /// Binds and starts serving, returning the bound address. Shuts down
    /// when `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr> {
        let app = Router::new()
            .route("/series/:key", get(series_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self.store));

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "query server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "query server error");
            }
        });

        Ok(local_addr)
    }
}

/// GET /series/{key} - the full series for a producer key. An unknown key
/// yields an empty series, matching the store's read semantics.
async fn series_handler(
    State(store): State<Arc<Store>>,
    Path(key): Path<String>,
) -> Json<SeriesData> {
    Json(store.get_all(&key).unwrap_or(SeriesData {
        labels: Vec::new(),
        records: Vec::new(),
    }))
}

/// GET /healthz - simple liveness check.
async fn healthz_handler() -> &'static str {
    "ok"
}
