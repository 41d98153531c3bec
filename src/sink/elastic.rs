use anyhow::{Context, Result};
use serde_json::json;

use crate::record::Record;
use crate::sink::{normalize_name, token_json};

/// Document-index sink: converts each record into a flat JSON document and
/// indexes it under a configured collection, with optional basic auth.
pub struct ElasticSink {
    address: String,
    index: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl ElasticSink {
    pub fn new(address: String, index: String, user: String, password: String) -> Result<Self> {
        // Self-signed certificates are accepted.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("building elasticsearch client")?;

        Ok(Self {
            address,
            index,
            user,
            password,
            client,
        })
    }

    /// Indexes one record as a document.
    pub async fn put(&self, key: &str, labels: &[String], record: &Record) -> Result<()> {
        let document = record_to_document(key, labels, record);
        let url = format!("{}/{}/_doc", self.address.trim_end_matches('/'), self.index);

        tracing::debug!(key, index = %self.index, "indexing document");

        let mut request = self.client.post(&url).json(&document);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        request
            .send()
            .await
            .with_context(|| format!("indexing document at {url}"))?
            .error_for_status()
            .context("document index rejected record")?;

        Ok(())
    }
}

/// Builds the flat document for one record:
/// `{ timestamp, query, "value.<normalised-label>": token, ... }`.
fn record_to_document(key: &str, labels: &[String], record: &Record) -> serde_json::Value {
    let mut document = serde_json::Map::with_capacity(labels.len() + 2);

    document.insert("timestamp".to_string(), json!(record.time));
    document.insert("query".to_string(), json!(key));

    for (label, token) in labels.iter().zip(record.tokens.iter()) {
        document.insert(
            format!("value.{}", normalize_name(label)),
            token_json(token),
        );
    }

    serde_json::Value::Object(document)
}
