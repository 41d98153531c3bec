use anyhow::{bail, Result};
use tracing::warn;

use crate::display::DisplayMode;

/// Execution mode: what the configured queries mean.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Queries are shell commands.
    Query,
    /// Queries are process ids to profile.
    Profile,
    /// Results are read from standard input.
    Read,
}

/// Runtime configuration, assembled from the command line.
#[derive(Debug)]
pub struct Config {
    /// Execution mode.
    pub mode: Mode,
    /// How results are displayed.
    pub display_mode: DisplayMode,
    /// Number of executions per producer; -1 means unbounded.
    pub count: i64,
    /// Seconds between executions.
    pub delay: u64,
    /// Persist results to disk and reload them on startup.
    pub history: bool,
    /// Label subset used to project displayed results.
    pub filters: Vec<String>,
    /// Positional names for result tokens.
    pub labels: Vec<String>,
    /// The configured producers.
    pub queries: Vec<String>,
    /// Expressions applied to each result, left to right.
    pub expressions: Vec<String>,
    /// Port for the remote query surface.
    pub port: u16,
    /// Pushgateway address; empty disables the push sink.
    pub pushgateway_addr: String,
    /// Prometheus exporter listen address; empty disables the pull sink.
    pub prometheus_addr: String,
    /// Document index address; empty disables the index sink.
    pub elasticsearch_addr: String,
    /// Document index collection name.
    pub elasticsearch_index: String,
    /// Document index basic-auth user.
    pub elasticsearch_user: String,
    /// Document index basic-auth password.
    pub elasticsearch_password: String,
    /// Suppress the consumer display.
    pub silent: bool,
}

impl Config {
    /// Validates the configuration for required fields and consistency.
    /// Violations here are fatal at startup.
    pub fn validate(&mut self) -> Result<()> {
        if self.mode != Mode::Read && self.queries.is_empty() {
            bail!("at least one query is required");
        }

        if self.display_mode == DisplayMode::Graph {
            match self.filters.len() {
                0 => bail!("graph display mode requires exactly one filter"),
                1 => {}
                n => {
                    warn!(filters = n, "graph display uses only the first filter");
                    self.filters.truncate(1);
                }
            }
        }

        if !self.elasticsearch_addr.is_empty() && self.elasticsearch_index.is_empty() {
            bail!("an index name is required when a document index address is set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            mode: Mode::Query,
            display_mode: DisplayMode::Stream,
            count: 1,
            delay: 3,
            history: false,
            filters: Vec::new(),
            labels: Vec::new(),
            queries: vec!["echo 1".to_string()],
            expressions: Vec::new(),
            port: 12345,
            pushgateway_addr: String::new(),
            prometheus_addr: String::new(),
            elasticsearch_addr: String::new(),
            elasticsearch_index: String::new(),
            elasticsearch_user: String::new(),
            elasticsearch_password: String::new(),
            silent: false,
        }
    }

    #[test]
    fn test_validate_accepts_base() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_queries() {
        let mut cfg = Config {
            queries: Vec::new(),
            ..base_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn test_read_mode_needs_no_queries() {
        let mut cfg = Config {
            mode: Mode::Read,
            queries: Vec::new(),
            ..base_config()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_graph_mode_requires_a_filter() {
        let mut cfg = Config {
            display_mode: DisplayMode::Graph,
            ..base_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("filter"));
    }

    #[test]
    fn test_graph_mode_truncates_extra_filters() {
        let mut cfg = Config {
            display_mode: DisplayMode::Graph,
            filters: vec!["a".to_string(), "b".to_string()],
            ..base_config()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.filters, vec!["a".to_string()]);
    }

    #[test]
    fn test_elasticsearch_requires_index() {
        let mut cfg = Config {
            elasticsearch_addr: "https://localhost:9200".to_string(),
            ..base_config()
        };
        assert!(cfg.validate().is_err());

        cfg.elasticsearch_index = "results".to_string();
        assert!(cfg.validate().is_ok());
    }
}
