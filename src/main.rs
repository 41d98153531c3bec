use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use shui::agent::{Agent, Control};
use shui::config::{Config, Mode};
use shui::display::DisplayMode;

/// Scheduled query runner with a time-series results engine.
#[derive(Parser)]
#[command(name = "shui", version, about)]
struct Cli {
    /// Number of executions per query; -1 repeats until interrupted.
    #[arg(short, long, default_value_t = 1)]
    count: i64,

    /// Seconds to wait between executions.
    #[arg(short, long, default_value_t = 3)]
    delay: u64,

    /// How results are displayed.
    #[arg(long, value_enum, default_value_t = DisplayMode::Stream)]
    display: DisplayMode,

    /// What the configured queries mean.
    #[arg(short, long, value_enum, default_value_t = Mode::Query)]
    mode: Mode,

    /// Persist results to disk and reload them on startup.
    #[arg(long)]
    history: bool,

    /// Comma-separated label names used to project displayed results.
    #[arg(short, long, value_delimiter = ',')]
    filters: Vec<String>,

    /// Comma-separated positional names for result values.
    #[arg(short, long, value_delimiter = ',')]
    labels: Vec<String>,

    /// Port for the remote query surface.
    #[arg(short, long, default_value_t = 12345)]
    port: u16,

    /// Prometheus Pushgateway address to push results to.
    #[arg(long, default_value = "")]
    pushgateway: String,

    /// Listen address for the Prometheus exporter (e.g. "0.0.0.0:9091").
    #[arg(long, default_value = "")]
    prometheus: String,

    /// Document index address to send results to.
    #[arg(long, default_value = "")]
    elasticsearch_addr: String,

    /// Document index collection name.
    #[arg(long, default_value = "")]
    elasticsearch_index: String,

    /// Document index basic-auth user.
    #[arg(long, default_value = "")]
    elasticsearch_user: String,

    /// Document index basic-auth password.
    #[arg(long, default_value = "")]
    elasticsearch_password: String,

    /// Query to execute. May be given multiple times.
    #[arg(short, long)]
    query: Vec<String>,

    /// Expression applied to each result, left to right. May be given
    /// multiple times.
    #[arg(short, long)]
    expr: Vec<String>,

    /// Switch to read mode automatically when standard input is piped.
    #[arg(long)]
    stdin: bool,

    /// Suppress the consumer display.
    #[arg(short, long)]
    silent: bool,

    /// Write logs to this file instead of standard error.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut mode = self.mode;

        // Piped standard input implies read mode when auto-detection is on.
        if self.stdin && !std::io::stdin().is_terminal() {
            mode = Mode::Read;
        }

        Config {
            mode,
            display_mode: self.display,
            count: self.count,
            delay: self.delay,
            history: self.history,
            filters: self.filters,
            labels: self.labels,
            queries: self.query,
            expressions: self.expr,
            port: self.port,
            pushgateway_addr: self.pushgateway,
            prometheus_addr: self.prometheus,
            elasticsearch_addr: self.elasticsearch_addr,
            elasticsearch_index: self.elasticsearch_index,
            elasticsearch_user: self.elasticsearch_user,
            elasticsearch_password: self.elasticsearch_password,
            silent: self.silent,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing. The guard must outlive main for the non-blocking
    // file writer to flush.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    let _guard = match &cli.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            fmt().with_env_filter(filter).with_target(true).init();
            None
        }
    };

    let mut cfg = cli.into_config();
    cfg.validate()?;

    tracing::info!(mode = ?cfg.mode, queries = cfg.queries.len(), "starting shui");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let agent = Agent::new(cfg)?;

    // SIGINT requests a clean quit through the control channel.
    let control = agent.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            let _ = control.send(Control::Quit).await;
        }
    });

    agent.run().await
}
