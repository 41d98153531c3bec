pub mod command;
pub mod profile;
pub mod stdin;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::expr::ExprPipeline;
use crate::record::{tokenize, Record};
use crate::store::Store;

pub use command::CommandExecutor;
pub use profile::{ProfileExecutor, PROFILE_LABELS};
pub use stdin::LineReader;

/// Synthetic producer key used when reading standard input; read mode has
/// exactly one producer.
pub const STDIN_KEY: &str = "stdin";

/// Executor variants. Each produces one raw string per tick; `None` signals
/// end-of-stream and terminates the producer loop early.
pub enum Executor {
    Command(CommandExecutor),
    Profile(ProfileExecutor),
    Line(LineReader),
}

impl Executor {
    pub async fn execute(&mut self, query: &str) -> Result<Option<String>> {
        match self {
            Self::Command(e) => e.execute(query).await,
            Self::Profile(e) => e.execute(query).await,
            Self::Line(e) => e.execute().await,
        }
    }
}

/// One configured producer: its unique key, executor, and expression chain.
pub struct Producer {
    pub key: String,
    pub executor: Executor,
    pub pipeline: ExprPipeline,
}

/// Runs one producer loop until its attempt budget is exhausted or the
/// executor signals end-of-stream.
///
/// `attempts < 0` means unbounded. Before each iteration the pause channel
/// is polled: one message parks the loop until a second message arrives
/// (both edges are explicit). Errors local to one tick are logged and the
/// loop proceeds. Completion is signalled on `done`.
pub async fn run_producer(
    store: Arc<Store>,
    mut producer: Producer,
    labels: Vec<String>,
    attempts: i64,
    delay: Duration,
    history: bool,
    mut pause: mpsc::Receiver<()>,
    done: mpsc::Sender<String>,
) {
    let key = producer.key.clone();
    let mut i: i64 = 0;

    loop {
        if attempts >= 0 && i >= attempts {
            break;
        }

        // Two-edge pause protocol: a pending message parks the loop until
        // the resume edge. A closed channel counts as not paused.
        match pause.try_recv() {
            Ok(()) => {
                debug!(query = %key, "producer paused");
                if pause.recv().await.is_some() {
                    debug!(query = %key, "producer resumed");
                }
            }
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {}
        }

        match producer.executor.execute(&key).await {
            Ok(Some(raw)) => {
                let raw = raw.trim();
                let record = producer
                    .pipeline
                    .apply(&labels, Record::new(raw, tokenize(raw)));

                if let Err(e) = store.put(&key, &record.raw, history, record.tokens).await {
                    warn!(query = %key, error = %e, "store put reported errors");
                }
            }
            Ok(None) => {
                debug!(query = %key, "producer reached end of stream");
                break;
            }
            Err(e) => {
                warn!(query = %key, error = %e, "producer tick failed");
            }
        }

        i += 1;

        // No delay after the final execution.
        if attempts < 0 || i < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    debug!(query = %key, "query done");
    let _ = done.send(key).await;
}
