use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::record::{Record, Token};
use crate::store::Store;

/// Padding for table cell entries.
const TABLE_PADDING: usize = 2;
/// Maximum width of a graph bar in characters.
const GRAPH_WIDTH: usize = 60;

/// How records are presented to the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DisplayMode {
    /// Full record dump, one per line.
    Raw,
    /// The raw value only, streamed as produced.
    Stream,
    /// Tokens as padded table cells.
    Table,
    /// A horizontal bar per record, driven by one filtered value.
    Graph,
}

impl DisplayMode {
    /// The next mode in the display ring.
    pub fn next(self) -> Self {
        match self {
            Self::Raw => Self::Stream,
            Self::Stream => Self::Table,
            Self::Table => Self::Graph,
            Self::Graph => Self::Raw,
        }
    }
}

/// Formats records for one display mode.
pub struct View {
    mode: DisplayMode,
}

impl View {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode }
    }

    /// Header line preceding the records, for modes that have one.
    pub fn header(&self, labels: &[String]) -> Option<String> {
        match self.mode {
            DisplayMode::Table | DisplayMode::Graph if !labels.is_empty() => {
                Some(pad_cells(labels))
            }
            _ => None,
        }
    }

    /// One output line per record.
    pub fn render(&self, record: &Record) -> String {
        match self.mode {
            DisplayMode::Raw => format!(
                "time: {}, value: {:?}, values: {:?}",
                record.time, record.raw, record.tokens,
            ),
            DisplayMode::Stream => record.raw.clone(),
            DisplayMode::Table => {
                let cells: Vec<String> = record.tokens.iter().map(ToString::to_string).collect();
                pad_cells(&cells)
            }
            DisplayMode::Graph => graph_row(record.tokens.first()),
        }
    }
}

fn pad_cells(cells: &[String]) -> String {
    let pad = " ".repeat(TABLE_PADDING);
    cells
        .iter()
        .map(|c| format!("{pad}{c}{pad}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Renders one bar row from the first (filtered) token. Non-numeric values
/// produce an empty bar annotated with the value itself.
fn graph_row(token: Option<&Token>) -> String {
    let Some(token) = token else {
        return String::new();
    };

    match token.as_f64() {
        Some(v) => {
            let width = (v.abs().min(GRAPH_WIDTH as f64)) as usize;
            format!("{v:>10} {}", "*".repeat(width))
        }
        None => format!("{token:>10} "),
    }
}

/// Drains records for one key and writes rendered lines to stdout until the
/// interrupt fires. Sends one message on `ready` before the first read so
/// the supervisor can release producers.
///
/// The loop selects over interrupt, pause, and ready-to-read. The pause
/// channel follows the two-edge protocol: one message parks reads while the
/// cursor stays live, a second resumes them, and the interrupt wins in
/// either state. On interrupt the consumer returns its pause receiver
/// without touching the cursor, so a successor view attached to the same
/// channel resumes cleanly.
pub async fn run_consumer(
    store: Arc<Store>,
    key: String,
    mode: DisplayMode,
    filters: Vec<String>,
    interrupt: CancellationToken,
    mut pause: mpsc::Receiver<()>,
    ready: mpsc::Sender<()>,
) -> mpsc::Receiver<()> {
    let view = View::new(mode);
    let mut cursor = store.new_reader_index(&key);

    if let Some(header) = view.header(&store.get_labels(&key, &filters)) {
        println!("{header}");
    }

    let _ = ready.send(()).await;

    // A closed pause channel counts as not paused; stop selecting on it.
    let mut pause_open = true;

    loop {
        tokio::select! {
            _ = interrupt.cancelled() => {
                debug!(query = %key, "consumer interrupted");
                return pause;
            }

            edge = pause.recv(), if pause_open => match edge {
                Some(()) => {
                    debug!(query = %key, "consumer paused");
                    tokio::select! {
                        _ = interrupt.cancelled() => {
                            debug!(query = %key, "consumer interrupted");
                            return pause;
                        }
                        resume = pause.recv() => {
                            if resume.is_none() {
                                pause_open = false;
                            }
                            debug!(query = %key, "consumer resumed");
                        }
                    }
                }
                None => pause_open = false,
            },

            next = store.next(&key, &filters, &mut cursor, &interrupt) => match next {
                Some(record) => println!("{}", view.render(&record)),
                None => {
                    debug!(query = %key, "consumer interrupted");
                    return pause;
                }
            },
        }
    }
}
