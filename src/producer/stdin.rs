use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;

/// Reads one line per tick from a line-oriented source, normally standard
/// input. Returns end-of-stream at EOF, which ends the producer loop even
/// when the attempt budget is not exhausted.
pub struct LineReader {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl LineReader {
    /// Reads from the process's standard input.
    pub fn stdin() -> Self {
        Self::from_reader(Box::new(tokio::io::stdin()))
    }

    /// Reads from an arbitrary source; used to drive the reader from
    /// in-memory data in tests.
    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    pub async fn execute(&mut self) -> Result<Option<String>> {
        debug!("reading line input");

        self.lines
            .next_line()
            .await
            .context("reading line input")
    }
}
