//! shui executes user-supplied producers (shell commands, process-stat
//! samplers, or standard-input lines) on a schedule, tokenizes their output
//! into typed records, and appends each record to a per-producer time-series
//! log. Live consumers observe appends through a lossy per-series broadcast
//! channel and recover anything they missed through per-consumer replay
//! cursors. Records optionally flow through a small expression language, an
//! on-disk snapshot, and pluggable external sinks (Prometheus pull and push,
//! a document index).

pub mod agent;
pub mod config;
pub mod display;
pub mod expr;
pub mod producer;
pub mod record;
pub mod server;
pub mod sink;
pub mod store;

pub use agent::{Agent, Control};
pub use config::{Config, Mode};
pub use display::DisplayMode;
pub use expr::ExprPipeline;
pub use record::{tokenize, Record, Token};
pub use store::{Persister, ReaderIndex, SeriesData, Store};
