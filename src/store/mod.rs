pub mod cursor;
pub mod persist;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::record::{Record, Token};
use crate::sink::Sink;

pub use cursor::ReaderIndex;
pub use persist::Persister;

/// Capacity of the per-series notification channel. The channel is a
/// wake-up, not a delivery medium: a consumer that lags past this many
/// records recovers through its cursor.
const NOTIFY_CAPACITY: usize = 128;

/// The append-only log of records plus positional labels for one producer.
pub struct Series {
    pub labels: Vec<String>,
    pub records: Vec<Record>,
    notify: broadcast::Sender<Record>,
}

impl Default for Series {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            labels: Vec::new(),
            records: Vec::new(),
            notify,
        }
    }
}

impl Series {
    /// Rebuilds a series from its plain parts, with a fresh notification
    /// channel.
    pub(crate) fn from_parts(labels: Vec<String>, records: Vec<Record>) -> Self {
        Self {
            labels,
            records,
            ..Default::default()
        }
    }
}

/// Plain serializable view of a series, used by the persistence snapshot and
/// the remote query surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesData {
    pub labels: Vec<String>,
    pub records: Vec<Record>,
}

/// Per-producer time-ordered record logs with lossy broadcast to consumers,
/// pluggable external sinks, and optional full-snapshot persistence.
///
/// Each key is single-writer (the owning producer loop); readers of
/// different keys do not contend.
pub struct Store {
    series: DashMap<String, Series>,
    sinks: Vec<Sink>,
    persister: Option<Persister>,
}

impl Store {
    /// Creates an in-memory store with no attached sinks.
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            sinks: Vec::new(),
            persister: None,
        }
    }

    /// Creates a store backed by an on-disk snapshot, loading any existing
    /// document first.
    pub fn with_persistence(persister: Persister) -> Result<Self> {
        let store = Self::new();

        for (key, series) in persister.load()? {
            store.series.insert(key, series);
        }

        debug!(path = %persister.path().display(), "storage snapshot loaded");

        Ok(Self {
            persister: Some(persister),
            ..store
        })
    }

    /// Attaches an external sink. Sinks observe every successful append, in
    /// attachment order.
    pub fn add_sink(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    /// Starts every attached sink. A sink that fails to start is an
    /// unrecoverable setup error.
    pub async fn start_sinks(&self, cancel: CancellationToken) -> Result<()> {
        use anyhow::Context;

        for sink in &self.sinks {
            sink.start(cancel.clone())
                .await
                .with_context(|| format!("starting {} sink", sink.name()))?;
        }

        Ok(())
    }

    /// Appends a record for `key`, creating the series if absent.
    ///
    /// The record is stamped with the current wall-clock time, published to
    /// the series' notification channel (lossy: a full channel drops the
    /// wake-up silently), optionally snapshotted to disk, and handed to
    /// every attached sink. Persistence and sink errors are returned to the
    /// caller but never roll back the append; every sink is invoked even
    /// when an earlier one fails.
    pub async fn put(&self, key: &str, raw: &str, persist: bool, tokens: Vec<Token>) -> Result<Record> {
        let record = Record::new(raw, tokens);

        // Guard scope: the entry lock is released before any await point.
        let labels = {
            let mut series = self.series.entry(key.to_string()).or_default();
            series.records.push(record.clone());

            // A send error only means no receiver is currently subscribed;
            // the log remains the source of truth either way.
            let _ = series.notify.send(record.clone());

            series.labels.clone()
        };

        let mut errors = Vec::new();

        if persist {
            if let Some(persister) = &self.persister {
                if let Err(e) = persister.snapshot(&self.series) {
                    warn!(key, error = %e, "storage snapshot failed");
                    errors.push(format!("persistence: {e:#}"));
                }
            }
        }

        for sink in &self.sinks {
            if let Err(e) = sink.put(key, &labels, &record).await {
                warn!(key, sink = sink.name(), error = %e, "sink put failed");
                errors.push(format!("{}: {e:#}", sink.name()));
            }
        }

        if errors.is_empty() {
            Ok(record)
        } else {
            Err(anyhow!("put for {key:?} partially failed: {}", errors.join("; ")))
        }
    }

    /// Assigns the labels vector for `key`, creating the series if absent.
    /// Repeated calls overwrite.
    pub fn put_labels(&self, key: &str, labels: Vec<String>) {
        self.series.entry(key.to_string()).or_default().labels = labels;
    }

    /// Returns the first record whose time equals `t` exactly, or the empty
    /// record.
    pub fn get(&self, key: &str, t: DateTime<Utc>) -> Record {
        let Some(series) = self.series.get(key) else {
            return Record::empty();
        };

        series
            .records
            .iter()
            .find(|r| r.time == t)
            .cloned()
            .unwrap_or_else(Record::empty)
    }

    /// Returns records with `t0 <= time <= t1`, scanning in order and
    /// stopping once a record's time exceeds `t1`.
    pub fn get_range(&self, key: &str, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Vec<Record> {
        let Some(series) = self.series.get(key) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for record in &series.records {
            if record.time < t0 {
                continue;
            }
            if record.time > t1 {
                break;
            }
            found.push(record.clone());
        }

        found
    }

    /// Returns `records[0..=pos]` (inclusive, for the re-read-last idiom),
    /// projected through `filters` when non-empty. Does not mutate any
    /// cursor.
    pub fn get_to_index(&self, key: &str, filters: &[String], pos: usize) -> Vec<Record> {
        let Some(series) = self.series.get(key) else {
            return Vec::new();
        };

        let indexes = resolve_filters(&series.labels, filters);
        let end = (pos + 1).min(series.records.len());

        series.records[..end]
            .iter()
            .map(|r| project(r, indexes.as_deref()))
            .collect()
    }

    /// Returns the position of `label` in the series' labels vector, or -1.
    pub fn get_value_index(&self, key: &str, label: &str) -> i64 {
        let Some(series) = self.series.get(key) else {
            return -1;
        };

        series
            .labels
            .iter()
            .position(|l| l == label)
            .map_or(-1, |i| i as i64)
    }

    /// Returns the series' labels, restricted to the subset named by
    /// `filters` (in filter order) when non-empty.
    pub fn get_labels(&self, key: &str, filters: &[String]) -> Vec<String> {
        let Some(series) = self.series.get(key) else {
            return Vec::new();
        };

        match resolve_filters(&series.labels, filters) {
            None => series.labels.clone(),
            Some(indexes) => project_slice(&series.labels, &indexes),
        }
    }

    /// Returns the full series for `key` as a plain data view, exactly equal
    /// to the in-memory log at call time.
    pub fn get_all(&self, key: &str) -> Option<SeriesData> {
        self.series.get(key).map(|series| SeriesData {
            labels: series.labels.clone(),
            records: series.records.clone(),
        })
    }

    /// Constructs a consumer cursor positioned at the current end of the
    /// log, with a live subscription to the series' notification channel. A
    /// late-joining consumer therefore does not replay history by default.
    pub fn new_reader_index(&self, key: &str) -> ReaderIndex {
        let series = self.series.entry(key.to_string()).or_default();
        ReaderIndex::new(series.records.len(), series.notify.subscribe())
    }

    /// Blocks until a wake-up arrives for `key`, then returns the log
    /// record at the cursor position (projected through `filters`) and
    /// advances the cursor by one.
    ///
    /// The channel payload is never returned directly: the channel is a
    /// wake-up, not a delivery medium. Reading the log at the cursor keeps
    /// delivery in log order even after the subscription has lagged, and
    /// keeps the decrement-then-get-to-index idiom exact.
    ///
    /// Returns `None` without touching the cursor when `cancel` fires, so a
    /// later consumer attached to the same cursor resumes cleanly.
    pub async fn next(
        &self,
        key: &str,
        filters: &[String],
        cursor: &mut ReaderIndex,
        cancel: &CancellationToken,
    ) -> Option<Record> {
        let indexes = self
            .series
            .get(key)
            .and_then(|series| resolve_filters(&series.labels, filters));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                received = cursor.rx.recv() => match received {
                    Ok(_) => {
                        // A wake-up with nothing at the cursor position
                        // (cursor set past the end) keeps waiting.
                        if let Some(record) = self.record_at(key, cursor.pos()) {
                            cursor.inc();
                            return Some(project(&record, indexes.as_deref()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(key, missed, "consumer lagged, continuing from log");
                        if let Some(record) = self.record_at(key, cursor.pos()) {
                            cursor.inc();
                            return Some(project(&record, indexes.as_deref()));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Non-blocking variant of `next`: returns the empty record and leaves
    /// the cursor untouched when nothing is pending. Like `next`, the
    /// channel result is only a wake-up; the returned record comes from the
    /// log at the cursor position.
    pub fn next_or_empty(&self, key: &str, cursor: &mut ReaderIndex) -> Record {
        loop {
            match cursor.rx.try_recv() {
                Ok(_) => {
                    if let Some(record) = self.record_at(key, cursor.pos()) {
                        cursor.inc();
                        return record;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    debug!(key, missed, "consumer lagged, continuing from log");
                    if let Some(record) = self.record_at(key, cursor.pos()) {
                        cursor.inc();
                        return record;
                    }
                }
                Err(_) => return Record::empty(),
            }
        }
    }

    fn record_at(&self, key: &str, pos: usize) -> Option<Record> {
        self.series.get(key)?.records.get(pos).cloned()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves filter names to label positions, skipping names that are
/// absent. `None` means no filtering was requested; `Some(vec![])` means
/// every requested label was absent, which projects to nothing.
fn resolve_filters(labels: &[String], filters: &[String]) -> Option<Vec<usize>> {
    if filters.is_empty() {
        return None;
    }

    Some(
        filters
            .iter()
            .filter_map(|f| labels.iter().position(|l| l == f))
            .collect(),
    )
}

/// Strict positional projection: unlike `filter_slice`, an empty index list
/// projects to nothing.
fn project_slice<T: Clone>(items: &[T], indexes: &[usize]) -> Vec<T> {
    indexes
        .iter()
        .filter_map(|&i| items.get(i).cloned())
        .collect()
}

/// Projects a record's tokens through the resolved filter positions; time
/// and raw are kept as-is.
fn project(record: &Record, indexes: Option<&[usize]>) -> Record {
    let Some(indexes) = indexes else {
        return record.clone();
    };

    Record {
        time: record.time,
        raw: record.raw.clone(),
        tokens: project_slice(&record.tokens, indexes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_appends_in_order() {
        let store = Store::new();
        for i in 0..5 {
            store
                .put("q", &i.to_string(), false, vec![Token::Int(i)])
                .await
                .unwrap();
        }

        let all = store.get_all("q").unwrap();
        assert_eq!(all.records.len(), 5);
        for window in all.records.windows(2) {
            assert!(window[0].time <= window[1].time);
        }
    }

    #[tokio::test]
    async fn test_get_exact_timestamp() {
        let store = Store::new();
        let put = store.put("q", "1", false, vec![Token::Int(1)]).await.unwrap();

        let found = store.get("q", put.time);
        assert_eq!(found, put);

        let missed = store.get("q", DateTime::UNIX_EPOCH);
        assert!(missed.is_empty());
    }

    #[tokio::test]
    async fn test_get_on_missing_key_is_empty() {
        let store = Store::new();
        assert!(store.get("nope", Utc::now()).is_empty());
        assert!(store.get_range("nope", DateTime::UNIX_EPOCH, Utc::now()).is_empty());
        assert!(store.get_to_index("nope", &[], 10).is_empty());
        assert_eq!(store.get_value_index("nope", "x"), -1);
    }

    #[tokio::test]
    async fn test_get_range_bounds_inclusive() {
        let store = Store::new();
        let mut times = Vec::new();
        for i in 0..4 {
            let r = store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
            times.push(r.time);
        }

        let found = store.get_range("q", times[1], times[2]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].time, times[1]);
        assert_eq!(found[1].time, times[2]);
    }

    #[tokio::test]
    async fn test_get_to_index_is_inclusive_of_cursor() {
        let store = Store::new();
        for i in 0..3 {
            store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
        }

        let found = store.get_to_index("q", &[], 1);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].raw, "1");

        // A cursor at the end of the log clamps to the full log.
        let found = store.get_to_index("q", &[], 3);
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_value_index_and_labels_projection() {
        let store = Store::new();
        store.put_labels("q", labels(&["a", "b", "c"]));

        assert_eq!(store.get_value_index("q", "b"), 1);
        assert_eq!(store.get_value_index("q", "zzz"), -1);

        assert_eq!(store.get_labels("q", &labels(&["c", "a"])), labels(&["c", "a"]));
        assert_eq!(store.get_labels("q", &[]), labels(&["a", "b", "c"]));
        // Absent filter names are tolerated and skipped.
        assert_eq!(store.get_labels("q", &labels(&["zzz", "b"])), labels(&["b"]));
    }

    #[tokio::test]
    async fn test_filtered_get_to_index_projects_tokens() {
        let store = Store::new();
        store.put_labels("q", labels(&["a", "b"]));
        store
            .put("q", "1.5 foo", false, vec![Token::Float(1.5), Token::Text("foo".into())])
            .await
            .unwrap();

        let found = store.get_to_index("q", &labels(&["b"]), 0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tokens, vec![Token::Text("foo".to_string())]);
    }

    #[tokio::test]
    async fn test_next_advances_cursor_by_one() {
        let store = Store::new();
        let mut cursor = store.new_reader_index("q");
        assert_eq!(cursor.pos(), 0);

        store.put("q", "1", false, vec![Token::Int(1)]).await.unwrap();

        let cancel = CancellationToken::new();
        let record = store.next("q", &[], &mut cursor, &cancel).await.unwrap();
        assert_eq!(record.raw, "1");
        assert_eq!(cursor.pos(), 1);
    }

    #[tokio::test]
    async fn test_next_on_cancel_leaves_cursor_untouched() {
        let store = Store::new();
        store.put("q", "1", false, vec![Token::Int(1)]).await.unwrap();

        let mut cursor = store.new_reader_index("q");
        let before = cursor.pos();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(store.next("q", &[], &mut cursor, &cancel).await.is_none());
        assert_eq!(cursor.pos(), before);
    }

    #[tokio::test]
    async fn test_next_or_empty_at_end_of_log() {
        let store = Store::new();
        let mut cursor = store.new_reader_index("q");

        let record = store.next_or_empty("q", &mut cursor);
        assert!(record.is_empty());
        assert_eq!(cursor.pos(), 0);

        store.put("q", "1", false, vec![Token::Int(1)]).await.unwrap();
        let record = store.next_or_empty("q", &mut cursor);
        assert_eq!(record.raw, "1");
        assert_eq!(cursor.pos(), 1);
    }

    #[tokio::test]
    async fn test_put_succeeds_when_channel_is_full() {
        let store = Store::new();
        // Subscribe but never drain, so the channel buffer fills.
        let _cursor = store.new_reader_index("q");

        for i in 0..(NOTIFY_CAPACITY as i64 + 40) {
            store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
        }

        // Every append landed regardless of the saturated channel.
        let all = store.get_all("q").unwrap();
        assert_eq!(all.records.len(), NOTIFY_CAPACITY + 40);
    }

    #[tokio::test]
    async fn test_lagged_consumer_resyncs_from_log() {
        let store = Store::new();
        let mut cursor = store.new_reader_index("q");

        for i in 0..(NOTIFY_CAPACITY as i64 + 10) {
            store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
        }

        // The subscription lagged, but the first read comes back from the
        // log at the cursor position, so nothing is skipped.
        let record = store.next_or_empty("q", &mut cursor);
        assert_eq!(record.raw, "0");
        assert_eq!(cursor.pos(), 1);
    }

    #[tokio::test]
    async fn test_lagged_consumer_stays_in_log_order_across_reads() {
        let store = Store::new();
        let cancel = CancellationToken::new();
        let mut cursor = store.new_reader_index("q");

        for i in 0..(NOTIFY_CAPACITY as i64 + 40) {
            store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
        }

        // Every read after the lag still follows the log exactly: the
        // channel's internal position has moved far ahead, but only the
        // cursor decides what is delivered.
        for expected in 0..NOTIFY_CAPACITY {
            let record = store.next_or_empty("q", &mut cursor);
            assert_eq!(record.raw, expected.to_string());
            assert_eq!(cursor.pos(), expected + 1);
        }

        // The blocking variant continues from the same position.
        let record = store.next("q", &[], &mut cursor, &cancel).await.unwrap();
        assert_eq!(record.raw, NOTIFY_CAPACITY.to_string());
        assert_eq!(cursor.pos(), NOTIFY_CAPACITY + 1);

        // The decrement idiom remains exact after a lag: the last read was
        // records[pos - 1].
        cursor.dec();
        let history = store.get_to_index("q", &[], cursor.pos());
        assert_eq!(history.len(), NOTIFY_CAPACITY + 1);
        assert_eq!(history.last().unwrap().raw, record.raw);
    }

    #[tokio::test]
    async fn test_two_cursors_are_independent() {
        let store = Store::new();
        let cancel = CancellationToken::new();

        let mut early = store.new_reader_index("q");

        for i in 0..3 {
            store.put("q", &i.to_string(), false, vec![Token::Int(i)]).await.unwrap();
        }

        let mut late = store.new_reader_index("q");
        assert_eq!(late.pos(), 3);

        // The early consumer drains everything through next.
        for expected in ["0", "1", "2"] {
            let r = store.next("q", &[], &mut early, &cancel).await.unwrap();
            assert_eq!(r.raw, expected);
        }

        // The late consumer only observes subsequent appends...
        store.put("q", "3", false, vec![Token::Int(3)]).await.unwrap();
        let r = store.next("q", &[], &mut late, &cancel).await.unwrap();
        assert_eq!(r.raw, "3");

        // ...but can still reach history via decrement + get_to_index.
        late.dec();
        let history = store.get_to_index("q", &[], late.pos());
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].raw, "0");
    }
}
