use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::store::Series;

/// Directory under the user cache dir holding the snapshot.
const STORAGE_DIR: &str = "shui";
/// Snapshot file name.
const STORAGE_FILE: &str = "storage.json";

/// Serialized form of one series. Labels are included so a reload restores
/// positional names along with the records.
#[derive(Serialize, Deserialize)]
struct SeriesSnapshot {
    labels: Vec<String>,
    records: Vec<Record>,
}

/// Writes full-store snapshots over a single on-disk JSON document.
///
/// Writers are serialised by a mutex; each write truncates and rewrites the
/// file from offset zero, so the document on disk always reflects one
/// complete snapshot.
pub struct Persister {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Persister {
    /// Creates a persister at an explicit path, creating parent directories
    /// as needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            create_storage_dir(parent)?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Creates a persister at `<user-cache>/shui/storage.json`.
    pub fn at_default_path() -> Result<Self> {
        let cache = dirs::cache_dir().context("locating user cache directory")?;
        Self::new(cache.join(STORAGE_DIR).join(STORAGE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialises the entire series map and writes it over the existing
    /// file. Blocks other writers for the duration of serialise + write.
    pub fn snapshot(&self, series: &DashMap<String, Series>) -> Result<()> {
        let _guard = self.write_lock.lock();

        // BTreeMap keeps the document stable across writes.
        let mut doc = BTreeMap::new();
        for entry in series.iter() {
            doc.insert(
                entry.key().clone(),
                SeriesSnapshot {
                    labels: entry.labels.clone(),
                    records: entry.records.clone(),
                },
            );
        }

        let data = serde_json::to_vec(&doc).context("serialising storage snapshot")?;

        fs::write(&self.path, data)
            .with_context(|| format!("writing snapshot to {}", self.path.display()))
    }

    /// Loads the snapshot, if present and non-empty, and rebuilds the series
    /// map. A missing or empty file yields an empty map.
    pub fn load(&self) -> Result<HashMap<String, Series>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        if data.is_empty() {
            return Ok(HashMap::new());
        }

        let doc: BTreeMap<String, SeriesSnapshot> = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        let mut result = HashMap::with_capacity(doc.len());
        for (key, snapshot) in doc {
            result.insert(key, Series::from_parts(snapshot.labels, snapshot.records));
        }

        Ok(result)
    }
}

/// Creates the storage directory with mode 0770.
#[cfg(unix)]
fn create_storage_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if path.exists() {
        return Ok(());
    }

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o770)
        .create(path)
        .with_context(|| format!("creating {}", path.display()))
}

#[cfg(not(unix))]
fn create_storage_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Token;

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path().join("storage.json")).unwrap();
        assert!(persister.load().unwrap().is_empty());
    }

    #[test]
    fn test_load_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, b"").unwrap();

        let persister = Persister::new(path).unwrap();
        assert!(persister.load().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_preserves_labels_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let series = DashMap::new();
        series.insert(
            "q".to_string(),
            Series::from_parts(
                vec!["a".to_string(), "b".to_string()],
                vec![Record::new(
                    "1 foo",
                    vec![Token::Int(1), Token::Text("foo".to_string())],
                )],
            ),
        );

        let persister = Persister::new(&path).unwrap();
        persister.snapshot(&series).unwrap();

        let reloaded = persister.load().unwrap();
        let q = reloaded.get("q").unwrap();
        assert_eq!(q.labels, vec!["a", "b"]);
        assert_eq!(q.records.len(), 1);
        assert_eq!(q.records[0].raw, "1 foo");
        assert_eq!(
            q.records[0].tokens,
            vec![Token::Int(1), Token::Text("foo".to_string())],
        );
    }

    #[test]
    fn test_snapshot_overwrites_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let series = DashMap::new();
        let records = (0..5)
            .map(|i| Record::new(i.to_string(), vec![Token::Int(i)]))
            .collect();
        series.insert("q".to_string(), Series::from_parts(Vec::new(), records));

        let persister = Persister::new(&path).unwrap();
        persister.snapshot(&series).unwrap();
        let first_len = fs::metadata(&path).unwrap().len();

        series.get_mut("q").unwrap().records.truncate(1);
        persister.snapshot(&series).unwrap();
        let second_len = fs::metadata(&path).unwrap().len();

        // The document is rewritten from offset zero, not appended.
        assert!(second_len < first_len);

        let reloaded = persister.load().unwrap();
        assert_eq!(reloaded.get("q").unwrap().records.len(), 1);
    }
}
