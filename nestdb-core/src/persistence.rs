// src/persistence.rs
// Append-only datafile: new state is appended, compaction rewrites, loading replays

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::document::{
    deserialize, random_token, serialize, Document, DELETED_KEY, INDEX_CREATED_KEY, INDEX_REMOVED_KEY,
};
use crate::error::{NestDbError, Result};
use crate::index::{Index, IndexDefinition};
use crate::storage::Storage;

/// Default share of corrupt lines tolerated when loading
pub const DEFAULT_CORRUPT_ALERT_THRESHOLD: f64 = 0.1;

/// Transform applied to every line on its way to (or from) the datafile
pub type SerializationHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Called after each successful compaction
pub type CompactionListener = Arc<dyn Fn(&CompactionStats) + Send + Sync>;

/// Compaction statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub documents_kept: usize,
    pub indexes_kept: usize,
    pub bytes_written: usize,
}

/// What replaying a datafile produced
#[derive(Debug, Default)]
pub struct LoadedState {
    pub documents: Vec<Document>,
    pub indexes: Vec<IndexDefinition>,
    pub corrupt_items: usize,
    pub total_lines: usize,
}

pub struct Persistence {
    storage: Arc<dyn Storage>,
    filename: Option<PathBuf>,
    corrupt_alert_threshold: f64,
    after_serialization: Option<SerializationHook>,
    before_deserialization: Option<SerializationHook>,
    listeners: Arc<Mutex<Vec<CompactionListener>>>,
}

/// Both hooks or neither, and `before(after(s)) == s` on random strings
fn check_hooks(after: Option<&SerializationHook>, before: Option<&SerializationHook>) -> Result<()> {
    match (after, before) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(NestDbError::InvalidOptions(
            "Serialization hook defined but deserialization hook undefined, cautiously refusing to start to prevent dataloss"
                .to_string(),
        )),
        (None, Some(_)) => Err(NestDbError::InvalidOptions(
            "Serialization hook undefined but deserialization hook defined, cautiously refusing to start to prevent dataloss"
                .to_string(),
        )),
        (Some(after), Some(before)) => {
            for len in 1..30 {
                for _ in 0..10 {
                    let sample = random_token(len);
                    if before(&after(&sample)) != sample {
                        return Err(NestDbError::InvalidOptions(
                            "beforeDeserialization is not the reverse of afterSerialization, cautiously refusing to start to prevent dataloss"
                                .to_string(),
                        ));
                    }
                }
            }
            Ok(())
        }
    }
}

impl Persistence {
    /// `filename: None` keeps everything in memory
    pub fn new(
        storage: Arc<dyn Storage>,
        filename: Option<PathBuf>,
        corrupt_alert_threshold: f64,
        after_serialization: Option<SerializationHook>,
        before_deserialization: Option<SerializationHook>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&corrupt_alert_threshold) {
            return Err(NestDbError::InvalidOptions(format!(
                "corrupt_alert_threshold must be between 0 and 1, got {}",
                corrupt_alert_threshold
            )));
        }
        check_hooks(after_serialization.as_ref(), before_deserialization.as_ref())?;

        Ok(Persistence {
            storage,
            filename,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
            listeners: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn in_memory_only(&self) -> bool {
        self.filename.is_none()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Shared list of compaction listeners
    pub fn listeners(&self) -> Arc<Mutex<Vec<CompactionListener>>> {
        Arc::clone(&self.listeners)
    }

    fn encode(&self, doc: &Document) -> Result<String> {
        let line = serialize(doc)?;
        Ok(match &self.after_serialization {
            Some(hook) => hook(&line),
            None => line,
        })
    }

    fn decode(&self, line: &str) -> Result<Document> {
        match &self.before_deserialization {
            Some(hook) => deserialize(&hook(line)),
            None => deserialize(line),
        }
    }

    /// Append one line per document (or tombstone / index marker)
    pub fn persist_new_state(&self, docs: &[Document]) -> Result<()> {
        let Some(filename) = &self.filename else {
            return Ok(());
        };
        if docs.is_empty() {
            return Ok(());
        }

        let mut data = String::new();
        for doc in docs {
            data.push_str(&self.encode(doc)?);
            data.push('\n');
        }
        self.storage.append(filename, data.as_bytes())?;
        debug!("appended {} record(s) to {}", docs.len(), filename.display());
        Ok(())
    }

    /// Rewrite the datafile as one line per live document plus one line per
    /// secondary index, then notify the listeners
    pub fn persist_cached_database(&self, indexes: &AHashMap<String, Index>) -> Result<CompactionStats> {
        let Some(filename) = &self.filename else {
            return Ok(CompactionStats::default());
        };

        let mut lines = Vec::new();
        let mut stats = CompactionStats::default();

        if let Some(primary) = indexes.get("_id") {
            for doc in primary.get_all() {
                lines.push(self.encode(&doc)?);
                stats.documents_kept += 1;
            }
        }

        let mut names: Vec<&String> = indexes.keys().filter(|name| *name != "_id").collect();
        names.sort();
        for name in names {
            let mut marker = Document::new();
            marker.insert(INDEX_CREATED_KEY, serde_json::to_value(indexes[name].definition())?);
            lines.push(self.encode(&marker)?);
            stats.indexes_kept += 1;
        }

        stats.bytes_written = lines.iter().map(|l| l.len() + 1).sum();
        self.storage.crash_safe_write_lines(filename, &lines)?;
        info!(
            "compacted {}: {} document(s), {} index(es)",
            filename.display(),
            stats.documents_kept,
            stats.indexes_kept
        );

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&stats);
        }
        Ok(stats)
    }

    /// Create the parent directory and recover from an interrupted rewrite
    pub fn prepare_datafile(&self) -> Result<()> {
        let Some(filename) = &self.filename else {
            return Ok(());
        };
        self.storage.ensure_parent_dir(filename)?;
        self.storage.ensure_datafile_integrity(filename)
    }

    /// Replay the datafile
    pub fn read_datafile(&self) -> Result<LoadedState> {
        let Some(filename) = &self.filename else {
            return Ok(LoadedState::default());
        };
        let reader = self.storage.read_lines(filename)?;
        self.read_state(reader)
    }

    /// Replay `\n`-separated records: later records win, tombstones delete,
    /// index markers add or drop definitions. Blank lines are ignored;
    /// unreadable lines are counted and fail the load past the threshold.
    pub fn read_state<R: BufRead>(&self, mut reader: R) -> Result<LoadedState> {
        let mut by_id: AHashMap<String, Document> = AHashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut indexes: AHashMap<String, IndexDefinition> = AHashMap::new();
        let mut index_order: Vec<String> = Vec::new();
        let mut corrupt_items = 0;
        let mut total_lines = 0;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            total_lines += 1;

            let doc = match std::str::from_utf8(&buf)
                .map_err(|e| NestDbError::InvalidDocument(e.to_string()))
                .and_then(|line| self.decode(line))
            {
                Ok(doc) => doc,
                Err(e) => {
                    corrupt_items += 1;
                    warn!("skipping corrupt line {}: {}", total_lines, e);
                    continue;
                }
            };

            if let Some(id) = doc.id() {
                let key = serde_json::to_string(id)?;
                if doc.get(DELETED_KEY) == Some(&Value::Bool(true)) {
                    by_id.remove(&key);
                } else {
                    if !by_id.contains_key(&key) {
                        order.push(key.clone());
                    }
                    by_id.insert(key, doc);
                }
            } else if let Some(created) = doc.get(INDEX_CREATED_KEY) {
                match serde_json::from_value::<IndexDefinition>(created.clone()) {
                    Ok(definition) => {
                        if !indexes.contains_key(&definition.field_name) {
                            index_order.push(definition.field_name.clone());
                        }
                        indexes.insert(definition.field_name.clone(), definition);
                    }
                    Err(e) => {
                        corrupt_items += 1;
                        warn!("skipping invalid index marker on line {}: {}", total_lines, e);
                    }
                }
            } else if let Some(Value::String(removed)) = doc.get(INDEX_REMOVED_KEY) {
                indexes.remove(removed);
            }
        }

        if total_lines > 0 {
            let corruption_rate = corrupt_items as f64 / total_lines as f64;
            if corruption_rate > self.corrupt_alert_threshold {
                return Err(NestDbError::CorruptionThresholdExceeded {
                    corruption_rate,
                    corrupt_items,
                    total_lines,
                    threshold: self.corrupt_alert_threshold,
                });
            }
        }

        let documents = order.iter().filter_map(|key| by_id.remove(key)).collect();
        let indexes = index_order.iter().filter_map(|name| indexes.remove(name)).collect();
        Ok(LoadedState {
            documents,
            indexes,
            corrupt_items,
            total_lines,
        })
    }

    /// Delete the datafile, if any
    pub fn drop_datafile(&self) -> Result<()> {
        let Some(filename) = &self.filename else {
            return Ok(());
        };
        if self.storage.exists(filename)? {
            self.storage.unlink(filename)?;
        }
        Ok(())
    }
}
