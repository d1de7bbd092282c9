// src/datastore.rs
// Datastore: index registry, CRUD, TTL expiry, load/compaction orchestration

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use crossbeam::channel::{self, select, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::compare::StringComparator;
use crate::cursor::{Cursor, FindOptions};
use crate::document::{
    check_document, date_millis, deep_copy, new_id, now, Document, DELETED_KEY, INDEX_CREATED_KEY,
    INDEX_REMOVED_KEY,
};
use crate::error::{NestDbError, Result};
use crate::executor::{Executor, Pending};
use crate::index::{Index, IndexDefinition, IndexOptions};
use crate::modifier::{has_modifiers, modify};
use crate::persistence::{
    CompactionListener, CompactionStats, Persistence, SerializationHook, DEFAULT_CORRUPT_ALERT_THRESHOLD,
};
use crate::query::{IntoQuery, Query};
use crate::query_planner::QueryPlanner;
use crate::storage::{FileStorage, Storage};

/// Attempts at drawing an unused `_id` before giving up
const MAX_ID_ATTEMPTS: usize = 10;

/// Lower bound for the autocompaction interval
pub const MIN_AUTOCOMPACTION_INTERVAL: Duration = Duration::from_secs(5);

/// Datastore configuration
#[derive(Clone, Default)]
pub struct DatastoreOptions {
    /// Datafile path; `None` keeps the datastore in memory
    pub filename: Option<PathBuf>,
    pub in_memory_only: bool,
    /// Set `createdAt` / `updatedAt` automatically
    pub timestamp_data: bool,
    /// Load the datafile right away; operations issued meanwhile are buffered
    pub autoload: bool,
    /// Share of corrupt lines tolerated on load, 0.1 by default
    pub corrupt_alert_threshold: Option<f64>,
    /// String ordering used by sorts
    pub compare_strings: Option<StringComparator>,
    pub after_serialization: Option<SerializationHook>,
    pub before_deserialization: Option<SerializationHook>,
    /// Storage backend, `FileStorage` by default
    pub storage: Option<Arc<dyn Storage>>,
}

impl DatastoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn in_memory_only(mut self, in_memory_only: bool) -> Self {
        self.in_memory_only = in_memory_only;
        self
    }

    pub fn timestamp_data(mut self, timestamp_data: bool) -> Self {
        self.timestamp_data = timestamp_data;
        self
    }

    pub fn autoload(mut self, autoload: bool) -> Self {
        self.autoload = autoload;
        self
    }

    pub fn corrupt_alert_threshold(mut self, threshold: f64) -> Self {
        self.corrupt_alert_threshold = Some(threshold);
        self
    }

    pub fn compare_strings<F>(mut self, compare: F) -> Self
    where
        F: Fn(&str, &str) -> std::cmp::Ordering + Send + Sync + 'static,
    {
        self.compare_strings = Some(Arc::new(compare));
        self
    }

    pub fn after_serialization<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.after_serialization = Some(Arc::new(hook));
        self
    }

    pub fn before_deserialization<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.before_deserialization = Some(Arc::new(hook));
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Options for `update`
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Update every matching document instead of the first one
    pub multi: bool,
    /// Insert a document when nothing matches
    pub upsert: bool,
    pub return_updated_docs: bool,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn return_updated_docs(mut self, return_updated_docs: bool) -> Self {
        self.return_updated_docs = return_updated_docs;
        self
    }
}

/// Options for `remove`
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub multi: bool,
}

impl RemoveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }
}

/// Documents returned by an update
#[derive(Debug, Clone, PartialEq)]
pub enum AffectedDocuments {
    One(Document),
    Many(Vec<Document>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub num_affected: usize,
    /// Set when `return_updated_docs` was requested, and always for upserts
    pub affected_documents: Option<AffectedDocuments>,
    pub upsert: bool,
}

fn primary_index() -> Index {
    let mut definition = IndexDefinition::new("_id");
    definition.unique = true;
    Index::new(definition)
}

fn id_key(doc: &Document) -> String {
    doc.id().map(Value::to_string).unwrap_or_default()
}

/// State owned by the executor thread
pub(crate) struct Engine {
    indexes: AHashMap<String, Index>,
    ttl_indexes: AHashMap<String, f64>,
    persistence: Persistence,
    timestamp_data: bool,
    compare_strings: Option<StringComparator>,
    load_failure: Option<String>,
}

impl Engine {
    fn new(persistence: Persistence, timestamp_data: bool, compare_strings: Option<StringComparator>) -> Self {
        let mut indexes = AHashMap::new();
        indexes.insert("_id".to_string(), primary_index());
        Engine {
            indexes,
            ttl_indexes: AHashMap::new(),
            persistence,
            timestamp_data,
            compare_strings,
            load_failure: None,
        }
    }

    pub(crate) fn check_loaded(&self) -> Result<()> {
        match &self.load_failure {
            Some(msg) => Err(NestDbError::LoadFailed(msg.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn compare_strings(&self) -> Option<&StringComparator> {
        self.compare_strings.as_ref()
    }

    /// Index names, `_id` first then alphabetical
    fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.keys().cloned().collect();
        names.sort_by(|a, b| (a != "_id").cmp(&(b != "_id")).then_with(|| a.cmp(b)));
        names
    }

    fn all_documents(&self) -> Vec<Arc<Document>> {
        self.indexes.get("_id").map(Index::get_all).unwrap_or_default()
    }

    fn reset_indexes(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.reset(docs)?;
        }
        Ok(())
    }

    // ===== Index maintenance, all or nothing across indexes =====

    fn add_to_indexes(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        let names = self.index_names();
        for (i, name) in names.iter().enumerate() {
            let result = match self.indexes.get_mut(name) {
                Some(index) => index.insert_many(docs),
                None => Ok(()),
            };
            if let Err(e) = result {
                for done in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(done) {
                        index.remove_many(docs);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn remove_from_indexes(&mut self, docs: &[Arc<Document>]) {
        for index in self.indexes.values_mut() {
            index.remove_many(docs);
        }
    }

    fn update_indexes(&mut self, pairs: &[(Arc<Document>, Arc<Document>)]) -> Result<()> {
        let names = self.index_names();
        for (i, name) in names.iter().enumerate() {
            let result = match self.indexes.get_mut(name) {
                Some(index) => index.update_many(pairs),
                None => Ok(()),
            };
            if let Err(e) = result {
                for done in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(done) {
                        if let Err(revert) = index.revert_update_many(pairs) {
                            warn!("could not revert update on index '{}': {}", done, revert);
                        }
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    // ===== Candidates =====

    fn is_expired(&self, doc: &Document, now_ms: i64) -> bool {
        self.ttl_indexes.iter().any(|(field, seconds)| {
            doc.get_path(field)
                .and_then(|value| date_millis(&value))
                .map_or(false, |ms| now_ms as f64 > ms as f64 + seconds * 1000.0)
        })
    }

    /// Documents that may match `query`, found through at most one index.
    /// Unless `dont_expire` is set, documents past their TTL are removed here
    /// and left out.
    pub(crate) fn get_candidates(&mut self, query: &Query, dont_expire: bool) -> Result<Vec<Arc<Document>>> {
        let names = self.index_names();
        let plan = QueryPlanner::analyze_query(query, &names);

        let mut seen = AHashSet::new();
        let docs: Vec<Arc<Document>> = QueryPlanner::candidates(&plan, &self.indexes)
            .into_iter()
            .filter(|doc| seen.insert(id_key(doc)))
            .collect();

        if dont_expire || self.ttl_indexes.is_empty() {
            return Ok(docs);
        }

        let now_ms = Utc::now().timestamp_millis();
        let (expired, valid): (Vec<_>, Vec<_>) = docs.into_iter().partition(|doc| self.is_expired(doc, now_ms));
        if !expired.is_empty() {
            warn!("removing {} expired document(s)", expired.len());
            self.remove_documents(&expired)?;
        }
        Ok(valid)
    }

    // ===== Mutations =====

    fn create_new_id(&self) -> Result<String> {
        let primary = self.indexes.get("_id");
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = new_id();
            let taken = primary.map_or(false, |index| !index.get_matching(&Value::String(id.clone())).is_empty());
            if !taken {
                return Ok(id);
            }
        }
        Err(NestDbError::IdGenerationExhausted(MAX_ID_ATTEMPTS))
    }

    fn prepare_for_insertion(&self, value: &Value) -> Result<Document> {
        let mut doc = Document::from_value(deep_copy(value, false))?;
        if doc.id().is_none() {
            doc.insert("_id", Value::String(self.create_new_id()?));
        }
        if self.timestamp_data {
            let now = now();
            if !doc.contains("createdAt") {
                doc.insert("createdAt", now.clone());
            }
            if !doc.contains("updatedAt") {
                doc.insert("updatedAt", now);
            }
        }
        check_document(&doc)?;
        Ok(doc)
    }

    pub(crate) fn insert_many(&mut self, values: &[Value]) -> Result<Vec<Document>> {
        let prepared = values
            .iter()
            .map(|value| self.prepare_for_insertion(value).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        self.add_to_indexes(&prepared)?;

        let inserted: Vec<Document> = prepared.iter().map(|doc| (**doc).clone()).collect();
        self.persistence.persist_new_state(&inserted)?;
        debug!("inserted {} document(s)", inserted.len());
        Ok(inserted)
    }

    /// Drop documents from every index and append their tombstones
    fn remove_documents(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        self.remove_from_indexes(docs);
        let tombstones: Vec<Document> = docs
            .iter()
            .map(|doc| {
                let mut tombstone = Document::new();
                tombstone.insert(DELETED_KEY, Value::Bool(true));
                tombstone.insert("_id", doc.id().cloned().unwrap_or(Value::Null));
                tombstone
            })
            .collect();
        self.persistence.persist_new_state(&tombstones)
    }

    pub(crate) fn remove(&mut self, query: &Query, multi: bool) -> Result<usize> {
        let mut removed = Vec::new();
        for doc in self.get_candidates(query, true)? {
            if !multi && !removed.is_empty() {
                break;
            }
            if query.matches(&doc) {
                removed.push(doc);
            }
        }
        self.remove_documents(&removed)?;
        debug!("removed {} document(s)", removed.len());
        Ok(removed.len())
    }

    pub(crate) fn update(&mut self, query: &Query, update: &Value, options: UpdateOptions) -> Result<UpdateResult> {
        if options.upsert {
            let existing = FindOptions::new()
                .with_limit(1)
                .apply(query, self.get_candidates(query, false)?, None)?;
            if existing.is_empty() {
                let to_insert = if has_modifiers(update) {
                    let seed = query.source().map(|q| deep_copy(q, true)).unwrap_or_else(|| json!({}));
                    modify(&Document::from_value(seed)?, update)?.into()
                } else {
                    update.clone()
                };
                let mut inserted = self.insert_many(&[to_insert])?;
                return Ok(UpdateResult {
                    num_affected: 1,
                    affected_documents: inserted.pop().map(AffectedDocuments::One),
                    upsert: true,
                });
            }
        }

        let mut pairs = Vec::new();
        for candidate in self.get_candidates(query, false)? {
            if !options.multi && !pairs.is_empty() {
                break;
            }
            if !query.matches(&candidate) {
                continue;
            }
            let mut modified = modify(&candidate, update)?;
            if self.timestamp_data {
                match candidate.get("createdAt") {
                    Some(created_at) => modified.insert("createdAt", created_at.clone()),
                    None => modified.remove("createdAt"),
                };
                modified.insert("updatedAt", now());
            }
            pairs.push((candidate, Arc::new(modified)));
        }

        self.update_indexes(&pairs)?;

        let updated: Vec<Document> = pairs.iter().map(|(_, new)| (**new).clone()).collect();
        self.persistence.persist_new_state(&updated)?;
        debug!("updated {} document(s)", updated.len());

        let num_affected = updated.len();
        let affected_documents = if !options.return_updated_docs {
            None
        } else if options.multi {
            Some(AffectedDocuments::Many(updated))
        } else {
            updated.into_iter().next().map(AffectedDocuments::One)
        };

        Ok(UpdateResult {
            num_affected,
            affected_documents,
            upsert: false,
        })
    }

    // ===== Index lifecycle =====

    pub(crate) fn ensure_index(&mut self, options: &IndexOptions) -> Result<()> {
        let definition = options.to_definition()?;
        if self.indexes.contains_key(&definition.field_name) {
            return Ok(());
        }

        let mut index = Index::new(definition.clone());
        index.insert_many(&self.all_documents())?;
        self.indexes.insert(definition.field_name.clone(), index);
        if let Some(seconds) = definition.expire_after_seconds {
            self.ttl_indexes.insert(definition.field_name.clone(), seconds);
        }

        let mut marker = Document::new();
        marker.insert(INDEX_CREATED_KEY, serde_json::to_value(&definition)?);
        self.persistence.persist_new_state(&[marker])?;
        info!("created index '{}'", definition.field_name);
        Ok(())
    }

    pub(crate) fn remove_index(&mut self, field_name: &str) -> Result<()> {
        if field_name == "_id" {
            return Err(NestDbError::InvalidOptions("Cannot remove the _id index".to_string()));
        }
        if self.indexes.remove(field_name).is_none() {
            return Err(NestDbError::IndexNotFound(field_name.to_string()));
        }
        self.ttl_indexes.remove(field_name);

        let mut marker = Document::new();
        marker.insert(INDEX_REMOVED_KEY, Value::String(field_name.to_string()));
        self.persistence.persist_new_state(&[marker])?;
        info!("removed index '{}'", field_name);
        Ok(())
    }

    // ===== Load / compaction / drop =====

    fn reset_registry(&mut self) {
        self.indexes.clear();
        self.indexes.insert("_id".to_string(), primary_index());
        self.ttl_indexes.clear();
    }

    /// Rebuild the in-memory state from the datafile, then compact it
    pub(crate) fn load(&mut self) -> Result<()> {
        self.reset_registry();
        if self.persistence.in_memory_only() {
            return Ok(());
        }

        self.persistence.prepare_datafile()?;
        let state = self.persistence.read_datafile()?;

        for definition in state.indexes {
            if definition.field_name == "_id" {
                continue;
            }
            if let Some(seconds) = definition.expire_after_seconds {
                self.ttl_indexes.insert(definition.field_name.clone(), seconds);
            }
            self.indexes.insert(definition.field_name.clone(), Index::new(definition));
        }

        let docs: Vec<Arc<Document>> = state.documents.into_iter().map(Arc::new).collect();
        if let Err(e) = self.reset_indexes(&docs) {
            self.reset_indexes(&[])?;
            return Err(e);
        }

        self.persistence.persist_cached_database(&self.indexes)?;
        info!(
            "loaded {} document(s) and {} index(es), {} corrupt line(s) skipped",
            docs.len(),
            self.indexes.len() - 1,
            state.corrupt_items
        );
        Ok(())
    }

    /// Load and remember the outcome for later operations
    fn load_and_record(&mut self) -> Result<()> {
        let result = self.load();
        match &result {
            Ok(()) => self.load_failure = None,
            Err(e) => {
                error!("failed to load datastore: {}", e);
                self.load_failure = Some(e.to_string());
            }
        }
        result
    }

    pub(crate) fn compact(&mut self) -> Result<CompactionStats> {
        self.check_loaded()?;
        self.persistence.persist_cached_database(&self.indexes)
    }

    fn drop_all(&mut self) -> Result<()> {
        self.reset_registry();
        self.persistence.drop_datafile()
    }
}

struct Autocompaction {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Embedded document datastore.
///
/// Every operation runs on a single executor thread, in the order it was
/// issued. The handle is `Send + Sync`; share it across threads with `Arc`.
pub struct Datastore {
    executor: Executor<Engine>,
    listeners: Arc<Mutex<Vec<CompactionListener>>>,
    autocompaction: Mutex<Option<Autocompaction>>,
    in_memory_only: bool,
}

impl Datastore {
    /// Create a datastore. Persistent datastores buffer operations until
    /// `load_database` (or autoload) has run.
    pub fn new(options: DatastoreOptions) -> Result<Self> {
        let filename = match options.filename {
            Some(filename) if !options.in_memory_only => {
                if filename.to_string_lossy().ends_with('~') {
                    return Err(NestDbError::InvalidOptions(
                        "The datafile name can't end with a ~, which is reserved for crash safe backup files"
                            .to_string(),
                    ));
                }
                Some(filename)
            }
            _ => None,
        };

        let storage = options
            .storage
            .unwrap_or_else(|| Arc::new(FileStorage::default()) as Arc<dyn Storage>);
        let persistence = Persistence::new(
            storage,
            filename,
            options.corrupt_alert_threshold.unwrap_or(DEFAULT_CORRUPT_ALERT_THRESHOLD),
            options.after_serialization,
            options.before_deserialization,
        )?;

        let in_memory_only = persistence.in_memory_only();
        let listeners = persistence.listeners();
        let engine = Engine::new(persistence, options.timestamp_data, options.compare_strings);
        let executor = Executor::spawn("nestdb-executor", engine)?;
        if in_memory_only {
            executor.process_buffer();
        }

        let datastore = Datastore {
            executor,
            listeners,
            autocompaction: Mutex::new(None),
            in_memory_only,
        };
        if options.autoload {
            // outcome is reported through the operations waiting in the buffer
            let _ = datastore.queue_load();
        }
        Ok(datastore)
    }

    /// In-memory datastore, ready right away
    pub fn in_memory() -> Result<Self> {
        Self::new(DatastoreOptions::new().in_memory_only(true))
    }

    pub fn in_memory_only(&self) -> bool {
        self.in_memory_only
    }

    fn queue_load(&self) -> Pending<()> {
        let executor = self.executor.clone();
        self.executor.push(
            move |engine: &mut Engine| {
                let result = engine.load_and_record();
                executor.process_buffer();
                result
            },
            true,
        )
    }

    /// Load the datafile, then release buffered operations. If loading fails,
    /// later operations fail with `LoadFailed` until a load succeeds.
    pub fn load_database(&self) -> Result<()> {
        self.queue_load().wait()
    }

    /// Wait until the datastore has been loaded
    pub fn wait_for_load(&self) -> Result<()> {
        self.executor.push(|engine: &mut Engine| engine.check_loaded(), false).wait()
    }

    pub fn insert(&self, doc: Value) -> Result<Document> {
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    let mut inserted = engine.insert_many(&[doc])?;
                    inserted
                        .pop()
                        .ok_or_else(|| NestDbError::InvalidDocument("nothing inserted".to_string()))
                },
                false,
            )
            .wait()
    }

    /// Insert several documents, all or nothing
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Document>> {
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    engine.insert_many(&docs)
                },
                false,
            )
            .wait()
    }

    pub fn find<Q: IntoQuery>(&self, query: Q) -> Cursor<Vec<Document>> {
        Cursor::new(self.executor.clone(), query.into_query(), FindOptions::new(), |docs| docs)
    }

    pub fn find_one<Q: IntoQuery>(&self, query: Q) -> Cursor<Option<Document>> {
        Cursor::new(
            self.executor.clone(),
            query.into_query(),
            FindOptions::new().with_limit(1),
            |docs| docs.into_iter().next(),
        )
    }

    pub fn count<Q: IntoQuery>(&self, query: Q) -> Cursor<usize> {
        Cursor::new(self.executor.clone(), query.into_query(), FindOptions::new(), |docs| docs.len())
    }

    pub fn update<Q: IntoQuery>(&self, query: Q, update: Value, options: UpdateOptions) -> Result<UpdateResult> {
        let query = query.into_query()?;
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    engine.update(&query, &update, options)
                },
                false,
            )
            .wait()
    }

    /// Remove matching documents, returns how many were removed
    pub fn remove<Q: IntoQuery>(&self, query: Q, options: RemoveOptions) -> Result<usize> {
        let query = query.into_query()?;
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    engine.remove(&query, options.multi)
                },
                false,
            )
            .wait()
    }

    /// Create an index over existing data. Does nothing if it already exists.
    pub fn ensure_index(&self, options: IndexOptions) -> Result<()> {
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    engine.ensure_index(&options)
                },
                true,
            )
            .wait()
    }

    pub fn remove_index(&self, field_name: &str) -> Result<()> {
        let field_name = field_name.to_string();
        self.executor
            .push(
                move |engine: &mut Engine| {
                    engine.check_loaded()?;
                    engine.remove_index(&field_name)
                },
                true,
            )
            .wait()
    }

    /// Names of the current indexes, `_id` first
    pub fn index_names(&self) -> Result<Vec<String>> {
        self.executor
            .push(|engine: &mut Engine| Ok(engine.index_names()), false)
            .wait()
    }

    /// Every live document
    pub fn get_all_data(&self) -> Result<Vec<Document>> {
        self.executor
            .push(
                |engine: &mut Engine| {
                    engine.check_loaded()?;
                    Ok(engine.all_documents().iter().map(|doc| (**doc).clone()).collect())
                },
                false,
            )
            .wait()
    }

    /// Rewrite the datafile with one line per live document and index
    pub fn compact_datafile(&self) -> Result<CompactionStats> {
        self.executor
            .push(|engine: &mut Engine| engine.compact(), false)
            .wait()
    }

    /// Register a listener called after every compaction
    pub fn on_compaction_done<F>(&self, listener: F)
    where
        F: Fn(&CompactionStats) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Compact every `interval` (at least [`MIN_AUTOCOMPACTION_INTERVAL`]),
    /// replacing any previous schedule
    pub fn set_autocompaction_interval(&self, interval: Duration) -> Result<()> {
        self.stop_autocompaction();

        let interval = interval.max(MIN_AUTOCOMPACTION_INTERVAL);
        let (stop, stopped) = channel::bounded::<()>(0);
        let executor = self.executor.clone();
        let handle = thread::Builder::new()
            .name("nestdb-autocompaction".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let _ = executor.push(
                                |engine: &mut Engine| {
                                    if let Err(e) = engine.compact() {
                                        error!("autocompaction failed: {}", e);
                                    }
                                    Ok(())
                                },
                                false,
                            );
                        }
                        recv(stopped) -> _ => break,
                    }
                }
            })?;

        debug!("autocompaction every {:?}", interval);
        *self.autocompaction.lock() = Some(Autocompaction { stop, handle });
        Ok(())
    }

    pub fn stop_autocompaction(&self) {
        if let Some(Autocompaction { stop, handle }) = self.autocompaction.lock().take() {
            drop(stop);
            let _ = handle.join();
        }
    }

    /// Remove every document and index and delete the datafile. Buffered
    /// operations are dropped. A persistent datastore then needs
    /// `load_database` before it accepts operations again.
    pub fn drop_database(&self) -> Result<()> {
        self.stop_autocompaction();
        self.executor.set_not_ready();
        self.executor.reset_buffer();
        let result = self.executor.push(|engine: &mut Engine| engine.drop_all(), true).wait();
        if self.in_memory_only {
            self.executor.process_buffer();
        }
        result
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        self.stop_autocompaction();
    }
}
