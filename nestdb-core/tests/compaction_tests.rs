// Datafile compaction, crash recovery and corruption tolerance tests
use nestdb_core::document::date_from_millis;
use nestdb_core::storage::temp_path;
use nestdb_core::{
    CompactionStats, Datastore, DatastoreOptions, FileStorage, IndexOptions, NestDbError, RemoveOptions,
    Result, Storage, UpdateOptions,
};
use parking_lot::Mutex;
use serde_json::json;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

fn open(path: &Path) -> Datastore {
    Datastore::new(DatastoreOptions::new().filename(path).autoload(true)).unwrap()
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count()
}

/// File storage whose renames can be made to fail, simulating a crash
/// between writing the temporary file and replacing the datafile
struct CrashingStorage {
    inner: FileStorage,
    fail_renames: AtomicBool,
}

impl Storage for CrashingStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn read_lines(&self, path: &Path) -> Result<Box<dyn BufRead + Send>> {
        self.inner.read_lines(path)
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.inner.write_all(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.inner.append(path, data)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.fail_renames.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "simulated crash").into());
        }
        self.inner.rename(from, to)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        self.inner.unlink(path)
    }

    fn mkdir_recursive(&self, path: &Path) -> Result<()> {
        self.inner.mkdir_recursive(path)
    }

    fn flush(&self, path: &Path, is_dir: bool) -> Result<()> {
        self.inner.flush(path, is_dir)
    }
}

#[test]
fn test_compaction_keeps_one_line_per_document() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("hundred.db");
    let db = open(&path);

    for i in 0..100 {
        db.insert(json!({"_id": format!("doc{}", i), "n": i})).unwrap();
    }
    assert!(line_count(&path) >= 100);

    db.update(json!({"n": {"$lt": 50}}), json!({"$set": {"half": true}}), UpdateOptions::new().multi(true))
        .unwrap();
    assert!(line_count(&path) >= 150);

    let stats = db.compact_datafile().unwrap();
    assert_eq!(stats.documents_kept, 100);
    assert_eq!(line_count(&path), 100);
    drop(db);

    let db = open(&path);
    assert_eq!(db.count(json!({})).exec().unwrap(), 100);
    assert_eq!(db.count(json!({"half": true})).exec().unwrap(), 50);
}

#[test]
fn test_compaction_drops_removed_documents() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("removed.db");
    let db = open(&path);

    db.insert_many((0..20).map(|i| json!({"n": i})).collect()).unwrap();
    db.remove(json!({"n": {"$gte": 5}}), RemoveOptions::new().multi(true)).unwrap();
    assert_eq!(line_count(&path), 35);

    db.compact_datafile().unwrap();
    assert_eq!(line_count(&path), 5);
    assert!(!temp_path(&path).exists());
}

#[test]
fn test_index_definitions_survive_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("indexes.db");

    {
        let db = open(&path);
        db.ensure_index(IndexOptions::new("email").unique(true)).unwrap();
        db.ensure_index(IndexOptions::new("seen").expire_after_seconds(3600.0)).unwrap();
        db.ensure_index(IndexOptions::new("tmp")).unwrap();
        db.remove_index("tmp").unwrap();
        db.insert(json!({"email": "a@b.c"})).unwrap();
        db.compact_datafile().unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 3);
    assert!(contents.contains("\"$$indexCreated\""));
    assert!(!contents.contains("tmp"));

    let db = open(&path);
    assert_eq!(db.index_names().unwrap(), vec!["_id", "email", "seen"]);
    assert!(matches!(
        db.insert(json!({"email": "a@b.c"})),
        Err(NestDbError::UniqueConstraintViolation { .. })
    ));
}

#[test]
fn test_crash_before_rename_keeps_old_datafile() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("crash.db");
    let storage = Arc::new(CrashingStorage {
        inner: FileStorage::new(),
        fail_renames: AtomicBool::new(false),
    });

    let db = Datastore::new(
        DatastoreOptions::new()
            .filename(&path)
            .autoload(true)
            .storage(storage.clone() as Arc<dyn Storage>),
    )
    .unwrap();
    db.insert_many((0..10).map(|i| json!({"n": i})).collect()).unwrap();
    db.remove(json!({"n": 0}), RemoveOptions::new()).unwrap();

    storage.fail_renames.store(true, Ordering::SeqCst);
    assert!(matches!(db.compact_datafile(), Err(NestDbError::Io(_))));
    drop(db);

    // the rewritten file is left next to the untouched datafile
    assert_eq!(line_count(&temp_path(&path)), 9);
    assert_eq!(line_count(&path), 11);

    let db = open(&path);
    assert_eq!(db.count(json!({})).exec().unwrap(), 9);
}

#[test]
fn test_crash_after_temp_write_promotes_temp_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("promote.db");

    {
        let db = open(&path);
        db.insert_many((0..3).map(|i| json!({"n": i})).collect()).unwrap();
        db.compact_datafile().unwrap();
    }

    // only the temporary file made it to disk
    std::fs::rename(&path, temp_path(&path)).unwrap();

    let db = open(&path);
    assert_eq!(db.count(json!({})).exec().unwrap(), 3);
    assert!(path.exists());
    assert!(!temp_path(&path).exists());
}

#[test]
fn test_corruption_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("corrupt.db");

    let write = |corrupt: usize| {
        let mut data = String::new();
        for i in 0..(10 - corrupt) {
            data.push_str(&format!("{{\"_id\":\"{}\",\"hello\":\"world\"}}\n", i));
        }
        for _ in 0..corrupt {
            data.push_str("{\"_id\":\"broken\",\"hello\n");
        }
        std::fs::write(&path, data).unwrap();
    };

    // exactly at the threshold is still accepted
    write(1);
    let db = open(&path);
    assert_eq!(db.count(json!({})).exec().unwrap(), 9);
    drop(db);

    write(2);
    let db = Datastore::new(DatastoreOptions::new().filename(&path)).unwrap();
    match db.load_database() {
        Err(NestDbError::CorruptionThresholdExceeded {
            corrupt_items,
            total_lines,
            ..
        }) => {
            assert_eq!(corrupt_items, 2);
            assert_eq!(total_lines, 10);
        }
        other => panic!("unexpected {:?}", other),
    }
    drop(db);

    let lenient = Datastore::new(
        DatastoreOptions::new()
            .filename(&path)
            .autoload(true)
            .corrupt_alert_threshold(0.5),
    )
    .unwrap();
    assert_eq!(lenient.count(json!({})).exec().unwrap(), 8);
}

#[test]
fn test_compaction_listener_and_hooks() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("hooks.db");
    let options = DatastoreOptions::new()
        .filename(&path)
        .after_serialization(|line: &str| format!("#{}", line))
        .before_deserialization(|line: &str| line.strip_prefix('#').unwrap_or(line).to_string());

    let db = Datastore::new(options.clone()).unwrap();
    let seen: Arc<Mutex<Vec<CompactionStats>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.on_compaction_done(move |stats| sink.lock().push(stats.clone()));

    db.load_database().unwrap();
    db.insert(json!({"_id": "1", "secret": "value"})).unwrap();
    db.compact_datafile().unwrap();

    let stats = seen.lock().clone();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[1].documents_kept, 1);
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("#{"));
    drop(db);

    let db = Datastore::new(options.autoload(true)).unwrap();
    let doc = db.find_one(json!({"_id": "1"})).exec().unwrap().unwrap();
    assert_eq!(doc.get("secret"), Some(&json!("value")));
}

#[test]
fn test_expired_documents_are_removed_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ttl.db");
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;

    {
        let db = open(&path);
        db.ensure_index(IndexOptions::new("seen").expire_after_seconds(60.0)).unwrap();
        db.insert_many(vec![
            json!({"_id": "old", "seen": date_from_millis(now_ms - 120_000)}),
            json!({"_id": "fresh", "seen": date_from_millis(now_ms)}),
        ])
        .unwrap();
        assert_eq!(line_count(&path), 3);

        let found = db.find(json!({})).exec().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), Some(&json!("fresh")));
    }

    // the expiry was written as a tombstone, not only dropped from memory
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 4);
    let last: serde_json::Value = serde_json::from_str(contents.lines().last().unwrap()).unwrap();
    assert_eq!(last, json!({"$$deleted": true, "_id": "old"}));

    let db = open(&path);
    assert_eq!(db.get_all_data().unwrap().len(), 1);
    assert!(db.find_one(json!({"_id": "old"})).exec().unwrap().is_none());
}
