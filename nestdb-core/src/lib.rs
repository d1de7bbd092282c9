// nestdb-core/src/lib.rs
// Embedded document datastore: indexed in-memory collection over an append-only log

pub mod error;
pub mod document;
pub mod compare;
pub mod btree;
pub mod index;
pub mod query;
pub mod modifier;
pub mod query_planner;
pub mod cursor;
pub mod executor;
pub mod storage;
pub mod persistence;
pub mod datastore;

// Public exports
pub use error::{NestDbError, Result};
pub use document::Document;
pub use compare::{compare_things, StringComparator};
pub use index::{IndexDefinition, IndexOptions};
pub use query::{IntoQuery, Query};
pub use cursor::{Cursor, FindOptions};
pub use executor::Pending;
pub use storage::{FileStorage, Storage};
pub use persistence::{CompactionStats, SerializationHook};
pub use datastore::{
    AffectedDocuments, Datastore, DatastoreOptions, RemoveOptions, UpdateOptions, UpdateResult,
};
