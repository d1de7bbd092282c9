// src/index.rs
// Field indexes over documents, backed by the B+ tree

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::btree::BPlusTree;
use crate::compare::{compare_things, IndexKey};
use crate::document::Document;
use crate::error::{NestDbError, Result};

/// Durable description of an index, as written in `$$indexCreated` records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub field_name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<f64>,
}

impl IndexDefinition {
    pub fn new(field_name: impl Into<String>) -> Self {
        IndexDefinition {
            field_name: field_name.into(),
            unique: false,
            sparse: false,
            expire_after_seconds: None,
        }
    }

    /// Individual dot paths of a (possibly compound) index
    pub fn fields(&self) -> Vec<String> {
        self.field_name.split(',').map(str::to_string).collect()
    }
}

/// Options for `ensure_index`
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub field_names: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
    pub expire_after_seconds: Option<f64>,
}

impl IndexOptions {
    pub fn new(field_name: impl Into<String>) -> Self {
        IndexOptions {
            field_names: vec![field_name.into()],
            ..Default::default()
        }
    }

    /// Compound index over several dot paths
    pub fn compound<I, S>(field_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexOptions {
            field_names: field_names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn expire_after_seconds(mut self, seconds: f64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    /// Validate the field names and build the durable definition
    pub fn to_definition(&self) -> Result<IndexDefinition> {
        if self.field_names.is_empty() || self.field_names.iter().any(|f| f.is_empty()) {
            return Err(NestDbError::MissingFieldName);
        }
        if self.field_names.iter().any(|f| f.contains(',')) {
            return Err(NestDbError::InvalidOptions(
                "Cannot use comma in index fieldName".to_string(),
            ));
        }

        Ok(IndexDefinition {
            field_name: self.field_names.join(","),
            unique: self.unique,
            sparse: self.sparse,
            expire_after_seconds: self.expire_after_seconds,
        })
    }
}

/// Range bounds for `get_between_bounds`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

impl Bounds {
    pub fn is_empty(&self) -> bool {
        self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none()
    }
}

/// Index over one dot path, or a comma-joined tuple of dot paths
#[derive(Debug, Clone)]
pub struct Index {
    definition: IndexDefinition,
    fields: Vec<String>,
    tree: BPlusTree<IndexKey, Arc<Document>>,
}

fn same_document(a: &Arc<Document>, b: &Arc<Document>) -> bool {
    Arc::ptr_eq(a, b) || compare_things(a.id(), b.id()) == Ordering::Equal
}

impl Index {
    pub fn new(definition: IndexDefinition) -> Self {
        let fields = definition.fields();
        let tree = BPlusTree::new(definition.field_name.clone(), definition.unique);
        Index {
            definition,
            fields,
            tree,
        }
    }

    /// Keys a document is indexed under; `None` when a sparse index skips it
    fn keys_for(&self, doc: &Document) -> Option<Vec<IndexKey>> {
        if self.fields.len() > 1 {
            let mut key = Map::new();
            for field in &self.fields {
                if let Some(value) = doc.get_path(field) {
                    key.insert(field.clone(), value.into_owned());
                }
            }
            if key.is_empty() && self.definition.sparse {
                return None;
            }
            return Some(vec![IndexKey::new(Value::Object(key))]);
        }

        match doc.get_path(&self.definition.field_name) {
            None if self.definition.sparse => None,
            None => Some(vec![IndexKey::undefined()]),
            Some(value) => match value.into_owned() {
                Value::Array(items) => {
                    let mut keys: Vec<IndexKey> = items.into_iter().map(IndexKey::new).collect();
                    keys.sort();
                    keys.dedup();
                    Some(keys)
                }
                other => Some(vec![IndexKey::new(other)]),
            },
        }
    }

    /// Index one document; a failure leaves the index unchanged
    pub fn insert(&mut self, doc: &Arc<Document>) -> Result<()> {
        let Some(keys) = self.keys_for(doc) else {
            return Ok(());
        };

        for (i, key) in keys.iter().enumerate() {
            if let Err(e) = self.tree.insert(key.clone(), Arc::clone(doc)) {
                for inserted in &keys[..i] {
                    self.tree.delete(inserted, |d| same_document(d, doc));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Index several documents, all or nothing
    pub fn insert_many(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(e) = self.insert(doc) {
                for inserted in &docs[..i] {
                    self.remove(inserted);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, doc: &Arc<Document>) {
        let Some(keys) = self.keys_for(doc) else {
            return;
        };
        for key in &keys {
            self.tree.delete(key, |d| same_document(d, doc));
        }
    }

    pub fn remove_many(&mut self, docs: &[Arc<Document>]) {
        for doc in docs {
            self.remove(doc);
        }
    }

    /// Replace `old` by `new`; on failure `old` is restored
    pub fn update(&mut self, old: &Arc<Document>, new: &Arc<Document>) -> Result<()> {
        self.remove(old);
        if let Err(e) = self.insert(new) {
            self.insert(old)?;
            return Err(e);
        }
        Ok(())
    }

    /// Replace every `(old, new)` pair, all or nothing
    pub fn update_many(&mut self, pairs: &[(Arc<Document>, Arc<Document>)]) -> Result<()> {
        for (old, _) in pairs {
            self.remove(old);
        }

        for (i, (_, new)) in pairs.iter().enumerate() {
            if let Err(e) = self.insert(new) {
                for (_, inserted) in &pairs[..i] {
                    self.remove(inserted);
                }
                for (old, _) in pairs {
                    self.insert(old)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn revert_update(&mut self, old: &Arc<Document>, new: &Arc<Document>) -> Result<()> {
        self.update(new, old)
    }

    pub fn revert_update_many(&mut self, pairs: &[(Arc<Document>, Arc<Document>)]) -> Result<()> {
        let reverted: Vec<(Arc<Document>, Arc<Document>)> = pairs
            .iter()
            .map(|(old, new)| (Arc::clone(new), Arc::clone(old)))
            .collect();
        self.update_many(&reverted)
    }

    /// Documents indexed under exactly `value`
    pub fn get_matching(&self, value: &Value) -> Vec<Arc<Document>> {
        self.tree
            .search(&IndexKey::new(value.clone()))
            .map(<[Arc<Document>]>::to_vec)
            .unwrap_or_default()
    }

    /// Union of `get_matching` over `values`, without duplicates
    pub fn get_matching_any(&self, values: &[Value]) -> Vec<Arc<Document>> {
        let mut seen = AHashSet::new();
        let mut results = Vec::new();
        for value in values {
            for doc in self.get_matching(value) {
                let id = doc.id().map(Value::to_string).unwrap_or_default();
                if seen.insert(id) {
                    results.push(doc);
                }
            }
        }
        results
    }

    /// Ordered range scan; when both a strict and a loose bound are given on
    /// the same side, the tighter one wins
    pub fn get_between_bounds(&self, bounds: &Bounds) -> Vec<Arc<Document>> {
        let lower = match (&bounds.gt, &bounds.gte) {
            (Some(gt), Some(gte)) => {
                if compare_things(Some(gt), Some(gte)) != Ordering::Less {
                    Bound::Excluded(IndexKey::new(gt.clone()))
                } else {
                    Bound::Included(IndexKey::new(gte.clone()))
                }
            }
            (Some(gt), None) => Bound::Excluded(IndexKey::new(gt.clone())),
            (None, Some(gte)) => Bound::Included(IndexKey::new(gte.clone())),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&bounds.lt, &bounds.lte) {
            (Some(lt), Some(lte)) => {
                if compare_things(Some(lt), Some(lte)) != Ordering::Greater {
                    Bound::Excluded(IndexKey::new(lt.clone()))
                } else {
                    Bound::Included(IndexKey::new(lte.clone()))
                }
            }
            (Some(lt), None) => Bound::Excluded(IndexKey::new(lt.clone())),
            (None, Some(lte)) => Bound::Included(IndexKey::new(lte.clone())),
            (None, None) => Bound::Unbounded,
        };

        self.tree.range(lower.as_ref(), upper.as_ref())
    }

    /// Every indexed document in key order
    pub fn get_all(&self) -> Vec<Arc<Document>> {
        self.tree.all()
    }

    /// Empty the index, then load `docs`
    pub fn reset(&mut self, docs: &[Arc<Document>]) -> Result<()> {
        self.tree.clear();
        self.insert_many(docs)
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn field_name(&self) -> &str {
        &self.definition.field_name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.definition.sparse
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Arc<Document> {
        Arc::new(Document::from_value(value).unwrap())
    }

    fn ids(docs: &[Arc<Document>]) -> Vec<Value> {
        docs.iter().map(|d| d.id().cloned().unwrap()).collect()
    }

    fn index(field: &str, unique: bool) -> Index {
        let mut def = IndexDefinition::new(field);
        def.unique = unique;
        Index::new(def)
    }

    #[test]
    fn test_insert_and_get_matching() {
        let mut idx = index("age", false);
        idx.insert(&doc(json!({"_id": "a", "age": 30}))).unwrap();
        idx.insert(&doc(json!({"_id": "b", "age": 30}))).unwrap();
        idx.insert(&doc(json!({"_id": "c", "age": 25}))).unwrap();

        assert_eq!(ids(&idx.get_matching(&json!(30))), vec![json!("a"), json!("b")]);
        assert_eq!(ids(&idx.get_matching(&json!(25))), vec![json!("c")]);
        assert!(idx.get_matching(&json!("30")).is_empty());
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_unique_violation_leaves_index_unchanged() {
        let mut idx = index("email", true);
        idx.insert(&doc(json!({"_id": "1", "email": "a@x"}))).unwrap();

        let before = ids(&idx.get_all());
        let err = idx.insert(&doc(json!({"_id": "2", "email": "a@x"}))).unwrap_err();
        assert!(matches!(err, NestDbError::UniqueConstraintViolation { .. }));
        assert_eq!(ids(&idx.get_all()), before);
    }

    #[test]
    fn test_insert_many_rolls_back() {
        let mut idx = index("email", true);
        idx.insert(&doc(json!({"_id": "0", "email": "taken"}))).unwrap();

        let batch = vec![
            doc(json!({"_id": "1", "email": "b"})),
            doc(json!({"_id": "2", "email": "c"})),
            doc(json!({"_id": "3", "email": "taken"})),
        ];
        assert!(idx.insert_many(&batch).is_err());
        assert_eq!(ids(&idx.get_all()), vec![json!("0")]);
    }

    #[test]
    fn test_array_values_indexed_per_distinct_element() {
        let mut idx = index("tags", false);
        let d = doc(json!({"_id": "x", "tags": ["a", "b", "a", 1, "1"]}));
        idx.insert(&d).unwrap();

        assert_eq!(idx.len(), 4);
        assert_eq!(ids(&idx.get_matching(&json!("a"))), vec![json!("x")]);
        assert_eq!(ids(&idx.get_matching(&json!(1))), vec![json!("x")]);
        assert_eq!(ids(&idx.get_matching(&json!("1"))), vec![json!("x")]);

        idx.remove(&d);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_array_unique_rollback_of_partial_keys() {
        let mut idx = index("tags", true);
        idx.insert(&doc(json!({"_id": "1", "tags": ["c"]}))).unwrap();

        // "a" and "b" get inserted before "c" collides
        assert!(idx.insert(&doc(json!({"_id": "2", "tags": ["a", "b", "c"]}))).is_err());
        assert!(idx.get_matching(&json!("a")).is_empty());
        assert!(idx.get_matching(&json!("b")).is_empty());
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_sparse_skips_missing_field() {
        let mut def = IndexDefinition::new("nick");
        def.unique = true;
        def.sparse = true;
        let mut idx = Index::new(def);

        idx.insert(&doc(json!({"_id": "1"}))).unwrap();
        idx.insert(&doc(json!({"_id": "2"}))).unwrap();
        idx.insert(&doc(json!({"_id": "3", "nick": "z"}))).unwrap();
        assert_eq!(ids(&idx.get_all()), vec![json!("3")]);

        // non-sparse unique index refuses a second undefined key
        let mut strict = index("nick", true);
        strict.insert(&doc(json!({"_id": "1"}))).unwrap();
        assert!(strict.insert(&doc(json!({"_id": "2"}))).is_err());
    }

    #[test]
    fn test_compound_index() {
        let idx_def = IndexOptions::compound(["city", "age"]).to_definition().unwrap();
        assert_eq!(idx_def.field_name, "city,age");
        let mut idx = Index::new(idx_def);
        assert!(idx.is_compound());

        idx.insert(&doc(json!({"_id": "1", "city": "Oslo", "age": 3}))).unwrap();
        idx.insert(&doc(json!({"_id": "2", "city": "Oslo", "age": 4}))).unwrap();

        let hits = idx.get_matching(&json!({"age": 4, "city": "Oslo"}));
        assert_eq!(ids(&hits), vec![json!("2")]);
    }

    #[test]
    fn test_index_options_validation() {
        assert!(matches!(
            IndexOptions::compound(Vec::<String>::new()).to_definition(),
            Err(NestDbError::MissingFieldName)
        ));
        assert!(matches!(
            IndexOptions::compound(["a,b", "c"]).to_definition(),
            Err(NestDbError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_update_and_revert() {
        let mut idx = index("email", true);
        let a = doc(json!({"_id": "1", "email": "a"}));
        let b = doc(json!({"_id": "2", "email": "b"}));
        idx.insert_many(&[a.clone(), b.clone()]).unwrap();

        let a2 = doc(json!({"_id": "1", "email": "b"}));
        assert!(idx.update(&a, &a2).is_err());
        assert_eq!(ids(&idx.get_matching(&json!("a"))), vec![json!("1")]);

        let a3 = doc(json!({"_id": "1", "email": "c"}));
        idx.update(&a, &a3).unwrap();
        assert!(idx.get_matching(&json!("a")).is_empty());
        idx.revert_update(&a, &a3).unwrap();
        assert_eq!(ids(&idx.get_matching(&json!("a"))), vec![json!("1")]);
    }

    #[test]
    fn test_update_many_rolls_back() {
        let mut idx = index("n", true);
        let docs: Vec<_> = (0..3).map(|i| doc(json!({"_id": i, "n": i}))).collect();
        idx.insert_many(&docs).unwrap();

        // swapping two values is fine since olds are removed first
        let swap = vec![
            (docs[0].clone(), doc(json!({"_id": 0, "n": 1}))),
            (docs[1].clone(), doc(json!({"_id": 1, "n": 0}))),
        ];
        idx.update_many(&swap).unwrap();
        idx.revert_update_many(&swap).unwrap();
        assert_eq!(ids(&idx.get_matching(&json!(0))), vec![json!(0)]);

        let clash = vec![
            (docs[0].clone(), doc(json!({"_id": 0, "n": 10}))),
            (docs[1].clone(), doc(json!({"_id": 1, "n": 10}))),
        ];
        assert!(idx.update_many(&clash).is_err());
        assert!(idx.get_matching(&json!(10)).is_empty());
        assert_eq!(ids(&idx.get_all()), vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_get_matching_any_dedups() {
        let mut idx = index("tags", false);
        idx.insert(&doc(json!({"_id": "1", "tags": ["a", "b"]}))).unwrap();
        idx.insert(&doc(json!({"_id": "2", "tags": ["b"]}))).unwrap();

        let hits = idx.get_matching_any(&[json!("a"), json!("b"), json!("zz")]);
        assert_eq!(ids(&hits), vec![json!("1"), json!("2")]);
    }

    #[test]
    fn test_get_between_bounds() {
        let mut idx = index("n", false);
        for i in 0..50 {
            idx.insert(&doc(json!({"_id": i, "n": i}))).unwrap();
        }

        let bounds = Bounds {
            gte: Some(json!(10)),
            lt: Some(json!(13)),
            ..Default::default()
        };
        assert_eq!(ids(&idx.get_between_bounds(&bounds)), vec![json!(10), json!(11), json!(12)]);

        // tighter bound wins on each side
        let bounds = Bounds {
            gt: Some(json!(20)),
            gte: Some(json!(5)),
            lt: Some(json!(30)),
            lte: Some(json!(22)),
        };
        assert_eq!(ids(&idx.get_between_bounds(&bounds)), vec![json!(21), json!(22)]);
    }

    #[test]
    fn test_reset() {
        let mut idx = index("_id", true);
        idx.insert(&doc(json!({"_id": "old"}))).unwrap();
        idx.reset(&[doc(json!({"_id": "n1"})), doc(json!({"_id": "n2"}))]).unwrap();
        assert_eq!(ids(&idx.get_all()), vec![json!("n1"), json!("n2")]);
    }

    #[test]
    fn test_definition_serde_camel_case() {
        let mut def = IndexDefinition::new("expiresAt");
        def.expire_after_seconds = Some(3600.0);
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(
            value,
            json!({"fieldName": "expiresAt", "unique": false, "sparse": false, "expireAfterSeconds": 3600.0})
        );
        let back: IndexDefinition = serde_json::from_value(json!({"fieldName": "a"})).unwrap();
        assert_eq!(back, IndexDefinition::new("a"));
    }
}
