// src/cursor.rs
// Find options (projection, sort, limit, skip) and the lazy cursor running them

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::compare::{compare_things_with, StringComparator};
use crate::datastore::Engine;
use crate::document::Document;
use crate::error::{NestDbError, Result};
use crate::executor::{Executor, Pending};
use crate::modifier::modify;
use crate::query::Query;

/// Options for find queries
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Projection object: field → 1 (pick) or 0 (omit); `_id` is kept unless
    /// set to 0
    pub projection: Option<Value>,

    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Limit: maximum number of documents to return, 0 means no limit
    pub limit: Option<usize>,

    /// Skip: number of documents to skip (for pagination)
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Filter `candidates` with `query`, then sort, skip, limit and project.
    ///
    /// Without a sort, skip and limit are applied while scanning and the scan
    /// stops once the limit is reached.
    pub fn apply(
        &self,
        query: &Query,
        candidates: Vec<Arc<Document>>,
        compare_strings: Option<&StringComparator>,
    ) -> Result<Vec<Document>> {
        let limit = self.limit.filter(|&l| l > 0);
        let skip = self.skip.unwrap_or(0);

        let selected: Vec<Arc<Document>> = match &self.sort {
            None => {
                let mut res = Vec::new();
                let mut skipped = 0;
                for candidate in candidates {
                    if !query.matches(&candidate) {
                        continue;
                    }
                    if skipped < skip {
                        skipped += 1;
                        continue;
                    }
                    res.push(candidate);
                    if limit.map_or(false, |l| res.len() >= l) {
                        break;
                    }
                }
                res
            }
            Some(sort) => {
                let mut res: Vec<Arc<Document>> =
                    candidates.into_iter().filter(|c| query.matches(c)).collect();
                apply_sort(&mut res, sort, compare_strings);
                res.into_iter()
                    .skip(skip)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect()
            }
        };

        let docs = selected.iter().map(|d| Document::clone(d)).collect();
        match &self.projection {
            Some(projection) => apply_projection(docs, projection),
            None => Ok(docs),
        }
    }
}

/// Apply sort to documents, comparing strings with `compare_strings` when given
pub fn apply_sort(docs: &mut [Arc<Document>], sort: &[(String, i32)], compare_strings: Option<&StringComparator>) {
    if sort.is_empty() {
        return;
    }

    let byte_order = |a: &str, b: &str| a.cmp(b);
    let strings: &dyn Fn(&str, &str) -> Ordering = match compare_strings {
        Some(comparator) => comparator.as_ref(),
        None => &byte_order,
    };

    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let val_a = a.get_path(field);
            let val_b = b.get_path(field);

            let cmp = compare_things_with(val_a.as_deref(), val_b.as_deref(), strings);

            if cmp != Ordering::Equal {
                return if *direction < 0 { cmp.reverse() } else { cmp };
            }
        }
        Ordering::Equal
    });
}

fn projection_flag(field: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map_or(false, |f| f != 0.0)),
        other => Err(NestDbError::InvalidProjection(format!(
            "projection value for '{}' must be 0 or 1, got {}",
            field, other
        ))),
    }
}

/// Apply a pick (all 1) or omit (all 0) projection; dot paths allowed
pub fn apply_projection(docs: Vec<Document>, projection: &Value) -> Result<Vec<Document>> {
    let Value::Object(spec) = projection else {
        return Err(NestDbError::InvalidProjection(format!(
            "projection must be an object, got {}",
            projection
        )));
    };
    if spec.is_empty() {
        return Ok(docs);
    }

    let keep_id = match spec.get("_id") {
        Some(value) => projection_flag("_id", value)?,
        None => true,
    };

    let mut pick: Option<bool> = None;
    let mut fields = Vec::new();
    for (field, value) in spec.iter().filter(|(field, _)| *field != "_id") {
        let flag = projection_flag(field, value)?;
        if pick.map_or(false, |p| p != flag) {
            return Err(NestDbError::InvalidProjection(
                "Can't both keep and omit fields except for _id".to_string(),
            ));
        }
        pick = Some(flag);
        fields.push(field.clone());
    }

    docs.into_iter()
        .map(|candidate| {
            let mut projected = if pick == Some(true) {
                let mut set = Map::new();
                for field in &fields {
                    if let Some(value) = candidate.get_path(field) {
                        set.insert(field.clone(), value.into_owned());
                    }
                }
                modify(&Document::new(), &json!({ "$set": set }))?
            } else {
                let unset: Map<String, Value> = fields
                    .iter()
                    .map(|field| (field.clone(), Value::Bool(true)))
                    .collect();
                modify(&candidate, &json!({ "$unset": unset }))?
            };

            match candidate.id() {
                Some(id) if keep_id => {
                    projected.insert("_id", id.clone());
                }
                _ => {
                    projected.remove("_id");
                }
            }
            Ok(projected)
        })
        .collect()
}

/// Lazy query: nothing runs until [`Cursor::exec`] (or [`Cursor::pending`])
pub struct Cursor<T> {
    executor: Executor<Engine>,
    query: Result<Query>,
    options: FindOptions,
    finish: fn(Vec<Document>) -> T,
}

impl<T: Send + 'static> Cursor<T> {
    pub(crate) fn new(
        executor: Executor<Engine>,
        query: Result<Query>,
        options: FindOptions,
        finish: fn(Vec<Document>) -> T,
    ) -> Self {
        Cursor {
            executor,
            query,
            options,
            finish,
        }
    }

    /// Sort by `(field, direction)` pairs, direction 1 or -1
    pub fn sort<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        self.options.sort = Some(fields.into_iter().map(|(f, d)| (f.into(), d)).collect());
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn projection(mut self, projection: Value) -> Self {
        self.options.projection = Some(projection);
        self
    }

    pub fn options(&self) -> &FindOptions {
        &self.options
    }

    /// Queue the query on the executor
    pub fn pending(self) -> Pending<T> {
        let Cursor {
            executor,
            query,
            options,
            finish,
        } = self;

        executor.push(
            move |engine: &mut Engine| {
                let query = query?;
                engine.check_loaded()?;
                let candidates = engine.get_candidates(&query, false)?;
                let docs = options.apply(&query, candidates, engine.compare_strings())?;
                Ok(finish(docs))
            },
            false,
        )
    }

    /// Run the query and wait for its result
    pub fn exec(self) -> Result<T> {
        self.pending().wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(values: Vec<Value>) -> Vec<Arc<Document>> {
        values
            .into_iter()
            .map(|v| Arc::new(Document::from_value(v).unwrap()))
            .collect()
    }

    fn field(docs: &[Document], name: &str) -> Vec<Value> {
        docs.iter().map(|d| d.get(name).cloned().unwrap_or(Value::Null)).collect()
    }

    fn people() -> Vec<Arc<Document>> {
        docs(vec![
            json!({"_id": "1", "name": "Carol", "age": 30}),
            json!({"_id": "2", "name": "alice", "age": 25}),
            json!({"_id": "3", "name": "Bob", "age": 30}),
            json!({"_id": "4", "name": "Dave", "age": 41}),
            json!({"_id": "5", "name": "Eve"}),
        ])
    }

    #[test]
    fn test_skip_limit_without_sort() {
        let opts = FindOptions::new().with_skip(1).with_limit(2);
        let out = opts.apply(&Query::all(), people(), None).unwrap();
        assert_eq!(field(&out, "_id"), vec![json!("2"), json!("3")]);

        // limit 0 means no limit
        let opts = FindOptions::new().with_limit(0);
        assert_eq!(opts.apply(&Query::all(), people(), None).unwrap().len(), 5);

        let opts = FindOptions::new().with_skip(10);
        assert!(opts.apply(&Query::all(), people(), None).unwrap().is_empty());
    }

    #[test]
    fn test_sort_multi_field_then_slice() {
        let opts = FindOptions::new().with_sort(vec![("age".to_string(), -1), ("name".to_string(), 1)]);
        let out = opts.apply(&Query::all(), people(), None).unwrap();
        // undefined sorts lowest
        assert_eq!(
            field(&out, "name"),
            vec![json!("Dave"), json!("Bob"), json!("Carol"), json!("alice"), json!("Eve")]
        );

        let opts = FindOptions::new()
            .with_sort(vec![("age".to_string(), 1)])
            .with_skip(1)
            .with_limit(2);
        let out = opts.apply(&Query::all(), people(), None).unwrap();
        assert_eq!(field(&out, "name"), vec![json!("alice"), json!("Carol")]);
    }

    #[test]
    fn test_sort_with_custom_string_comparator() {
        let insensitive: StringComparator = Arc::new(|a: &str, b: &str| a.to_lowercase().cmp(&b.to_lowercase()));
        let opts = FindOptions::new().with_sort(vec![("name".to_string(), 1)]);
        let query = Query::from_json(&json!({"age": {"$lt": 35}})).unwrap();

        let out = opts.apply(&query, people(), Some(&insensitive)).unwrap();
        assert_eq!(field(&out, "name"), vec![json!("alice"), json!("Bob"), json!("Carol")]);

        let out = opts.apply(&query, people(), None).unwrap();
        assert_eq!(field(&out, "name"), vec![json!("Bob"), json!("Carol"), json!("alice")]);
    }

    #[test]
    fn test_projection_pick_and_omit() {
        let source = vec![Document::from_value(json!({
            "_id": "1", "name": "Alice", "age": 30, "addr": {"city": "Oslo", "zip": 1}
        }))
        .unwrap()];

        let out = apply_projection(source.clone(), &json!({"name": 1, "addr.city": 1})).unwrap();
        assert_eq!(out[0].to_value(), json!({"_id": "1", "name": "Alice", "addr": {"city": "Oslo"}}));

        let out = apply_projection(source.clone(), &json!({"name": 1, "_id": 0})).unwrap();
        assert_eq!(out[0].to_value(), json!({"name": "Alice"}));

        let out = apply_projection(source.clone(), &json!({"age": 0, "addr.zip": 0})).unwrap();
        assert_eq!(out[0].to_value(), json!({"_id": "1", "name": "Alice", "addr": {"city": "Oslo"}}));

        let out = apply_projection(source.clone(), &json!({"_id": 0})).unwrap();
        assert!(out[0].id().is_none());
        assert_eq!(out[0].len(), 3);

        let out = apply_projection(source.clone(), &json!({})).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_projection_errors() {
        let source = vec![Document::from_value(json!({"_id": "1", "a": 1, "b": 2})).unwrap()];
        assert!(matches!(
            apply_projection(source.clone(), &json!({"a": 1, "b": 0})),
            Err(NestDbError::InvalidProjection(_))
        ));
        assert!(matches!(
            apply_projection(source.clone(), &json!({"a": "yes"})),
            Err(NestDbError::InvalidProjection(_))
        ));
        // _id is the one field allowed to disagree
        assert!(apply_projection(source, &json!({"a": 1, "_id": 0})).is_ok());
    }
}
