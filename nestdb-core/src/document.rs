// src/document.rs
// Document model: field validation, dates, deep copy, dot paths and line (de)serialization

use std::borrow::Cow;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{NestDbError, Result};

/// Tag used for date values, both in memory and in the datafile
pub const DATE_KEY: &str = "$$date";
/// Tombstone marker
pub const DELETED_KEY: &str = "$$deleted";
/// Index creation marker
pub const INDEX_CREATED_KEY: &str = "$$indexCreated";
/// Index removal marker
pub const INDEX_REMOVED_KEY: &str = "$$indexRemoved";

/// A stored record: a JSON object whose `_id` field identifies it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Document(Map::new())
    }

    /// Build a document from a JSON value, which has to be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Document(map)),
            other => Err(NestDbError::InvalidDocument(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// The `_id` field, if any
    pub fn id(&self) -> Option<&Value> {
        self.0.get("_id")
    }

    /// Top-level field lookup
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Dot-notation lookup, see [`get_dot_value`]
    pub fn get_path(&self, path: &str) -> Option<Cow<'_, Value>> {
        get_dot_value(&self.0, path)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Document(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = NestDbError;

    fn try_from(value: Value) -> Result<Self> {
        Document::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

// ===== Dates =====

/// Tagged date value from epoch milliseconds
pub fn date_from_millis(millis: i64) -> Value {
    let mut map = Map::new();
    map.insert(DATE_KEY.to_string(), Value::from(millis));
    Value::Object(map)
}

/// Tagged date value from a chrono timestamp
pub fn date(at: DateTime<Utc>) -> Value {
    date_from_millis(at.timestamp_millis())
}

/// Current time as a tagged date value
pub fn now() -> Value {
    date(Utc::now())
}

/// Epoch milliseconds of a tagged date, `None` for anything else
pub fn date_millis(value: &Value) -> Option<i64> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let millis = map.get(DATE_KEY)?;
    millis
        .as_i64()
        .or_else(|| millis.as_f64().map(|f| f as i64))
}

pub fn is_date(value: &Value) -> bool {
    date_millis(value).is_some()
}

pub fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(date_millis(value)?).single()
}

/// Scalars and dates; the only values usable as exact-match index keys
pub fn is_primitive(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        other => is_date(other),
    }
}

// ===== Validation =====

fn check_key(key: &str, value: &Value) -> Result<()> {
    if key.starts_with('$') {
        let reserved = match key {
            DATE_KEY => value.is_number(),
            DELETED_KEY => value == &Value::Bool(true),
            INDEX_CREATED_KEY | INDEX_REMOVED_KEY => true,
            _ => false,
        };
        if !reserved {
            return Err(NestDbError::InvalidFieldName(format!(
                "Field names cannot begin with the $ character ({})",
                key
            )));
        }
    }

    if key.contains('.') {
        return Err(NestDbError::InvalidFieldName(format!(
            "Field names cannot contain a . ({})",
            key
        )));
    }

    Ok(())
}

/// Recursively rejects field names starting with `$` (reserved markers
/// excepted) or containing a `.`
pub fn check_object(value: &Value) -> Result<()> {
    match value {
        Value::Array(items) => items.iter().try_for_each(check_object),
        Value::Object(map) => {
            for (key, child) in map {
                check_key(key, child)?;
                check_object(child)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn check_document(doc: &Document) -> Result<()> {
    for (key, child) in doc.as_map() {
        check_key(key, child)?;
        check_object(child)?;
    }
    Ok(())
}

// ===== Copy / serialization =====

/// Deep copy. In strict mode keys beginning with `$` or containing a `.` are
/// dropped; dates are always kept whole.
pub fn deep_copy(value: &Value, strict: bool) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| deep_copy(v, strict)).collect()),
        Value::Object(_) if is_date(value) => value.clone(),
        Value::Object(map) => {
            let copied = map
                .iter()
                .filter(|(key, _)| !strict || (!key.starts_with('$') && !key.contains('.')))
                .map(|(key, v)| (key.clone(), deep_copy(v, strict)))
                .collect();
            Value::Object(copied)
        }
        other => other.clone(),
    }
}

pub fn deep_copy_document(doc: &Document, strict: bool) -> Document {
    match deep_copy(&Value::Object(doc.0.clone()), strict) {
        Value::Object(map) => Document(map),
        _ => Document::new(),
    }
}

/// One datafile line, without the trailing newline
pub fn serialize(doc: &Document) -> Result<String> {
    check_document(doc)?;
    doc.to_json()
}

pub fn deserialize(line: &str) -> Result<Document> {
    Document::from_json(line)
}

// ===== Dot paths =====

/// Navigates `path` ("a.b.c") inside `doc`.
///
/// A numeric segment indexes into an array; any other segment applied to an
/// array is mapped over its elements, yielding an array of the results
/// (elements lacking the field are left out).
pub fn get_dot_value<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<Cow<'a, Value>> {
    let parts: Vec<&str> = path.split('.').collect();
    let (first, rest) = parts.split_first()?;
    let child = doc.get(*first)?;
    dot_value(child, rest)
}

/// Same as [`get_dot_value`], starting from any value (arrays included)
pub fn get_dot_value_in<'a>(value: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    match value {
        Value::Object(_) | Value::Array(_) => {
            let parts: Vec<&str> = path.split('.').collect();
            dot_value(value, &parts)
        }
        _ => None,
    }
}

fn dot_value<'a>(value: &'a Value, parts: &[&str]) -> Option<Cow<'a, Value>> {
    let Some((first, rest)) = parts.split_first() else {
        return Some(Cow::Borrowed(value));
    };

    match value {
        Value::Object(map) => dot_value(map.get(*first)?, rest),
        Value::Array(items) => {
            if let Ok(i) = first.parse::<usize>() {
                return dot_value(items.get(i)?, rest);
            }
            let mapped: Vec<Value> = items
                .iter()
                .filter_map(|item| dot_value(item, parts).map(Cow::into_owned))
                .collect();
            // no element holds the path
            if mapped.is_empty() {
                return None;
            }
            Some(Cow::Owned(Value::Array(mapped)))
        }
        _ => None,
    }
}

// ===== Ids =====

/// Random alphanumeric token drawn from the OS CSPRNG (via uuid v4)
pub fn random_token(len: usize) -> String {
    let mut token = String::with_capacity(len + 32);
    while token.len() < len {
        token.push_str(&Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

/// Candidate `_id` for a new document
pub fn new_id() -> String {
    random_token(16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_document_from_non_object_fails() {
        assert!(Document::from_value(json!([1, 2])).is_err());
        assert!(Document::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_document_id_and_fields() {
        let mut d = doc(json!({"_id": "abc", "name": "Alice"}));
        assert_eq!(d.id(), Some(&json!("abc")));
        assert_eq!(d.get("name"), Some(&json!("Alice")));

        d.insert("age", json!(30));
        assert!(d.contains("age"));
        assert_eq!(d.remove("age"), Some(json!(30)));
        assert!(!d.contains("age"));
    }

    #[test]
    fn test_check_object_rejects_dollar_and_dot() {
        assert!(check_object(&json!({"$set": 1})).is_err());
        assert!(check_object(&json!({"a.b": 1})).is_err());
        assert!(check_object(&json!({"nested": [{"$bad": 1}]})).is_err());
        assert!(matches!(
            check_object(&json!({"deep": {"x.y": 2}})),
            Err(NestDbError::InvalidFieldName(_))
        ));
    }

    #[test]
    fn test_check_object_accepts_reserved_markers() {
        assert!(check_object(&json!({"when": {"$$date": 1000}})).is_ok());
        assert!(check_object(&json!({"$$deleted": true, "_id": "x"})).is_ok());
        assert!(check_object(&json!({"$$indexCreated": {"fieldName": "a"}})).is_ok());
        assert!(check_object(&json!({"$$indexRemoved": "a"})).is_ok());

        // markers with the wrong payload are still rejected
        assert!(check_object(&json!({"$$deleted": false})).is_err());
        assert!(check_object(&json!({"$$date": "soon"})).is_err());
    }

    #[test]
    fn test_serialize_roundtrip_with_dates() {
        let original = doc(json!({
            "_id": "k1",
            "created": date_from_millis(1_700_000_000_123),
            "tags": ["a", "b"],
            "nested": {"when": date_from_millis(42), "n": 1.5},
        }));

        let line = serialize(&original).unwrap();
        assert!(!line.contains('\n'));
        let restored = deserialize(&line).unwrap();

        assert_eq!(restored, original);
        assert_eq!(date_millis(restored.get("created").unwrap()), Some(1_700_000_000_123));
    }

    #[test]
    fn test_serialize_rejects_invalid_keys() {
        let bad = doc(json!({"_id": "1", "$oops": true}));
        assert!(serialize(&bad).is_err());
    }

    #[test]
    fn test_date_helpers() {
        let at = Utc.timestamp_millis_opt(1_000).single().unwrap();
        let value = date(at);
        assert!(is_date(&value));
        assert_eq!(as_datetime(&value), Some(at));
        assert!(!is_date(&json!({"$$date": 1, "other": 2})));
        assert!(!is_date(&json!(1000)));
    }

    #[test]
    fn test_deep_copy_strict_drops_reserved_keys() {
        let value = json!({
            "a": 1,
            "$or": [{"a": 1}],
            "b.c": 2,
            "d": {"$gt": 3, "e": 4},
            "when": {"$$date": 5},
        });
        let copy = deep_copy(&value, true);
        assert_eq!(copy, json!({"a": 1, "d": {"e": 4}, "when": {"$$date": 5}}));

        let loose = deep_copy(&value, false);
        assert_eq!(loose, value);
    }

    #[test]
    fn test_get_dot_value_nested() {
        let d = doc(json!({"a": {"b": {"c": 7}}, "x": 1}));
        assert_eq!(d.get_path("a.b.c").as_deref(), Some(&json!(7)));
        assert_eq!(d.get_path("x").as_deref(), Some(&json!(1)));
        assert!(d.get_path("a.z").is_none());
        assert!(d.get_path("x.y").is_none());
    }

    #[test]
    fn test_get_dot_value_arrays() {
        let d = doc(json!({
            "planets": [{"name": "Earth"}, {"name": "Mars"}, {"moons": 2}],
            "nums": [10, 20, 30],
        }));

        assert_eq!(d.get_path("planets.name").as_deref(), Some(&json!(["Earth", "Mars"])));
        assert_eq!(d.get_path("planets.1.name").as_deref(), Some(&json!("Mars")));
        assert_eq!(d.get_path("nums.2").as_deref(), Some(&json!(30)));
        assert!(d.get_path("nums.5").is_none());
        assert!(d.get_path("planets.rings").is_none());

        let list = json!([{"a": 1}, {"a": 2}]);
        assert_eq!(get_dot_value_in(&list, "a").as_deref(), Some(&json!([1, 2])));
        assert_eq!(get_dot_value_in(&list, "0.a").as_deref(), Some(&json!(1)));
        assert!(get_dot_value_in(&json!(3), "a").is_none());
    }

    #[test]
    fn test_new_id_is_random_alphanumeric() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(random_token(45).len(), 45);
    }
}
