// src/compare.rs
// Total ordering and equality across JSON value types

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{Number, Value};

use crate::document::date_millis;

/// Custom string ordering used when sorting cursor results
pub type StringComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Type priority: undefined < null < number < string < boolean < date < array < object
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Bool(_)) => 4,
        Some(v) if date_millis(v).is_some() => 5,
        Some(Value::Array(_)) => 6,
        Some(Value::Object(_)) => 7,
    }
}

pub fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Compare two (possibly undefined) values with byte-wise string ordering
pub fn compare_things(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    compare_things_with(a, b, &|x: &str, y: &str| x.cmp(y))
}

/// Compare two (possibly undefined) values, ordering strings with `compare_strings`
pub fn compare_things_with(
    a: Option<&Value>,
    b: Option<&Value>,
    compare_strings: &dyn Fn(&str, &str) -> Ordering,
) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Number(x)), Some(Value::Number(y))) => compare_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => compare_strings(x, y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let cmp = compare_things_with(Some(left), Some(right), compare_strings);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            if rank_a == 5 {
                // both dates
                return date_millis(a.unwrap_or(&Value::Null))
                    .cmp(&date_millis(b.unwrap_or(&Value::Null)));
            }

            let mut keys_x: Vec<&String> = x.keys().collect();
            let mut keys_y: Vec<&String> = y.keys().collect();
            keys_x.sort();
            keys_y.sort();

            for (kx, ky) in keys_x.iter().zip(keys_y.iter()) {
                let cmp = kx.as_str().cmp(ky.as_str());
                if cmp != Ordering::Equal {
                    return cmp;
                }
                let cmp = compare_things_with(x.get(*kx), y.get(*ky), compare_strings);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            keys_x.len().cmp(&keys_y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Type-aware equality used by query matching. Undefined never equals anything.
pub fn are_things_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Ordering::Equal,
        (Value::Null, _) | (Value::Bool(_), _) | (Value::String(_), _) | (Value::Number(_), _)
        | (_, Value::Null) | (_, Value::Bool(_)) | (_, Value::String(_)) | (_, Value::Number(_)) => a == b,
        _ => {
            let (date_a, date_b) = (date_millis(a), date_millis(b));
            if date_a.is_some() || date_b.is_some() {
                return date_a.is_some() && date_a == date_b;
            }

            match (a, b) {
                (Value::Array(x), Value::Array(y)) => {
                    x.len() == y.len()
                        && x.iter().zip(y.iter()).all(|(l, r)| are_things_equal(Some(l), Some(r)))
                }
                (Value::Object(x), Value::Object(y)) => {
                    x.len() == y.len()
                        && x.iter().all(|(key, value)| are_things_equal(Some(value), y.get(key)))
                }
                _ => false,
            }
        }
    }
}

/// `$lt`-family operators only compare numbers with numbers, strings with
/// strings and dates with dates
pub fn are_comparable(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(_), Value::String(_)) | (Value::Number(_), Value::Number(_)) => true,
        _ => date_millis(a).is_some() && date_millis(b).is_some(),
    }
}

/// Tree key: a possibly undefined value ordered by [`compare_things`]
#[derive(Debug, Clone)]
pub struct IndexKey(pub Option<Value>);

impl IndexKey {
    pub fn new(value: Value) -> Self {
        IndexKey(Some(value))
    }

    pub fn undefined() -> Self {
        IndexKey(None)
    }

    pub fn value(&self) -> Option<&Value> {
        self.0.as_ref()
    }
}

impl From<Value> for IndexKey {
    fn from(value: Value) -> Self {
        IndexKey(Some(value))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_things(self.0.as_ref(), other.0.as_ref())
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "undefined"),
        }
    }
}
