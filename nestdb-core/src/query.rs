// src/query.rs
// Query language: compiled once, then matched against documents

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::compare::{are_comparable, are_things_equal, compare_things};
use crate::document::{get_dot_value, get_dot_value_in, is_date, is_primitive, Document};
use crate::error::{NestDbError, Result};

/// Rust-side `$where`
pub type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Comparison operators usable on a field
#[derive(Debug, Clone)]
pub enum Operator {
    Lt(Value),           // $lt
    Lte(Value),          // $lte
    Gt(Value),           // $gt
    Gte(Value),          // $gte
    Ne(Value),           // $ne
    In(Vec<Value>),      // $in
    Nin(Vec<Value>),     // $nin
    Exists(bool),        // $exists
    Regex(Regex),        // $regex
    Size(i64),           // $size
    ElemMatch(Box<ElementMatcher>), // $elemMatch
    Not(Box<Condition>), // $not
}

/// What a field has to satisfy: a plain value, or a set of operators
#[derive(Debug, Clone)]
pub enum Condition {
    Equals(Value),
    Operators(Vec<Operator>),
}

/// Matcher applied to single array elements (`$elemMatch`, `$pull`).
///
/// Primitive elements are matched against `value`, documents against
/// `document`.
#[derive(Debug, Clone)]
pub struct ElementMatcher {
    value: Option<Condition>,
    document: Option<Query>,
}

#[derive(Clone)]
enum Clause {
    Field { path: String, condition: Condition },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Not(Box<Query>),
    Where(Predicate),
}

impl fmt::Debug for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Field { path, condition } => write!(f, "{}: {:?}", path, condition),
            Clause::And(queries) => write!(f, "$and: {:?}", queries),
            Clause::Or(queries) => write!(f, "$or: {:?}", queries),
            Clause::Nor(queries) => write!(f, "$nor: {:?}", queries),
            Clause::Not(query) => write!(f, "$not: {:?}", query),
            Clause::Where(_) => write!(f, "$where: <fn>"),
        }
    }
}

/// Compiled query. All clauses have to match.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
    source: Option<Value>,
}

/// Whatever can be turned into a [`Query`]
pub trait IntoQuery {
    fn into_query(self) -> Result<Query>;
}

impl IntoQuery for Query {
    fn into_query(self) -> Result<Query> {
        Ok(self)
    }
}

impl IntoQuery for Value {
    fn into_query(self) -> Result<Query> {
        Query::from_json(&self)
    }
}

impl IntoQuery for &Value {
    fn into_query(self) -> Result<Query> {
        Query::from_json(self)
    }
}

/// Matching target: the top-level document, a nested object or an array
#[derive(Clone, Copy)]
enum Target<'a> {
    Root(&'a Document),
    Object(&'a Map<String, Value>),
    Array(&'a Value),
}

impl<'a> Target<'a> {
    fn lookup(self, path: &str) -> Option<Cow<'a, Value>> {
        match self {
            Target::Root(doc) => get_dot_value(doc.as_map(), path),
            Target::Object(map) => get_dot_value(map, path),
            Target::Array(value) => get_dot_value_in(value, path),
        }
    }
}

fn array_of_queries(op: &str, value: &Value) -> Result<Vec<Query>> {
    match value {
        Value::Array(items) => items.iter().map(Query::from_json).collect(),
        _ => Err(NestDbError::InvalidQuery(format!("{} operator used without an array", op))),
    }
}

impl Query {
    /// Matches every document
    pub fn all() -> Self {
        Query::default()
    }

    /// Parse a JSON query object
    pub fn from_json(json: &Value) -> Result<Self> {
        let Value::Object(map) = json else {
            return Err(NestDbError::InvalidQuery(format!("query must be an object, got {}", json)));
        };

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            let clause = match key.as_str() {
                "$and" => Clause::And(array_of_queries(key, value)?),
                "$or" => Clause::Or(array_of_queries(key, value)?),
                "$nor" => Clause::Nor(array_of_queries(key, value)?),
                "$not" => Clause::Not(Box::new(Query::from_json(value)?)),
                "$where" => {
                    return Err(NestDbError::InvalidQuery(
                        "$where needs a function, use Query::where_fn".to_string(),
                    ))
                }
                op if op.starts_with('$') => {
                    return Err(NestDbError::InvalidQuery(format!("Unknown logical operator {}", op)))
                }
                path => Clause::Field {
                    path: path.to_string(),
                    condition: Condition::parse(value)?,
                },
            };
            clauses.push(clause);
        }

        Ok(Query {
            clauses,
            source: Some(json.clone()),
        })
    }

    /// `$where` with a Rust predicate
    pub fn where_fn<F>(predicate: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        Query {
            clauses: vec![Clause::Where(Arc::new(predicate))],
            source: None,
        }
    }

    /// Both queries have to match
    pub fn and(mut self, other: Query) -> Self {
        self.clauses.extend(other.clauses);
        self.source = match (self.source, other.source) {
            (Some(Value::Object(mut left)), Some(Value::Object(right))) => {
                left.extend(right);
                Some(Value::Object(left))
            }
            (left, None) => left,
            (None, right) => right,
            _ => None,
        };
        self
    }

    /// Either query has to match
    pub fn or(self, other: Query) -> Self {
        Query {
            clauses: vec![Clause::Or(vec![self, other])],
            source: None,
        }
    }

    pub fn negate(self) -> Self {
        Query {
            clauses: vec![Clause::Not(Box::new(self))],
            source: None,
        }
    }

    /// The JSON this query was parsed from, if any
    pub fn source(&self) -> Option<&Value> {
        self.source.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Top-level field conditions, the ones usable with an index
    pub fn field_conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.clauses.iter().filter_map(|clause| match clause {
            Clause::Field { path, condition } => Some((path.as_str(), condition)),
            _ => None,
        })
    }

    /// Does the document match the query
    pub fn matches(&self, document: &Document) -> bool {
        self.matches_target(Target::Root(document))
    }

    fn matches_target(&self, target: Target<'_>) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Field { path, condition } => {
                let value = target.lookup(path);
                condition.matches(value.as_deref(), false)
            }
            Clause::And(queries) => queries.iter().all(|q| q.matches_target(target)),
            Clause::Or(queries) => queries.iter().any(|q| q.matches_target(target)),
            Clause::Nor(queries) => !queries.iter().any(|q| q.matches_target(target)),
            Clause::Not(query) => !query.matches_target(target),
            Clause::Where(predicate) => match target {
                Target::Root(doc) => predicate(doc),
                Target::Object(map) => predicate(&Document::from(map.clone())),
                Target::Array(_) => false,
            },
        })
    }
}

impl Condition {
    /// Parse the right-hand side of a field in a query
    pub fn parse(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Ok(Condition::Equals(value.clone()));
        };
        if is_date(value) {
            return Ok(Condition::Equals(value.clone()));
        }

        let operators = map.keys().filter(|k| k.starts_with('$')).count();
        if operators == 0 {
            return Ok(Condition::Equals(value.clone()));
        }
        if operators != map.len() {
            return Err(NestDbError::InvalidQuery(
                "You cannot mix operators and normal fields".to_string(),
            ));
        }

        map.iter()
            .map(|(op, arg)| Operator::parse(op, arg))
            .collect::<Result<Vec<_>>>()
            .map(Condition::Operators)
    }

    /// Whether an array field is handed to this condition whole rather than
    /// element by element
    fn targets_whole_array(&self) -> bool {
        match self {
            Condition::Equals(value) => value.is_array(),
            Condition::Operators(ops) => ops
                .iter()
                .any(|op| matches!(op, Operator::Size(_) | Operator::ElemMatch(_) | Operator::Not(_))),
        }
    }

    /// Match a (possibly undefined) field value. Unless `whole` is set, an
    /// array matches when any of its elements does.
    pub fn matches(&self, value: Option<&Value>, whole: bool) -> bool {
        if !whole {
            if let Some(Value::Array(items)) = value {
                if self.targets_whole_array() {
                    return self.matches(value, true);
                }
                if let Condition::Operators(ops) = self {
                    // presence is a property of the array itself, even an empty one
                    if ops.iter().any(|op| matches!(op, Operator::Exists(_))) {
                        let (presence, rest): (Vec<Operator>, Vec<Operator>) =
                            ops.iter().cloned().partition(|op| matches!(op, Operator::Exists(_)));
                        if !presence.iter().all(|op| op.matches(value)) {
                            return false;
                        }
                        let rest = Condition::Operators(rest);
                        return rest.operators().is_empty()
                            || items.iter().any(|item| rest.matches(Some(item), false));
                    }
                }
                return items.iter().any(|item| self.matches(Some(item), false));
            }
        }

        match self {
            Condition::Equals(expected) => are_things_equal(value, Some(expected)),
            Condition::Operators(ops) => ops.iter().all(|op| op.matches(value)),
        }
    }

    /// Exact value wanted, if this is a plain equality
    pub fn equals(&self) -> Option<&Value> {
        match self {
            Condition::Equals(value) => Some(value),
            Condition::Operators(_) => None,
        }
    }

    pub fn operators(&self) -> &[Operator] {
        match self {
            Condition::Equals(_) => &[],
            Condition::Operators(ops) => ops,
        }
    }
}

fn is_truthy_exists(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        // empty string counts as true
        _ => true,
    }
}

fn compare_ok(value: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(value) if are_comparable(value, bound) => accept(compare_things(Some(value), Some(bound))),
        _ => false,
    }
}

impl Operator {
    fn parse(op: &str, arg: &Value) -> Result<Self> {
        let operator = match op {
            "$lt" => Operator::Lt(arg.clone()),
            "$lte" => Operator::Lte(arg.clone()),
            "$gt" => Operator::Gt(arg.clone()),
            "$gte" => Operator::Gte(arg.clone()),
            "$ne" => Operator::Ne(arg.clone()),
            "$in" | "$nin" => {
                let Value::Array(items) = arg else {
                    return Err(NestDbError::InvalidQuery(format!("{} operator called with a non-array", op)));
                };
                if op == "$in" {
                    Operator::In(items.clone())
                } else {
                    Operator::Nin(items.clone())
                }
            }
            "$exists" => Operator::Exists(is_truthy_exists(arg)),
            "$regex" => {
                let Value::String(pattern) = arg else {
                    return Err(NestDbError::InvalidQuery("$regex operator called with non regular expression".to_string()));
                };
                let regex = Regex::new(pattern)
                    .map_err(|e| NestDbError::InvalidQuery(format!("invalid $regex: {}", e)))?;
                Operator::Regex(regex)
            }
            "$size" => {
                let size = arg
                    .as_i64()
                    .or_else(|| arg.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(|| NestDbError::InvalidQuery("$size operator called without an integer".to_string()))?;
                Operator::Size(size)
            }
            "$elemMatch" => Operator::ElemMatch(Box::new(ElementMatcher::compile(arg)?)),
            "$not" => Operator::Not(Box::new(Condition::parse(arg)?)),
            other => {
                return Err(NestDbError::InvalidQuery(format!("Unknown comparison function {}", other)))
            }
        };
        Ok(operator)
    }

    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Operator::Lt(bound) => compare_ok(value, bound, |o| o == Ordering::Less),
            Operator::Lte(bound) => compare_ok(value, bound, |o| o != Ordering::Greater),
            Operator::Gt(bound) => compare_ok(value, bound, |o| o == Ordering::Greater),
            Operator::Gte(bound) => compare_ok(value, bound, |o| o != Ordering::Less),
            Operator::Ne(other) => value.is_none() || !are_things_equal(value, Some(other)),
            Operator::In(candidates) => candidates.iter().any(|c| are_things_equal(value, Some(c))),
            Operator::Nin(candidates) => !candidates.iter().any(|c| are_things_equal(value, Some(c))),
            Operator::Exists(exists) => value.is_some() == *exists,
            Operator::Regex(regex) => matches!(value, Some(Value::String(s)) if regex.is_match(s)),
            Operator::Size(size) => {
                matches!(value, Some(Value::Array(items)) if items.len() as i64 == *size)
            }
            Operator::ElemMatch(matcher) => match value {
                Some(Value::Array(items)) => items.iter().any(|item| matcher.matches(item)),
                _ => false,
            },
            Operator::Not(condition) => !condition.matches(value, false),
        }
    }
}

impl ElementMatcher {
    pub fn compile(query: &Value) -> Result<Self> {
        let document = match query {
            Value::Object(_) if !is_date(query) => Query::from_json(query).ok(),
            _ => None,
        };
        let value = match Condition::parse(query) {
            Ok(condition) => Some(condition),
            Err(e) if document.is_none() => return Err(e),
            Err(_) => None,
        };
        Ok(ElementMatcher { value, document })
    }

    /// Does a single array element match
    pub fn matches(&self, element: &Value) -> bool {
        let target = match element {
            Value::Object(map) if !is_primitive(element) => Target::Object(map),
            Value::Array(_) => Target::Array(element),
            _ => return self.matches_value(element),
        };
        match &self.document {
            Some(query) => query.matches_target(target),
            None => self.matches_value(element),
        }
    }

    fn matches_value(&self, element: &Value) -> bool {
        self.value
            .as_ref()
            .map_or(false, |condition| condition.matches(Some(element), false))
    }
}
