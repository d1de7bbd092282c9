// src/query_planner.rs
// Candidate selection - picks at most one index to narrow a query

use ahash::AHashMap;
use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::document::{is_primitive, Document};
use crate::index::{Bounds, Index};
use crate::query::{Condition, Operator, Query};

/// Query plan - describes where the candidate documents come from
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Every document (no index used)
    CollectionScan,

    /// Exact match of a primitive on an indexed field
    IndexScan { field: String, value: Value },

    /// Exact match on every field of a compound index
    CompoundScan { field: String, key: Value },

    /// `$in` on an indexed field
    IndexInScan { field: String, values: Vec<Value> },

    /// `$lt/$lte/$gt/$gte` on an indexed field
    IndexRangeScan { field: String, bounds: Bounds },
}

/// Query planner - analyzes top-level field conditions against the indexes
pub struct QueryPlanner;

fn primitive_equality(condition: &Condition) -> Option<&Value> {
    condition.equals().filter(|value| is_primitive(value))
}

fn range_bounds(condition: &Condition) -> Option<Bounds> {
    let mut bounds = Bounds::default();
    for op in condition.operators() {
        match op {
            Operator::Gt(v) => bounds.gt = Some(v.clone()),
            Operator::Gte(v) => bounds.gte = Some(v.clone()),
            Operator::Lt(v) => bounds.lt = Some(v.clone()),
            Operator::Lte(v) => bounds.lte = Some(v.clone()),
            _ => {}
        }
    }
    (!bounds.is_empty()).then_some(bounds)
}

impl QueryPlanner {
    /// Choose a plan. Priority: exact match, compound exact match, `$in`,
    /// range, full scan. When several fields qualify for the same step the
    /// last one wins.
    pub fn analyze_query(query: &Query, available_indexes: &[String]) -> QueryPlan {
        let has_index = |field: &str| available_indexes.iter().any(|name| name == field);

        if let Some((field, value)) = query
            .field_conditions()
            .filter(|(field, _)| has_index(*field))
            .filter_map(|(field, cond)| primitive_equality(cond).map(|v| (field, v)))
            .last()
        {
            return QueryPlan::IndexScan {
                field: field.to_string(),
                value: value.clone(),
            };
        }

        for name in available_indexes.iter().filter(|name| name.contains(',')) {
            let mut key = Map::new();
            for part in name.split(',') {
                let exact = query
                    .field_conditions()
                    .filter(|(field, _)| *field == part)
                    .filter_map(|(_, cond)| primitive_equality(cond))
                    .last();
                if let Some(value) = exact {
                    key.insert(part.to_string(), value.clone());
                }
            }
            if key.len() == name.split(',').count() {
                return QueryPlan::CompoundScan {
                    field: name.clone(),
                    key: Value::Object(key),
                };
            }
        }

        if let Some((field, values)) = query
            .field_conditions()
            .filter(|(field, _)| has_index(*field))
            .filter_map(|(field, cond)| {
                cond.operators().iter().find_map(|op| match op {
                    Operator::In(values) => Some((field, values)),
                    _ => None,
                })
            })
            .last()
        {
            return QueryPlan::IndexInScan {
                field: field.to_string(),
                values: values.clone(),
            };
        }

        if let Some((field, bounds)) = query
            .field_conditions()
            .filter(|(field, _)| has_index(*field))
            .filter_map(|(field, cond)| range_bounds(cond).map(|b| (field, b)))
            .last()
        {
            return QueryPlan::IndexRangeScan {
                field: field.to_string(),
                bounds,
            };
        }

        QueryPlan::CollectionScan
    }

    /// Run a plan against the index registry. The `_id` index serves full
    /// scans.
    pub fn candidates(plan: &QueryPlan, indexes: &AHashMap<String, Index>) -> Vec<Arc<Document>> {
        debug!("query plan: {:?}", plan);
        let lookup = |field: &str| indexes.get(field);

        match plan {
            QueryPlan::IndexScan { field, value } => {
                lookup(field).map(|idx| idx.get_matching(value)).unwrap_or_default()
            }
            QueryPlan::CompoundScan { field, key } => {
                lookup(field).map(|idx| idx.get_matching(key)).unwrap_or_default()
            }
            QueryPlan::IndexInScan { field, values } => {
                lookup(field).map(|idx| idx.get_matching_any(values)).unwrap_or_default()
            }
            QueryPlan::IndexRangeScan { field, bounds } => {
                lookup(field).map(|idx| idx.get_between_bounds(bounds)).unwrap_or_default()
            }
            QueryPlan::CollectionScan => lookup("_id").map(Index::get_all).unwrap_or_default(),
        }
    }
}
