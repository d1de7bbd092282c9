// src/modifier.rs
// Update documents: whole-document replacement or `$` modifiers

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::compare::compare_things;
use crate::document::{check_document, deep_copy, Document};
use crate::error::{NestDbError, Result};
use crate::query::ElementMatcher;

const MODIFIERS: [&str; 9] = [
    "$set", "$unset", "$inc", "$push", "$addToSet", "$pop", "$pull", "$max", "$min",
];

fn invalid(msg: impl Into<String>) -> NestDbError {
    NestDbError::InvalidUpdate(msg.into())
}

/// Does the update use `$` modifiers (as opposed to a replacement document)
pub fn has_modifiers(update: &Value) -> bool {
    update
        .as_object()
        .map_or(false, |map| map.keys().any(|k| k.starts_with('$')))
}

/// Apply `update` to a copy of `doc`.
///
/// Without modifiers the update replaces the document, keeping its `_id`.
/// Either way the `_id` cannot change.
pub fn modify(doc: &Document, update: &Value) -> Result<Document> {
    let Value::Object(update_map) = update else {
        return Err(invalid(format!("update must be an object, got {}", update)));
    };

    if let Some(new_id) = update_map.get("_id") {
        if doc.id() != Some(new_id) {
            return Err(invalid("You cannot change a document's _id"));
        }
    }

    let modifiers = update_map.keys().filter(|k| k.starts_with('$')).count();
    if modifiers != 0 && modifiers != update_map.len() {
        return Err(invalid("You cannot mix modifiers and normal fields"));
    }

    let new_doc = if modifiers == 0 {
        let mut replacement = match deep_copy(update, false) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(id) = doc.id() {
            replacement.insert("_id".to_string(), id.clone());
        }
        Document::from(replacement)
    } else {
        let mut value = doc.to_value();
        for (modifier, args) in update_map {
            if !MODIFIERS.contains(&modifier.as_str()) {
                return Err(invalid(format!("Unknown modifier {}", modifier)));
            }
            let Value::Object(args) = args else {
                return Err(invalid(format!("Modifier {}'s argument must be an object", modifier)));
            };
            for (field, arg) in args {
                apply_modifier(&mut value, modifier, field, arg)?;
            }
        }
        Document::from_value(value)?
    };

    check_document(&new_doc)?;
    if doc.id() != new_doc.id() {
        return Err(invalid("You can't change a document's _id"));
    }
    Ok(new_doc)
}

type LastStep<'a> = dyn FnMut(Option<Value>) -> Result<Option<Value>> + 'a;

fn apply_modifier(doc: &mut Value, modifier: &str, field: &str, arg: &Value) -> Result<()> {
    let parts: Vec<&str> = field.split('.').collect();
    let mut step = |current: Option<Value>| -> Result<Option<Value>> {
        match modifier {
            "$set" => Ok(Some(arg.clone())),
            "$unset" => Ok(None),
            "$inc" => inc(current, arg),
            "$push" => push(current, arg),
            "$addToSet" => add_to_set(current, arg),
            "$pop" => pop(current, arg),
            "$pull" => pull(current, arg),
            "$max" => keep_extreme(current, arg, Ordering::Greater),
            "$min" => keep_extreme(current, arg, Ordering::Less),
            other => Err(invalid(format!("Unknown modifier {}", other))),
        }
    };
    modify_path(doc, &parts, modifier == "$unset", &mut step)
}

/// Walk `parts` inside `container`, creating missing intermediate objects
/// (unless unsetting), then hand the last field's current value to `step`.
/// Paths that cross a scalar are left alone.
fn modify_path(container: &mut Value, parts: &[&str], unset: bool, step: &mut LastStep<'_>) -> Result<()> {
    let Some((first, rest)) = parts.split_first() else {
        return Ok(());
    };

    match container {
        Value::Object(map) => {
            if rest.is_empty() {
                let current = map.get_mut(*first).map(Value::take);
                match step(current)? {
                    Some(value) => {
                        map.insert(first.to_string(), value);
                    }
                    None => {
                        map.remove(*first);
                    }
                }
                return Ok(());
            }

            if !map.contains_key(*first) {
                if unset {
                    return Ok(());
                }
                map.insert(first.to_string(), Value::Object(Map::new()));
            }
            match map.get_mut(*first) {
                Some(child) => modify_path(child, rest, unset, step),
                None => Ok(()),
            }
        }
        Value::Array(items) => {
            let Some(item) = first.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                return Ok(());
            };
            if rest.is_empty() {
                let current = item.take();
                *item = step(Some(current))?.unwrap_or(Value::Null);
                return Ok(());
            }
            modify_path(item, rest, unset, step)
        }
        _ => Ok(()),
    }
}

fn add_numbers(a: &Number, b: &Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map_or(Value::Null, Value::Number)
}

fn inc(current: Option<Value>, arg: &Value) -> Result<Option<Value>> {
    let Value::Number(delta) = arg else {
        return Err(invalid(format!("{} must be a number", arg)));
    };
    match current {
        None => Ok(Some(arg.clone())),
        Some(Value::Number(n)) => Ok(Some(add_numbers(&n, delta))),
        Some(_) => Err(invalid("Don't use the $inc modifier on non-number fields")),
    }
}

fn into_array(current: Option<Value>, missing_ok: bool, msg: &str) -> Result<Vec<Value>> {
    match current {
        None if missing_ok => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        _ => Err(invalid(msg)),
    }
}

fn slice_items(items: Vec<Value>, n: i64) -> Vec<Value> {
    let len = items.len() as i64;
    let (start, end) = match n.cmp(&0) {
        Ordering::Equal => (0, 0),
        Ordering::Less => ((len + n).max(0), len),
        Ordering::Greater => (0, n.min(len)),
    };
    items
        .into_iter()
        .skip(start as usize)
        .take((end - start) as usize)
        .collect()
}

fn push(current: Option<Value>, arg: &Value) -> Result<Option<Value>> {
    let mut items = into_array(current, true, "Can't $push an element on non-array values")?;

    match arg {
        Value::Object(spec) if spec.contains_key("$each") || spec.contains_key("$slice") => {
            let Some(each) = spec.get("$each") else {
                return Err(invalid("$slice is only compatible with $each"));
            };
            if spec.keys().any(|k| k != "$each" && k != "$slice") {
                return Err(invalid("Can only use $slice in conjunction with $each when $push to array"));
            }
            let Value::Array(each) = each else {
                return Err(invalid("$each requires an array value"));
            };
            items.extend(each.iter().cloned());

            if let Some(slice) = spec.get("$slice") {
                let n = slice
                    .as_i64()
                    .ok_or_else(|| invalid(format!("$slice requires an integer, got {}", slice)))?;
                items = slice_items(items, n);
            }
        }
        other => items.push(other.clone()),
    }

    Ok(Some(Value::Array(items)))
}

fn add_to_set(current: Option<Value>, arg: &Value) -> Result<Option<Value>> {
    let mut items = into_array(current, true, "Can't $addToSet an element on non-array values")?;

    let additions: Vec<&Value> = match arg {
        Value::Object(spec) if spec.contains_key("$each") => {
            if spec.len() > 1 {
                return Err(invalid("Can't use another field in conjunction with $each"));
            }
            match spec.get("$each") {
                Some(Value::Array(each)) => each.iter().collect(),
                _ => return Err(invalid("$each requires an array value")),
            }
        }
        other => vec![other],
    };

    for value in additions {
        if !items
            .iter()
            .any(|item| compare_things(Some(item), Some(value)) == Ordering::Equal)
        {
            items.push(value.clone());
        }
    }
    Ok(Some(Value::Array(items)))
}

fn pop(current: Option<Value>, arg: &Value) -> Result<Option<Value>> {
    let mut items = into_array(current, false, "Can't $pop an element from non-array values")?;
    let n = arg
        .as_f64()
        .ok_or_else(|| invalid(format!("{} isn't an integer, can't use it with $pop", arg)))?;

    if n > 0.0 {
        items.pop();
    } else if n < 0.0 && !items.is_empty() {
        items.remove(0);
    }
    Ok(Some(Value::Array(items)))
}

fn pull(current: Option<Value>, arg: &Value) -> Result<Option<Value>> {
    let mut items = into_array(current, false, "Can't $pull an element from non-array values")?;
    let matcher = ElementMatcher::compile(arg)?;
    items.retain(|item| !matcher.matches(item));
    Ok(Some(Value::Array(items)))
}

fn keep_extreme(current: Option<Value>, arg: &Value, wins: Ordering) -> Result<Option<Value>> {
    match current {
        Some(existing) if compare_things(Some(arg), Some(&existing)) != wins => Ok(Some(existing)),
        _ => Ok(Some(arg.clone())),
    }
}
