/*!
 * @file update.rs
 * @brief Update operator engine: applies update documents to a target document
 */

use crate::error::{MirageError, Result};
use crate::matcher::value_matches_condition;
use crate::value::{compare_values, deep_equal, get_path, set_path, unset_path};
use bson::{Bson, Document};
use std::cmp::Ordering;

/// Operators in their fixed application order. Within one operator all of
/// its field specs apply before the next operator runs.
const OPERATOR_ORDER: [&str; 12] = [
    "$rename",
    "$unset",
    "$set",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$currentDate",
    "$addToSet",
    "$push",
    "$pop",
    "$pull",
];

/// Apply an update-operator document to `doc`, returning the new document
/// and whether it differs from the input. The update document must be
/// non-empty and all of its top-level keys must be known operators.
pub fn apply(update: &Document, doc: &Document) -> Result<(Document, bool)> {
    if update.is_empty() {
        return Err(MirageError::InvalidOperation(
            "update document must not be empty".to_string(),
        ));
    }
    for key in update.keys() {
        if !OPERATOR_ORDER.contains(&key.as_str()) {
            return Err(MirageError::InvalidOperation(format!(
                "unknown update operator: {}",
                key
            )));
        }
    }

    let mut result = doc.clone();
    for op in OPERATOR_ORDER {
        let spec = match update.get(op) {
            Some(Bson::Document(spec)) => spec,
            Some(_) => {
                return Err(MirageError::InvalidOperation(format!(
                    "{} requires an object argument",
                    op
                )))
            }
            None => continue,
        };
        apply_operator(&mut result, op, spec)?;
    }

    let modified = !deep_equal(
        &Bson::Document(result.clone()),
        &Bson::Document(doc.clone()),
    );
    Ok((result, modified))
}

fn apply_operator(doc: &mut Document, op: &str, spec: &Document) -> Result<()> {
    for (path, arg) in spec {
        // _id is immutable: writes targeting it are silently skipped.
        if path == "_id" {
            continue;
        }
        match op {
            "$rename" => apply_rename(doc, path, arg)?,
            "$unset" => {
                unset_path(doc, path)?;
            }
            "$set" => set_path(doc, path, arg.clone())?,
            "$inc" => apply_arith(doc, path, arg, "$inc")?,
            "$mul" => apply_arith(doc, path, arg, "$mul")?,
            "$min" => apply_extremum(doc, path, arg, Ordering::Less)?,
            "$max" => apply_extremum(doc, path, arg, Ordering::Greater)?,
            "$currentDate" => apply_current_date(doc, path, arg)?,
            "$addToSet" => apply_add_to_set(doc, path, arg)?,
            "$push" => apply_push(doc, path, arg)?,
            "$pop" => apply_pop(doc, path, arg)?,
            "$pull" => apply_pull(doc, path, arg)?,
            _ => unreachable!("operator validated by apply()"),
        }
    }
    Ok(())
}

fn apply_rename(doc: &mut Document, from: &str, arg: &Bson) -> Result<()> {
    let to = match arg {
        Bson::String(to) => to,
        _ => {
            return Err(MirageError::InvalidOperation(
                "$rename target must be a string".to_string(),
            ))
        }
    };
    if to == "_id" {
        return Ok(());
    }
    let value = match get_path(doc, from) {
        Some(v) => v.clone(),
        None => return Ok(()),
    };
    unset_path(doc, from)?;
    set_path(doc, to, value)
}

fn numeric_operand(arg: &Bson, op: &str) -> Result<(f64, bool)> {
    match arg {
        Bson::Int32(n) => Ok((*n as f64, true)),
        Bson::Int64(n) => Ok((*n as f64, true)),
        Bson::Double(d) => Ok((*d, false)),
        _ => Err(MirageError::InvalidOperation(format!(
            "{} requires a numeric argument",
            op
        ))),
    }
}

fn apply_arith(doc: &mut Document, path: &str, arg: &Bson, op: &str) -> Result<()> {
    let (operand, operand_is_int) = numeric_operand(arg, op)?;
    let (current, current_is_int) = match get_path(doc, path) {
        None => (0.0, true),
        Some(Bson::Int32(n)) => (*n as f64, true),
        Some(Bson::Int64(n)) => (*n as f64, true),
        Some(Bson::Double(d)) => (*d, false),
        Some(_) => {
            return Err(MirageError::InvalidOperation(format!(
                "cannot apply {} to a non-numeric value at '{}'",
                op, path
            )))
        }
    };

    let result = match op {
        "$inc" => current + operand,
        // A missing $mul target becomes 0, not the operand.
        "$mul" => current * operand,
        _ => unreachable!(),
    };

    let value = if operand_is_int && current_is_int && result.fract() == 0.0 {
        Bson::Int64(result as i64)
    } else {
        Bson::Double(result)
    };
    set_path(doc, path, value)
}

fn apply_extremum(doc: &mut Document, path: &str, arg: &Bson, wanted: Ordering) -> Result<()> {
    let replace = match get_path(doc, path) {
        None => true,
        Some(current) => compare_values(arg, current) == wanted,
    };
    if replace {
        set_path(doc, path, arg.clone())?;
    }
    Ok(())
}

fn apply_current_date(doc: &mut Document, path: &str, arg: &Bson) -> Result<()> {
    let now = chrono::Utc::now();
    let value = match arg {
        Bson::Boolean(true) => Bson::DateTime(bson::DateTime::from_chrono(now)),
        Bson::Document(type_spec) => match type_spec.get_str("$type") {
            Ok("date") => Bson::DateTime(bson::DateTime::from_chrono(now)),
            Ok("timestamp") => Bson::Timestamp(bson::Timestamp {
                time: now.timestamp() as u32,
                increment: 1,
            }),
            _ => {
                return Err(MirageError::InvalidOperation(
                    "$currentDate $type must be 'date' or 'timestamp'".to_string(),
                ))
            }
        },
        _ => {
            return Err(MirageError::InvalidOperation(
                "$currentDate argument must be true or a $type spec".to_string(),
            ))
        }
    };
    set_path(doc, path, value)
}

fn target_array<'a>(doc: &'a mut Document, path: &str, op: &str) -> Result<Option<&'a mut Vec<Bson>>> {
    // Probe with a shared borrow first so error cases never alias the
    // mutable walk below.
    match get_path(doc, path) {
        None => return Ok(None),
        Some(Bson::Array(_)) => {}
        Some(_) => {
            return Err(MirageError::InvalidOperation(format!(
                "{} target at '{}' is not a sequence",
                op, path
            )))
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut current: &mut Bson = match doc.get_mut(segments[0]) {
        Some(v) => v,
        None => return Ok(None),
    };
    for segment in &segments[1..] {
        current = match current {
            Bson::Document(d) => match d.get_mut(*segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Bson::Array(arr) => {
                let index: usize = segment.parse().map_err(|_| {
                    MirageError::InvalidOperation(format!(
                        "{}: non-numeric index '{}'",
                        op, segment
                    ))
                })?;
                match arr.get_mut(index) {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
    }
    match current {
        Bson::Array(arr) => Ok(Some(arr)),
        _ => Ok(None),
    }
}

fn apply_push(doc: &mut Document, path: &str, arg: &Bson) -> Result<()> {
    let (items, position, slice, sort) = parse_push_spec(arg)?;

    if get_path(doc, path).is_none() {
        set_path(doc, path, Bson::Array(Vec::new()))?;
    }
    let arr = target_array(doc, path, "$push")?.ok_or_else(|| {
        MirageError::InvalidOperation(format!("$push target at '{}' is not a sequence", path))
    })?;

    let insert_at = position
        .map(|p| (p.max(0) as usize).min(arr.len()))
        .unwrap_or(arr.len());
    for (offset, item) in items.into_iter().enumerate() {
        arr.insert(insert_at + offset, item);
    }

    if let Some(sort_spec) = sort {
        sort_elements(arr, &sort_spec);
    }

    if let Some(n) = slice {
        if n >= 0 {
            arr.truncate(n as usize);
        } else {
            let keep = (-n) as usize;
            if arr.len() > keep {
                arr.drain(..arr.len() - keep);
            }
        }
    }
    Ok(())
}

fn parse_push_spec(arg: &Bson) -> Result<(Vec<Bson>, Option<i64>, Option<i64>, Option<Bson>)> {
    let spec = match arg {
        Bson::Document(spec) if spec.contains_key("$each") => spec,
        _ => return Ok((vec![arg.clone()], None, None, None)),
    };

    let items = match spec.get("$each") {
        Some(Bson::Array(items)) => items.clone(),
        _ => {
            return Err(MirageError::InvalidOperation(
                "$push $each requires a sequence".to_string(),
            ))
        }
    };
    let position = spec.get("$position").and_then(Bson::as_i64_or_i32);
    let slice = spec.get("$slice").and_then(Bson::as_i64_or_i32);
    let sort = spec.get("$sort").cloned();
    Ok((items, position, slice, sort))
}

trait AsI64OrI32 {
    fn as_i64_or_i32(&self) -> Option<i64>;
}

impl AsI64OrI32 for Bson {
    fn as_i64_or_i32(&self) -> Option<i64> {
        match self {
            Bson::Int32(n) => Some(*n as i64),
            Bson::Int64(n) => Some(*n),
            Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }
}

fn sort_elements(arr: &mut [Bson], sort_spec: &Bson) {
    match sort_spec {
        Bson::Int32(dir) => sort_primitives(arr, *dir as i64),
        Bson::Int64(dir) => sort_primitives(arr, *dir),
        Bson::Document(keys) => {
            arr.sort_by(|a, b| {
                for (key, dir) in keys {
                    let descending = matches!(dir.as_i64_or_i32(), Some(d) if d < 0);
                    let va = a.as_document().and_then(|d| get_path(d, key));
                    let vb = b.as_document().and_then(|d| get_path(d, key));
                    let mut ord = crate::value::compare_optional(va, vb);
                    if descending {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        _ => {}
    }
}

fn sort_primitives(arr: &mut [Bson], direction: i64) {
    arr.sort_by(|a, b| {
        let ord = compare_values(a, b);
        if direction < 0 {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn apply_add_to_set(doc: &mut Document, path: &str, arg: &Bson) -> Result<()> {
    let items = match arg {
        Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => {
                return Err(MirageError::InvalidOperation(
                    "$addToSet $each requires a sequence".to_string(),
                ))
            }
        },
        _ => vec![arg.clone()],
    };

    if get_path(doc, path).is_none() {
        set_path(doc, path, Bson::Array(Vec::new()))?;
    }
    let arr = target_array(doc, path, "$addToSet")?.ok_or_else(|| {
        MirageError::InvalidOperation(format!(
            "$addToSet target at '{}' is not a sequence",
            path
        ))
    })?;

    for item in items {
        if !arr.iter().any(|existing| deep_equal(existing, &item)) {
            arr.push(item);
        }
    }
    Ok(())
}

fn apply_pop(doc: &mut Document, path: &str, arg: &Bson) -> Result<()> {
    let direction = arg.as_i64_or_i32().ok_or_else(|| {
        MirageError::InvalidOperation("$pop requires 1 or -1".to_string())
    })?;
    if direction != 1 && direction != -1 {
        return Err(MirageError::InvalidOperation(
            "$pop requires 1 or -1".to_string(),
        ));
    }
    let arr = match target_array(doc, path, "$pop")? {
        Some(arr) => arr,
        None => return Ok(()),
    };
    if arr.is_empty() {
        return Ok(());
    }
    if direction == 1 {
        arr.pop();
    } else {
        arr.remove(0);
    }
    Ok(())
}

fn apply_pull(doc: &mut Document, path: &str, arg: &Bson) -> Result<()> {
    let arr = match target_array(doc, path, "$pull")? {
        Some(arr) => arr,
        None => return Ok(()),
    };
    arr.retain(|elem| !value_matches_condition(elem, arg));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_empty_update_rejected() {
        assert!(apply(&doc! {}, &doc! {"_id": 1}).is_err());
    }

    #[test]
    fn test_non_operator_key_rejected() {
        assert!(apply(&doc! {"name": "x"}, &doc! {"_id": 1}).is_err());
    }

    #[test]
    fn test_id_is_immutable() {
        let (out, modified) = apply(&doc! {"$set": {"_id": 99, "a": 1}}, &doc! {"_id": 1}).unwrap();
        assert_eq!(out.get_i32("_id").unwrap(), 1);
        assert_eq!(out.get_i32("a").unwrap(), 1);
        assert!(modified);
    }

    #[test]
    fn test_inc_missing_starts_at_zero() {
        let (out, _) = apply(&doc! {"$inc": {"n": 5}}, &doc! {"_id": 1}).unwrap();
        assert_eq!(out.get_i64("n").unwrap(), 5);
    }

    #[test]
    fn test_mul_missing_becomes_zero() {
        let (out, _) = apply(&doc! {"$mul": {"n": 5}}, &doc! {"_id": 1}).unwrap();
        assert_eq!(out.get_i64("n").unwrap(), 0);
    }

    #[test]
    fn test_inc_non_numeric_fails() {
        assert!(apply(&doc! {"$inc": {"n": 1}}, &doc! {"_id": 1, "n": "x"}).is_err());
    }

    #[test]
    fn test_apply_is_deterministic() {
        let update = doc! {"$set": {"a.b": 2}, "$inc": {"n": 3}, "$push": {"xs": 7}};
        let base = doc! {"_id": 1, "n": 1, "xs": [5]};
        let (first, _) = apply(&update, &base).unwrap();
        let (second, _) = apply(&update, &base).unwrap();
        assert_eq!(first, second);
    }
}
