/*!
 * @file matcher.rs
 * @brief Filter matcher: evaluates MongoDB-style filter documents against documents
 */

use crate::value::{compare_values, deep_equal, get_path, same_type_class};
use bson::{Bson, Document};
use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::Mutex;

lazy_static! {
    /// Cache for compiled regex patterns, keyed "pattern:options".
    /// LRU with 100 entry limit to prevent memory bloat.
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap()));
}

/// Convert MongoDB-style options (i, m, s, x) to Rust regex inline flags.
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let valid_options: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if valid_options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", valid_options, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Option<Regex> {
    let cache_key = format!("{}:{}", pattern, options);

    {
        let mut cache = REGEX_CACHE.lock().unwrap();
        if let Some(regex) = cache.get(&cache_key) {
            return Some(regex.clone());
        }
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)).ok()?;

    let mut cache = REGEX_CACHE.lock().unwrap();
    cache.put(cache_key, regex.clone());
    Some(regex)
}

/// Evaluate `filter` against `doc`. Total: any filter and any document
/// produce a boolean, and unknown operators match every document.
pub fn matches(filter: &Document, doc: &Document) -> bool {
    filter.iter().all(|(key, value)| match key.as_str() {
        "$and" => logical_and(value, doc),
        "$or" => logical_or(value, doc),
        "$nor" => !logical_or(value, doc),
        path => field_matches(doc, path, value),
    })
}

fn sub_filters(value: &Bson) -> Option<Vec<&Document>> {
    match value {
        Bson::Array(items) => {
            let docs: Vec<&Document> = items
                .iter()
                .filter_map(|item| item.as_document())
                .collect();
            if docs.len() == items.len() {
                Some(docs)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn logical_and(value: &Bson, doc: &Document) -> bool {
    match sub_filters(value) {
        Some(filters) => filters.iter().all(|f| matches(f, doc)),
        // Malformed logical argument: skipped, like an unknown operator.
        None => true,
    }
}

fn logical_or(value: &Bson, doc: &Document) -> bool {
    match sub_filters(value) {
        Some(filters) => filters.iter().any(|f| matches(f, doc)),
        None => true,
    }
}

fn is_operator_object(value: &Bson) -> bool {
    match value {
        Bson::Document(d) => d.keys().any(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(doc: &Document, path: &str, term: &Bson) -> bool {
    let field = get_path(doc, path);
    if is_operator_object(term) {
        let ops = term.as_document().expect("checked above");
        operator_object_matches(field, ops)
    } else {
        equality_matches(field, term)
    }
}

/// Equality with the array-broadcast rule: a sequence field matches if the
/// whole sequence equals the term or if any element does.
fn equality_matches(field: Option<&Bson>, term: &Bson) -> bool {
    match field {
        None => matches!(term, Bson::Null),
        Some(value) => {
            if scalar_equality(value, term) {
                return true;
            }
            if let Bson::Array(items) = value {
                items.iter().any(|elem| scalar_equality(elem, term))
            } else {
                false
            }
        }
    }
}

/// `null` equals both explicit null and missing; everything else is
/// structural equality.
fn scalar_equality(value: &Bson, term: &Bson) -> bool {
    match term {
        Bson::Null => matches!(value, Bson::Null),
        _ => deep_equal(value, term),
    }
}

fn operator_object_matches(field: Option<&Bson>, ops: &Document) -> bool {
    ops.iter().all(|(op, arg)| {
        if op == "$options" {
            // Consumed by the sibling $regex term.
            return true;
        }
        apply_operator(field, op, arg, ops)
    })
}

fn apply_operator(field: Option<&Bson>, op: &str, arg: &Bson, ops: &Document) -> bool {
    match op {
        "$eq" => equality_matches(field, arg),
        "$ne" => !equality_matches(field, arg),
        "$gt" => ordered_matches(field, arg, |ord| ord == Ordering::Greater),
        "$gte" => ordered_matches(field, arg, |ord| ord != Ordering::Less),
        "$lt" => ordered_matches(field, arg, |ord| ord == Ordering::Less),
        "$lte" => ordered_matches(field, arg, |ord| ord != Ordering::Greater),
        "$in" => in_matches(field, arg),
        "$nin" => !in_matches(field, arg),
        "$exists" => exists_matches(field, arg),
        "$regex" => regex_matches(field, arg, ops.get("$options")),
        "$not" => not_matches(field, arg),
        "$size" => size_matches(field, arg),
        "$all" => all_matches(field, arg),
        "$elemMatch" => elem_match(field, arg),
        // Unknown operators are ignored: the term matches every document.
        _ => true,
    }
}

fn ordered_matches<F>(field: Option<&Bson>, arg: &Bson, predicate: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let value = match field {
        Some(v) => v,
        // Ordering operators never match an absent field.
        None => return false,
    };
    // Comparisons are bracketed by type class: a string field never
    // satisfies a numeric $gt.
    if same_type_class(value, arg) && predicate(compare_values(value, arg)) {
        return true;
    }
    if let Bson::Array(items) = value {
        items
            .iter()
            .any(|elem| same_type_class(elem, arg) && predicate(compare_values(elem, arg)))
    } else {
        false
    }
}

fn in_matches(field: Option<&Bson>, arg: &Bson) -> bool {
    let candidates = match arg {
        Bson::Array(items) => items,
        // $in without an array cannot hold on anything.
        _ => return false,
    };
    candidates.iter().any(|candidate| equality_matches(field, candidate))
}

fn exists_matches(field: Option<&Bson>, arg: &Bson) -> bool {
    let wanted = match arg {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    };
    // Explicit null still counts as existing.
    field.is_some() == wanted
}

fn regex_matches(field: Option<&Bson>, arg: &Bson, options: Option<&Bson>) -> bool {
    let (pattern, inline_options) = match arg {
        Bson::String(p) => (p.as_str(), String::new()),
        Bson::RegularExpression(re) => (re.pattern.as_str(), re.options.clone()),
        _ => return false,
    };
    let options = match options {
        Some(Bson::String(o)) => o.clone(),
        _ => inline_options,
    };
    let regex = match get_or_compile_regex(pattern, &options) {
        Some(r) => r,
        // Totality: an uncompilable pattern simply never matches.
        None => return false,
    };

    match field {
        Some(Bson::String(s)) => regex.is_match(s),
        Some(Bson::Array(items)) => items.iter().any(|elem| match elem {
            Bson::String(s) => regex.is_match(s),
            _ => false,
        }),
        _ => false,
    }
}

fn not_matches(field: Option<&Bson>, arg: &Bson) -> bool {
    match arg {
        Bson::Document(ops) => !operator_object_matches(field, ops),
        Bson::RegularExpression(_) => {
            let mut ops = Document::new();
            ops.insert("$regex", arg.clone());
            !operator_object_matches(field, &ops)
        }
        // Malformed $not argument: skipped.
        _ => true,
    }
}

fn size_matches(field: Option<&Bson>, arg: &Bson) -> bool {
    let wanted = match arg {
        Bson::Int32(n) => *n as i64,
        Bson::Int64(n) => *n,
        Bson::Double(d) if d.fract() == 0.0 => *d as i64,
        _ => return false,
    };
    // $size never matches a non-sequence value.
    match field {
        Some(Bson::Array(items)) => items.len() as i64 == wanted,
        _ => false,
    }
}

fn all_matches(field: Option<&Bson>, arg: &Bson) -> bool {
    let wanted = match arg {
        Bson::Array(items) => items,
        _ => return false,
    };
    let elements = match field {
        Some(Bson::Array(items)) => items,
        _ => return false,
    };
    wanted
        .iter()
        .all(|w| elements.iter().any(|elem| deep_equal(elem, w)))
}

/// Apply a single filter term (literal or operator object) to a standalone
/// value, as `$pull` and `$elemMatch` do for sequence elements.
pub(crate) fn value_matches_condition(value: &Bson, condition: &Bson) -> bool {
    if is_operator_object(condition) {
        let ops = condition.as_document().expect("operator object is a document");
        return operator_object_matches(Some(value), ops);
    }
    match (condition, value) {
        (Bson::Document(filter), Bson::Document(target)) => matches(filter, target),
        _ => deep_equal(value, condition),
    }
}

fn elem_match(field: Option<&Bson>, arg: &Bson) -> bool {
    let sub_filter = match arg {
        Bson::Document(d) => d,
        _ => return false,
    };
    let elements = match field {
        Some(Bson::Array(items)) => items,
        _ => return false,
    };

    let all_operator_keys =
        !sub_filter.is_empty() && sub_filter.keys().all(|k| k.starts_with('$'));

    elements.iter().any(|elem| {
        if all_operator_keys {
            // Pure operator object: applied against the element as a scalar.
            operator_object_matches(Some(elem), sub_filter)
        } else {
            match elem {
                Bson::Document(elem_doc) => matches(sub_filter, elem_doc),
                _ => false,
            }
        }
    })
}
