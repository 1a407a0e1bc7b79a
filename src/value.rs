/*!
 * @file value.rs
 * @brief Document value model: dotted-path access, total ordering, structural equality
 */

use crate::error::{MirageError, Result};
use bson::{Bson, Document};
use std::cmp::Ordering;

/// Rank in the cross-type total order. Missing values are treated as null
/// by the comparison helpers, so null shares the lowest rank.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) | Bson::Symbol(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        Bson::RegularExpression(_) => 10,
        _ => 11,
    }
}

/// Whether two values belong to the same type class of the total order
/// (numbers with numbers, strings with strings, ...). Ordered filter
/// comparisons are bracketed by type class.
pub fn same_type_class(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

/// Numeric view of a value, when it has one.
pub fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

pub fn is_numeric(value: &Bson) -> bool {
    as_number(value).is_some()
}

fn compare_numbers(a: f64, b: f64) -> Ordering {
    // NaN groups after every other number; two NaNs compare equal so the
    // ordering stays total and stable.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Total order over values: null < number < string < object < sequence <
/// binary < date (with the remaining BSON types ranked after). Strings use
/// raw codepoint order.
pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Bson::Null | Bson::Undefined, _) => Ordering::Equal,
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let ord = compare_values(ea, eb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => {
            if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
                compare_numbers(x, y)
            } else {
                // Same rank but no domain comparison; fall back to the
                // debug rendering so the order stays total.
                format!("{:?}", a).cmp(&format!("{:?}", b))
            }
        }
    }
}

/// Ordering over possibly-missing values. Missing sorts as null.
pub fn compare_optional(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let null = Bson::Null;
    compare_values(a.unwrap_or(&null), b.unwrap_or(&null))
}

/// Structural equality per the document model: sequences compare
/// element-wise in order, mappings by key set (insertion order does not
/// affect equality), numbers numerically across int/double.
pub fn deep_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(ea, eb)| deep_equal(ea, eb))
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, va)| match y.get(k) {
                    Some(vb) => deep_equal(va, vb),
                    None => false,
                })
        }
        _ => {
            if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
                // Two NaNs count as the same element (stable $addToSet).
                x == y || (x.is_nan() && y.is_nan())
            } else {
                a == b
            }
        }
    }
}

/// Resolve a dotted path against a value. Numeric segments index into
/// sequences; on a mapping a segment of "0" is the key "0". Missing
/// segments and traversal through null yield `None`.
pub fn get_value<'a>(value: &'a Bson, path: &str) -> Option<&'a Bson> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Bson::Document(doc) => current = doc.get(segment)?,
            Bson::Array(arr) => {
                let index: usize = segment.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// `get_value` rooted at a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => get_value(doc.get(head)?, rest),
    }
}

/// Write `value` at `path`, creating intermediate mappings as needed. A
/// numeric segment with a sequence parent grows the sequence with null
/// fill. Traversing through a scalar fails the write.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    set_in_document(doc, &segments, value)
}

fn set_in_document(doc: &mut Document, segments: &[&str], value: Bson) -> Result<()> {
    let key = segments[0];
    if segments.len() == 1 {
        doc.insert(key.to_string(), value);
        return Ok(());
    }

    if !doc.contains_key(key) {
        doc.insert(key.to_string(), Bson::Document(Document::new()));
    }
    let child = doc.get_mut(key).expect("key inserted above");
    set_in_value(child, &segments[1..], value)
}

fn set_in_value(target: &mut Bson, segments: &[&str], value: Bson) -> Result<()> {
    match target {
        Bson::Document(doc) => set_in_document(doc, segments, value),
        Bson::Array(arr) => {
            let index: usize = segments[0].parse().map_err(|_| {
                MirageError::InvalidOperation(format!(
                    "cannot index sequence with non-numeric segment '{}'",
                    segments[0]
                ))
            })?;
            while arr.len() <= index {
                arr.push(Bson::Null);
            }
            if segments.len() == 1 {
                arr[index] = value;
                Ok(())
            } else {
                if matches!(arr[index], Bson::Null) {
                    arr[index] = Bson::Document(Document::new());
                }
                set_in_value(&mut arr[index], &segments[1..], value)
            }
        }
        _ => Err(MirageError::InvalidOperation(
            "cannot traverse through scalar".to_string(),
        )),
    }
}

/// Remove the leaf at `path`. Intermediate creation is not attempted;
/// returns whether anything was removed.
pub fn unset_path(doc: &mut Document, path: &str) -> Result<bool> {
    let segments: Vec<&str> = path.split('.').collect();
    unset_in_document(doc, &segments)
}

fn unset_in_document(doc: &mut Document, segments: &[&str]) -> Result<bool> {
    let key = segments[0];
    if segments.len() == 1 {
        return Ok(doc.remove(key).is_some());
    }
    match doc.get_mut(key) {
        None => Ok(false),
        Some(Bson::Document(child)) => unset_in_document(child, &segments[1..]),
        Some(Bson::Array(arr)) => unset_in_array(arr, &segments[1..]),
        Some(_) => Err(MirageError::InvalidOperation(
            "cannot traverse through scalar".to_string(),
        )),
    }
}

fn unset_in_array(arr: &mut Vec<Bson>, segments: &[&str]) -> Result<bool> {
    let index: usize = match segments[0].parse() {
        Ok(i) => i,
        Err(_) => return Ok(false),
    };
    if index >= arr.len() {
        return Ok(false);
    }
    if segments.len() == 1 {
        // Matching server behavior: unsetting an array slot nulls it out
        // instead of shifting later elements.
        arr[index] = Bson::Null;
        return Ok(true);
    }
    match &mut arr[index] {
        Bson::Document(child) => unset_in_document(child, &segments[1..]),
        Bson::Array(child) => unset_in_array(child, &segments[1..]),
        _ => Err(MirageError::InvalidOperation(
            "cannot traverse through scalar".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_get_path_nested() {
        let d = doc! {"address": {"city": "NYC", "zip": 10001}};
        assert_eq!(get_path(&d, "address.city"), Some(&Bson::String("NYC".into())));
        assert_eq!(get_path(&d, "address.missing"), None);
    }

    #[test]
    fn test_get_path_array_index() {
        let d = doc! {"items": [{"name": "a"}, {"name": "b"}]};
        assert_eq!(get_path(&d, "items.1.name"), Some(&Bson::String("b".into())));
        assert_eq!(get_path(&d, "items.5.name"), None);
    }

    #[test]
    fn test_numeric_segment_on_mapping_is_a_key() {
        let d = doc! {"m": {"0": "zero"}};
        assert_eq!(get_path(&d, "m.0"), Some(&Bson::String("zero".into())));
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut d = doc! {};
        set_path(&mut d, "a.b.c", Bson::Int32(1)).unwrap();
        assert_eq!(get_path(&d, "a.b.c"), Some(&Bson::Int32(1)));
    }

    #[test]
    fn test_set_path_grows_array_with_null_fill() {
        let mut d = doc! {"xs": [1]};
        set_path(&mut d, "xs.3", Bson::Int32(9)).unwrap();
        assert_eq!(
            d.get_array("xs").unwrap(),
            &vec![Bson::Int32(1), Bson::Null, Bson::Null, Bson::Int32(9)]
        );
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut d = doc! {"a": 1};
        let err = set_path(&mut d, "a.b", Bson::Int32(2)).unwrap_err();
        assert!(err.to_string().contains("cannot traverse through scalar"));
    }

    #[test]
    fn test_unset_path() {
        let mut d = doc! {"a": {"b": 1, "c": 2}};
        assert!(unset_path(&mut d, "a.b").unwrap());
        assert!(!unset_path(&mut d, "a.b").unwrap());
        assert_eq!(get_path(&d, "a.c"), Some(&Bson::Int32(2)));
    }

    #[test]
    fn test_compare_cross_type_order() {
        let null = Bson::Null;
        let num = Bson::Int32(5);
        let s = Bson::String("a".into());
        let obj = Bson::Document(doc! {});
        let arr = Bson::Array(vec![]);
        assert_eq!(compare_values(&null, &num), Ordering::Less);
        assert_eq!(compare_values(&num, &s), Ordering::Less);
        assert_eq!(compare_values(&s, &obj), Ordering::Less);
        assert_eq!(compare_values(&obj, &arr), Ordering::Less);
    }

    #[test]
    fn test_compare_numbers_mixed_width() {
        assert_eq!(
            compare_values(&Bson::Int64(3), &Bson::Double(3.0)),
            Ordering::Equal
        );
        assert_eq!(
            compare_values(&Bson::Double(f64::NAN), &Bson::Int32(1_000_000)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_deep_equal_mapping_order_insensitive() {
        let a = Bson::Document(doc! {"x": 1, "y": 2});
        let b = Bson::Document(doc! {"y": 2, "x": 1});
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn test_deep_equal_sequence_order_sensitive() {
        let a = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let b = Bson::Array(vec![Bson::Int32(2), Bson::Int32(1)]);
        assert!(!deep_equal(&a, &b));
    }
}
