/*!
 * @file expression.rs
 * @brief Aggregation expression evaluator
 */

use crate::value::{as_number, compare_values, deep_equal, get_path};
use bson::{Bson, Document};
use chrono::Datelike;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Variables bound in the current pipeline scope ($$name references,
/// populated by $lookup `let`).
pub type Variables = HashMap<String, Bson>;

/// MongoDB truthiness: null, missing, false and numeric zero are falsy.
pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    }
}

/// Evaluate an expression against `doc`. A missing field path yields
/// `None`; every other expression yields a value.
pub fn evaluate_opt(expr: &Bson, doc: &Document, vars: &Variables) -> Option<Bson> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => {
            Some(vars.get(&s[2..]).cloned().unwrap_or(Bson::Null))
        }
        Bson::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned(),
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .map(|item| evaluate(item, doc, vars))
                .collect(),
        )),
        Bson::Document(map) => {
            if map.len() == 1 {
                let (key, arg) = map.iter().next().expect("len checked");
                if key.starts_with('$') {
                    return Some(evaluate_operator(key, arg, doc, vars));
                }
            }
            // Plain mapping: evaluate each value, emit mapping.
            let mut out = Document::new();
            for (key, value) in map {
                out.insert(key.clone(), evaluate(value, doc, vars));
            }
            Some(Bson::Document(out))
        }
        other => Some(other.clone()),
    }
}

/// `evaluate_opt` with missing collapsed to null.
pub fn evaluate(expr: &Bson, doc: &Document, vars: &Variables) -> Bson {
    evaluate_opt(expr, doc, vars).unwrap_or(Bson::Null)
}

fn evaluate_operator(op: &str, arg: &Bson, doc: &Document, vars: &Variables) -> Bson {
    match op {
        "$literal" => arg.clone(),
        "$eq" => comparison(arg, doc, vars, |_, eq| eq),
        "$ne" => comparison(arg, doc, vars, |_, eq| !eq),
        "$gt" => comparison(arg, doc, vars, |ord, _| ord == Ordering::Greater),
        "$gte" => comparison(arg, doc, vars, |ord, _| ord != Ordering::Less),
        "$lt" => comparison(arg, doc, vars, |ord, _| ord == Ordering::Less),
        "$lte" => comparison(arg, doc, vars, |ord, _| ord != Ordering::Greater),
        "$and" => match arg {
            Bson::Array(items) => Bson::Boolean(
                items.iter().all(|item| is_truthy(&evaluate(item, doc, vars))),
            ),
            single => Bson::Boolean(is_truthy(&evaluate(single, doc, vars))),
        },
        "$or" => match arg {
            Bson::Array(items) => Bson::Boolean(
                items.iter().any(|item| is_truthy(&evaluate(item, doc, vars))),
            ),
            single => Bson::Boolean(is_truthy(&evaluate(single, doc, vars))),
        },
        "$not" => {
            let operand = match arg {
                Bson::Array(items) if items.len() == 1 => &items[0],
                other => other,
            };
            Bson::Boolean(!is_truthy(&evaluate(operand, doc, vars)))
        }
        "$concat" => concat(arg, doc, vars),
        "$add" => fold_numeric(arg, doc, vars, 0.0, |acc, n| acc + n),
        "$multiply" => fold_numeric(arg, doc, vars, 1.0, |acc, n| acc * n),
        "$subtract" => binary_numeric(arg, doc, vars, |a, b| Some(a - b)),
        "$divide" => binary_numeric(arg, doc, vars, |a, b| {
            if b == 0.0 {
                None
            } else {
                Some(a / b)
            }
        }),
        "$year" => date_part(arg, doc, vars, |d| d.year() as i64),
        "$month" => date_part(arg, doc, vars, |d| d.month() as i64),
        "$cond" => cond(arg, doc, vars),
        // Unknown operators are permissive: the argument passes through
        // unchanged. ($group rejects them before evaluation.)
        _ => arg.clone(),
    }
}

fn comparison<F>(arg: &Bson, doc: &Document, vars: &Variables, predicate: F) -> Bson
where
    F: Fn(Ordering, bool) -> bool,
{
    let (a, b) = match arg {
        Bson::Array(items) if items.len() == 2 => {
            (evaluate(&items[0], doc, vars), evaluate(&items[1], doc, vars))
        }
        _ => return Bson::Null,
    };
    let ord = compare_values(&a, &b);
    let eq = deep_equal(&a, &b);
    Bson::Boolean(predicate(ord, eq))
}

fn concat(arg: &Bson, doc: &Document, vars: &Variables) -> Bson {
    let items = match arg {
        Bson::Array(items) => items,
        _ => return Bson::Null,
    };
    let mut out = String::new();
    for item in items {
        match evaluate_opt(item, doc, vars) {
            Some(Bson::String(s)) => out.push_str(&s),
            // Any null or missing operand nulls the whole concat.
            _ => return Bson::Null,
        }
    }
    Bson::String(out)
}

fn fold_numeric<F>(arg: &Bson, doc: &Document, vars: &Variables, init: f64, fold: F) -> Bson
where
    F: Fn(f64, f64) -> f64,
{
    let items = match arg {
        Bson::Array(items) => items,
        single => return evaluate(single, doc, vars),
    };
    let mut acc = init;
    let mut all_int = true;
    for item in items {
        let value = evaluate(item, doc, vars);
        match as_number(&value) {
            Some(n) => {
                if matches!(value, Bson::Double(_)) {
                    all_int = false;
                }
                acc = fold(acc, n);
            }
            None => return Bson::Null,
        }
    }
    if all_int && acc.fract() == 0.0 {
        Bson::Int64(acc as i64)
    } else {
        Bson::Double(acc)
    }
}

fn binary_numeric<F>(arg: &Bson, doc: &Document, vars: &Variables, op: F) -> Bson
where
    F: Fn(f64, f64) -> Option<f64>,
{
    let items = match arg {
        Bson::Array(items) if items.len() == 2 => items,
        _ => return Bson::Null,
    };
    let a = evaluate(&items[0], doc, vars);
    let b = evaluate(&items[1], doc, vars);
    match (as_number(&a), as_number(&b)) {
        (Some(x), Some(y)) => match op(x, y) {
            Some(result) => {
                if matches!((&a, &b), (Bson::Double(_), _) | (_, Bson::Double(_)))
                    || result.fract() != 0.0
                {
                    Bson::Double(result)
                } else {
                    Bson::Int64(result as i64)
                }
            }
            None => Bson::Null,
        },
        _ => Bson::Null,
    }
}

fn date_part<F>(arg: &Bson, doc: &Document, vars: &Variables, part: F) -> Bson
where
    F: Fn(chrono::DateTime<chrono::Utc>) -> i64,
{
    let operand = match arg {
        Bson::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };
    match evaluate(operand, doc, vars) {
        Bson::DateTime(dt) => Bson::Int64(part(dt.to_chrono())),
        _ => Bson::Null,
    }
}

fn cond(arg: &Bson, doc: &Document, vars: &Variables) -> Bson {
    let (condition, then_branch, else_branch) = match arg {
        Bson::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Bson::Document(spec) => {
            match (spec.get("if"), spec.get("then"), spec.get("else")) {
                (Some(i), Some(t), Some(e)) => (i, t, e),
                _ => return Bson::Null,
            }
        }
        _ => return Bson::Null,
    };
    if is_truthy(&evaluate(condition, doc, vars)) {
        evaluate(then_branch, doc, vars)
    } else {
        evaluate(else_branch, doc, vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn eval(expr: Bson, doc: Document) -> Bson {
        evaluate(&expr, &doc, &Variables::new())
    }

    #[test]
    fn test_field_path() {
        assert_eq!(
            eval(Bson::String("$a.b".into()), doc! {"a": {"b": 7}}),
            Bson::Int32(7)
        );
        assert_eq!(eval(Bson::String("$missing".into()), doc! {}), Bson::Null);
    }

    #[test]
    fn test_literal_escapes_dollar() {
        let expr = Bson::Document(doc! {"$literal": "$a"});
        assert_eq!(eval(expr, doc! {"a": 1}), Bson::String("$a".into()));
    }

    #[test]
    fn test_arithmetic() {
        let expr = Bson::Document(doc! {"$add": ["$x", 2, 3]});
        assert_eq!(eval(expr, doc! {"x": 5}), Bson::Int64(10));

        let expr = Bson::Document(doc! {"$divide": ["$x", 0]});
        assert_eq!(eval(expr, doc! {"x": 5}), Bson::Null);
    }

    #[test]
    fn test_cond_document_form() {
        let expr = Bson::Document(doc! {"$cond": {"if": {"$gte": ["$n", 10]}, "then": "big", "else": "small"}});
        assert_eq!(eval(expr.clone(), doc! {"n": 12}), Bson::String("big".into()));
        assert_eq!(eval(expr, doc! {"n": 2}), Bson::String("small".into()));
    }

    #[test]
    fn test_concat_nulls_out() {
        let expr = Bson::Document(doc! {"$concat": ["a", "$missing", "c"]});
        assert_eq!(eval(expr, doc! {}), Bson::Null);
    }

    #[test]
    fn test_unknown_operator_passes_argument_through() {
        let expr = Bson::Document(doc! {"$mystery": [1, 2]});
        assert_eq!(
            eval(expr, doc! {}),
            Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)])
        );
    }

    #[test]
    fn test_variables() {
        let mut vars = Variables::new();
        vars.insert("order_id".to_string(), Bson::Int32(9));
        let expr = Bson::Document(doc! {"$eq": ["$id", "$$order_id"]});
        assert_eq!(
            evaluate(&expr, &doc! {"id": 9}, &vars),
            Bson::Boolean(true)
        );
    }
}
