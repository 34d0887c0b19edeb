//! Predicate evaluation
//!
//! WHERE and HAVING trees are folded strictly left to right with no operator
//! precedence: `A OR B AND C` is `(A OR B) AND C`. Reaching an AND while the
//! running result is false ends the whole expression as false, even if an OR
//! follows later in the chain. The set fold used by index reads mirrors this
//! exactly, so both paths select the same rows.

use crate::error::{Error, Result};
use crate::geo::crow_km;
use crate::query::{Cond, Junction, Op, Operand, Where};
use crate::types::{compare_values, is_nullish, pk_key, resolve, values_equal, Row};
use ahash::AHashMap;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;

const PATTERN_CACHE_CAP: usize = 1024;

/// Search scores per condition id, keyed by primary key string.
pub type SearchHits = AHashMap<usize, AHashMap<String, f64>>;

/// Per-query evaluation context.
pub struct EvalCtx<'a> {
    pub pk: &'a str,
    pub search: &'a SearchHits,
}

impl<'a> EvalCtx<'a> {
    pub fn new(pk: &'a str, search: &'a SearchHits) -> Self {
        Self { pk, search }
    }
}

/// Compiled LIKE / REGEXP patterns are cached by source text.
#[derive(Default)]
pub struct Evaluator {
    patterns: DashMap<String, Regex>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, w: &Where, row: &Row, ctx: &EvalCtx) -> Result<bool> {
        match w {
            Where::Cond(c) => self.cond(c, row, ctx),
            Where::Group(items) => {
                let mut acc = false;
                for (i, (junction, item)) in items.iter().enumerate() {
                    if i == 0 {
                        acc = self.matches(item, row, ctx)?;
                        continue;
                    }
                    match junction {
                        Junction::And => {
                            if !acc {
                                return Ok(false);
                            }
                            acc = self.matches(item, row, ctx)?;
                        }
                        Junction::Or => {
                            if !acc {
                                acc = self.matches(item, row, ctx)?;
                            }
                        }
                    }
                }
                Ok(acc)
            }
        }
    }

    pub fn cond(&self, c: &Cond, row: &Row, ctx: &EvalCtx) -> Result<bool> {
        let left: Option<Cow<Value>> = match &c.left {
            Operand::Search(_) => {
                let hit = row
                    .get(ctx.pk)
                    .zip(ctx.search.get(&c.id))
                    .is_some_and(|(pk, hits)| hits.contains_key(&pk_key(pk)));
                return Ok(hit);
            }
            Operand::Column(col) => resolve(row, col),
            Operand::Crow { column, lat, lon } => {
                let point = resolve(row, column);
                let coords = point.as_deref().and_then(|p| {
                    Some((p.get("lat")?.as_f64()?, p.get("lon")?.as_f64()?))
                });
                coords.map(|(plat, plon)| Cow::Owned(Value::from(crow_km(plat, plon, *lat, *lon))))
            }
            Operand::Call(call) => Some(Cow::Owned(call.eval_row(row))),
        };
        let right = match &c.right_column {
            Some(col) => resolve(row, col).unwrap_or(Cow::Borrowed(&c.right)),
            None => Cow::Borrowed(&c.right),
        };
        self.apply(c.op, left.as_deref(), &right)
    }

    pub fn apply(&self, op: Op, left: Option<&Value>, right: &Value) -> Result<bool> {
        let l = left.unwrap_or(&Value::Null);
        let ord = || compare_values(l, right);
        Ok(match op {
            Op::Eq => values_equal(l, right),
            Op::Ne => !values_equal(l, right),
            Op::Gt => ord() == Some(Ordering::Greater),
            Op::Ge => matches!(ord(), Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt => ord() == Some(Ordering::Less),
            Op::Le => matches!(ord(), Some(Ordering::Less | Ordering::Equal)),
            Op::In => set_arg(op, right)?.iter().any(|r| values_equal(l, r)),
            Op::NotIn => !set_arg(op, right)?.iter().any(|r| values_equal(l, r)),
            Op::Between => between(l, set_arg(op, right)?),
            Op::NotBetween => !between(l, set_arg(op, right)?),
            Op::Like => self.like(l, right)?,
            Op::NotLike => !self.like(l, right)?,
            Op::Regexp => match text(l) {
                Some(s) => self.pattern(&format!("re:{}", text(right).unwrap_or_default()), || {
                    text(right).unwrap_or_default()
                })?
                .is_match(&s),
                None => false,
            },
            Op::Includes => includes(l, right),
            Op::NotIncludes => !includes(l, right),
            Op::Intersect => intersects(l, set_arg(op, right)?),
            Op::NotIntersect => !intersects(l, set_arg(op, right)?),
            Op::IntersectAll => {
                let wanted = set_arg(op, right)?;
                let have = as_list(l);
                wanted.iter().all(|w| have.iter().any(|h| values_equal(h, w)))
            }
            Op::Null => is_nullish(left),
            Op::NotNull => !is_nullish(left),
        })
    }

    /// `%` is any run, `_` one char; anchored and case-insensitive.
    fn like(&self, left: &Value, pattern: &Value) -> Result<bool> {
        let Some(subject) = text(left) else {
            return Ok(false);
        };
        let raw = text(pattern).unwrap_or_default();
        let re = self.pattern(&format!("like:{raw}"), || {
            let mut out = String::from("(?is)^");
            for ch in raw.chars() {
                match ch {
                    '%' => out.push_str(".*"),
                    '_' => out.push('.'),
                    c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
                }
            }
            out.push('$');
            out
        })?;
        Ok(re.is_match(&subject))
    }

    fn pattern(&self, key: &str, source: impl FnOnce() -> String) -> Result<Regex> {
        if let Some(re) = self.patterns.get(key) {
            return Ok(re.clone());
        }
        let src = source();
        let re = Regex::new(&src).map_err(|e| Error::invalid(format!("bad pattern {src}: {e}")))?;
        if self.patterns.len() >= PATTERN_CACHE_CAP {
            self.patterns.clear();
        }
        self.patterns.insert(key.to_string(), re.clone());
        Ok(re)
    }
}

fn set_arg(op: Op, right: &Value) -> Result<&[Value]> {
    right
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::invalid(format!("{op:?} needs an array, got {right}")))
}

fn between(l: &Value, bounds: &[Value]) -> bool {
    match bounds {
        [lo, hi] => {
            matches!(compare_values(l, lo), Some(Ordering::Greater | Ordering::Equal))
                && matches!(compare_values(l, hi), Some(Ordering::Less | Ordering::Equal))
        }
        _ => false,
    }
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn as_list(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn includes(l: &Value, r: &Value) -> bool {
    match l {
        Value::Array(items) => items.iter().any(|i| values_equal(i, r)),
        Value::String(s) => text(r).is_some_and(|needle| s.contains(&needle)),
        _ => false,
    }
}

fn intersects(l: &Value, r: &[Value]) -> bool {
    as_list(l).iter().any(|h| r.iter().any(|w| values_equal(h, w)))
}

/// Set of primary keys, keyed by their string form.
pub type PkSet = AHashMap<String, Value>;

/// Fold a WHERE tree over per-condition pk sets with the same left-to-right
/// semantics as `Evaluator::matches`. `leaf` returns `None` when a condition
/// cannot be answered from an index, which makes the whole fold `None`.
pub fn fold_sets<F>(w: &Where, leaf: &mut F) -> Result<Option<PkSet>>
where
    F: FnMut(&Cond) -> Result<Option<PkSet>>,
{
    match w {
        Where::Cond(c) => leaf(c),
        Where::Group(items) => {
            let mut acc: Option<PkSet> = None;
            // every row that survives must have passed each AND checkpoint
            let mut cap: Option<PkSet> = None;
            for (i, (junction, item)) in items.iter().enumerate() {
                let Some(set) = fold_sets(item, leaf)? else {
                    return Ok(None);
                };
                let current = acc.take().unwrap_or_default();
                acc = Some(if i == 0 {
                    set
                } else {
                    match junction {
                        Junction::And => {
                            cap = Some(match cap.take() {
                                Some(c) => intersect(c, &current),
                                None => current.clone(),
                            });
                            intersect(current, &set)
                        }
                        Junction::Or => union(current, set),
                    }
                });
            }
            let acc = acc.unwrap_or_default();
            Ok(Some(match cap {
                Some(c) => intersect(acc, &c),
                None => acc,
            }))
        }
    }
}

fn intersect(mut a: PkSet, b: &PkSet) -> PkSet {
    a.retain(|k, _| b.contains_key(k));
    a
}

fn union(mut a: PkSet, b: PkSet) -> PkSet {
    a.extend(b);
    a
}

pub fn pk_set(pks: impl IntoIterator<Item = Value>) -> PkSet {
    pks.into_iter().map(|pk| (pk_key(&pk), pk)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::query::{CompileMode, WhereCompiler};
    use rand::Rng;
    use serde_json::json;

    fn compile(v: Value) -> Where {
        let reg = FunctionRegistry::new();
        WhereCompiler::new(&reg, 16, CompileMode::Where).compile(&v).unwrap()
    }

    fn row(v: Value) -> Row {
        v.as_object().unwrap().clone()
    }

    fn check(w: &Value, r: &Value) -> bool {
        let hits = SearchHits::new();
        Evaluator::new().matches(&compile(w.clone()), &row(r.clone()), &EvalCtx::new("id", &hits)).unwrap()
    }

    #[test]
    fn test_like_anchored_and_complement() {
        for name in ["billy", "gbilly", "Bill", "BILLY BOB", "bil", ""] {
            let r = json!({"id": 1, "name": name});
            let like = check(&json!(["name", "LIKE", "bill%"]), &r);
            let not_like = check(&json!(["name", "NOT LIKE", "bill%"]), &r);
            assert_ne!(like, not_like, "{name}");
        }
        assert!(check(&json!(["name", "LIKE", "bill%"]), &json!({"name": "billy"})));
        assert!(!check(&json!(["name", "LIKE", "bill%"]), &json!({"name": "gbilly"})));
        assert!(check(&json!(["name", "LIKE", "b_ll"]), &json!({"name": "BELL"})));
        assert!(check(&json!(["name", "LIKE", "a.c"]), &json!({"name": "a.c"})));
        assert!(!check(&json!(["name", "LIKE", "a.c"]), &json!({"name": "abc"})));
    }

    #[test]
    fn test_operators() {
        let r = json!({"n": 5, "s": "", "tags": ["a", "b"], "loc": {"lat": 0.0, "lon": 0.0}});
        assert!(check(&json!(["n", "BETWEEN", [5, 9]]), &r));
        assert!(check(&json!(["n", "NOT BETWEEN", [6, 9]]), &r));
        assert!(check(&json!(["n", "IN", [1, "5"]]), &r));
        assert!(check(&json!(["n", "NOT IN", [1, 2]]), &r));
        assert!(check(&json!(["n", "!=", 4]), &r));
        assert!(check(&json!(["s", "IS NULL"]), &r));
        assert!(check(&json!(["missing", "NULL"]), &r));
        assert!(check(&json!(["n", "NOT NULL"]), &r));
        assert!(check(&json!(["tags", "INCLUDES", "a"]), &r));
        assert!(check(&json!(["tags", "NOT INCLUDES", "z"]), &r));
        assert!(check(&json!(["tags", "INTERSECT", ["z", "b"]]), &r));
        assert!(!check(&json!(["tags", "INTERSECT ALL", ["a", "z"]]), &r));
        assert!(check(&json!(["tags", "NOT INTERSECT", ["x"]]), &r));
        assert!(check(&json!(["tags.length", "=", 2]), &r));
        assert!(check(&json!(["n", "REGEXP", "^[0-9]$"]), &r));
        assert!(check(&json!(["crow(loc, 0, 1)", "<", 112]), &r));
        assert!(check(&json!(["UPPER(tags.0)", "=", "A"]), &r));
    }

    #[test]
    fn test_left_fold_short_circuit() {
        let r = json!({"a": 1, "b": 2, "c": 3});
        // (false AND ...) ends the chain even with a later true OR
        assert!(!check(&json!([["a", "=", 9], "AND", ["b", "=", 2], "OR", ["c", "=", 3]]), &r));
        // (true OR x) AND false
        assert!(!check(&json!([["a", "=", 1], "OR", ["b", "=", 9], "AND", ["c", "=", 9]]), &r));
        assert!(check(&json!([["a", "=", 9], "OR", ["b", "=", 2], "AND", ["c", "=", 3]]), &r));
    }

    #[test]
    fn test_bad_regex_is_validation_error() {
        let hits = SearchHits::new();
        let w = compile(json!(["n", "REGEXP", "("]));
        let err = Evaluator::new().matches(&w, &row(json!({"n": "x"})), &EvalCtx::new("id", &hits));
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_set_fold_agrees_with_row_fold() {
        let mut rng = rand::thread_rng();
        let rows: Vec<Row> = (0..200)
            .map(|i| row(json!({"id": i, "a": rng.gen_range(0..3), "b": rng.gen_range(0..3), "c": rng.gen_range(0..3)})))
            .collect();
        let shapes = [
            json!([["a", "=", 1], "AND", ["b", "=", 2], "OR", ["c", "=", 0]]),
            json!([["a", "=", 1], "OR", ["b", "=", 2], "AND", ["c", "=", 0]]),
            json!([["a", "=", 0], "OR", [["b", "=", 1], "AND", ["c", "=", 2]], "AND", ["a", "!=", 2]]),
        ];
        let ev = Evaluator::new();
        let hits = SearchHits::new();
        let ctx = EvalCtx::new("id", &hits);
        for shape in shapes {
            let w = compile(shape);
            let expected: PkSet = pk_set(
                rows.iter()
                    .filter(|r| ev.matches(&w, r, &ctx).unwrap())
                    .map(|r| r["id"].clone()),
            );
            let got = fold_sets(&w, &mut |c: &Cond| {
                Ok(Some(pk_set(
                    rows.iter().filter(|r| ev.cond(c, r, &ctx).unwrap()).map(|r| r["id"].clone()),
                )))
            })
            .unwrap()
            .unwrap();
            let mut e: Vec<_> = expected.keys().cloned().collect();
            let mut g: Vec<_> = got.keys().cloned().collect();
            e.sort();
            g.sort();
            assert_eq!(e, g);
        }
    }
}
