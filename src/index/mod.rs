//! Secondary Index Module
//!
//! One posting-list shadow table per indexed column (`{id: indexKey, rows: [pk...]}`)
//! plus an in-memory sorted vector of the distinct index keys, so equality is a
//! single row read and ranges are a binary search over the keys.
//!
//! Index keys are lossy on purpose: numbers pass through, strings keep their
//! first 32 chars, objects and arrays are stringified and cut to 12. Callers
//! always re-check fetched rows against the full predicate.

mod fulltext;
mod store;
mod tokenizer;

pub use fulltext::{fuzzy_key, levenshtein, SearchIndex};
pub use store::ShadowStore;
pub use tokenizer::{EnglishTokenizer, RawTokenizer, Tokenizer, TokenizerRegistry};

use crate::catalog::{index_table, TableMeta};
use crate::error::Result;
use crate::types::{pk_key, resolve, total_cmp, Row};
use ahash::AHashMap;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;

const STRING_KEY_LEN: usize = 32;
const COMPOUND_KEY_LEN: usize = 12;

/// Canonical posting-list key for a column value. `None` for null.
pub fn index_key(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Number(_) | Value::Bool(_) => Some(value.clone()),
        Value::String(s) => Some(Value::String(s.chars().take(STRING_KEY_LEN).collect())),
        Value::Array(_) | Value::Object(_) => {
            Some(Value::String(value.to_string().chars().take(COMPOUND_KEY_LEN).collect()))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One side of a range lookup.
#[derive(Clone, Debug)]
pub struct RangeBound {
    pub value: Value,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn new(value: Value, inclusive: bool) -> Self {
        Self { value, inclusive }
    }
}

pub struct IndexManager {
    store: Arc<ShadowStore>,
    /// shadow table → sorted distinct keys (empty posting lists stay until rebuild)
    keys: DashMap<String, Vec<Value>>,
}

impl IndexManager {
    pub fn new(store: Arc<ShadowStore>) -> Self {
        Self { store, keys: DashMap::new() }
    }

    /// Load the key set of every index of `table`.
    pub fn load(&self, table: &TableMeta) -> Result<()> {
        for column in &table.indexes {
            let shadow = index_table(&table.name, column);
            let mut keys: Vec<Value> = self
                .store
                .load(&shadow)?
                .into_iter()
                .filter_map(|r| r.get("id").cloned())
                .collect();
            keys.sort_by(total_cmp);
            self.keys.insert(shadow, keys);
        }
        Ok(())
    }

    fn add_posting(&self, shadow: &str, key: &Value, pk: &Value) -> Result<()> {
        let pk = pk.clone();
        let wanted = pk_key(&pk);
        self.store.update(shadow, key, move |current| {
            let mut rows = posting_rows(current.as_ref());
            if !rows.iter().any(|r| pk_key(r) == wanted) {
                rows.push(pk);
            }
            Some(posting_row(rows))
        })?;
        let mut keys = self.keys.entry(shadow.to_string()).or_default();
        if let Err(pos) = keys.binary_search_by(|k| total_cmp(k, key)) {
            keys.insert(pos, key.clone());
        }
        Ok(())
    }

    fn remove_posting(&self, shadow: &str, key: &Value, pk: &Value) -> Result<()> {
        let wanted = pk_key(pk);
        self.store.update(shadow, key, move |current| {
            let current = current?;
            let mut rows = posting_rows(Some(&current));
            rows.retain(|r| pk_key(r) != wanted);
            Some(posting_row(rows))
        })
    }

    /// Move `pk` between posting lists for every indexed column whose key changed.
    pub fn set_indexes(&self, table: &TableMeta, pk: &Value, old: Option<&Row>, new: &Row) -> Result<()> {
        for column in &table.indexes {
            let before = old.and_then(|r| resolve(r, column)).and_then(|v| index_key(&v));
            let after = resolve(new, column).and_then(|v| index_key(&v));
            if before == after {
                continue;
            }
            let shadow = index_table(&table.name, column);
            if let Some(key) = before {
                self.remove_posting(&shadow, &key, pk)?;
            }
            if let Some(key) = after {
                self.add_posting(&shadow, &key, pk)?;
            }
        }
        Ok(())
    }

    pub fn clear_indexes(&self, table: &TableMeta, pk: &Value, old: &Row) -> Result<()> {
        for column in &table.indexes {
            if let Some(key) = resolve(old, column).and_then(|v| index_key(&v)) {
                self.remove_posting(&index_table(&table.name, column), &key, pk)?;
            }
        }
        Ok(())
    }

    fn postings(&self, shadow: &str, key: &Value) -> Result<Vec<Value>> {
        Ok(posting_rows(self.store.get(shadow, key)?.as_ref()))
    }

    /// Primary keys whose column value may equal `value`.
    pub fn lookup_eq(&self, table: &TableMeta, column: &str, value: &Value) -> Result<Vec<Value>> {
        let shadow = index_table(&table.name, column);
        let Some(key) = index_key(value) else {
            return Ok(Vec::new());
        };
        let mut candidates = vec![key];
        // loose equality lets 5 match "5"
        match value {
            Value::String(s) => {
                if let Ok(n) = s.trim().parse::<f64>() {
                    candidates.push(json!(n));
                    if n.fract() == 0.0 {
                        candidates.push(json!(n as i64));
                    }
                }
            }
            Value::Number(_) => candidates.push(Value::String(pk_key(value))),
            _ => {}
        }
        let mut out = Vec::new();
        for key in dedup_keys(candidates) {
            out.extend(self.postings(&shadow, &key)?);
        }
        Ok(dedup_pks(out))
    }

    /// Primary keys whose column value may fall within the bounds. `None` when
    /// the bounds mix kinds the key order cannot answer.
    pub fn lookup_range(
        &self,
        table: &TableMeta,
        column: &str,
        lo: Option<&RangeBound>,
        hi: Option<&RangeBound>,
    ) -> Result<Option<Vec<Value>>> {
        let shadow = index_table(&table.name, column);
        let numeric = [lo, hi].iter().flatten().all(|b| as_number(&b.value).is_some());
        let textual = [lo, hi].iter().flatten().all(|b| matches!(b.value, Value::String(_)));
        let matching: Vec<Value> = {
            let Some(keys) = self.keys.get(&shadow) else {
                return Ok(Some(Vec::new()));
            };
            // keys sort null, bool, number, string
            let first_num = keys.partition_point(|k| matches!(k, Value::Null | Value::Bool(_)));
            let first_str = keys.partition_point(|k| !matches!(k, Value::String(_)));
            if numeric {
                let lo = lo.and_then(|b| as_number(&b.value)).unwrap_or(f64::NEG_INFINITY);
                let hi = hi.and_then(|b| as_number(&b.value)).unwrap_or(f64::INFINITY);
                let nums = &keys[first_num..first_str];
                let start = nums.partition_point(|k| as_number(k).map_or(true, |n| n < lo));
                let in_numbers = nums[start..].iter().take_while(|k| as_number(k).is_some_and(|n| n <= hi));
                // numeric strings compare as numbers too
                let in_strings = keys[first_str..]
                    .iter()
                    .filter(|k| as_number(k).is_some_and(|n| n >= lo && n <= hi));
                in_numbers.chain(in_strings).cloned().collect()
            } else if textual {
                // truncated keys compare as prefixes, so inclusive bounds on truncated values are safe
                let lo_key = lo.and_then(|b| index_key(&b.value));
                let hi_key = hi.and_then(|b| index_key(&b.value));
                let strings = &keys[first_str..];
                let start = match &lo_key {
                    Some(lo) => strings.partition_point(|k| total_cmp(k, lo) == Ordering::Less),
                    None => 0,
                };
                strings[start..]
                    .iter()
                    .take_while(|k| hi_key.as_ref().map_or(true, |hi| total_cmp(k, hi) != Ordering::Greater))
                    .cloned()
                    .collect()
            } else {
                return Ok(None);
            }
        };
        let mut out = Vec::new();
        for key in matching {
            out.extend(self.postings(&shadow, &key)?);
        }
        Ok(Some(dedup_pks(out)))
    }

    /// Distinct index keys of a column, in order.
    pub fn keys(&self, table: &TableMeta, column: &str) -> Vec<Value> {
        self.keys.get(&index_table(&table.name, column)).map(|k| k.clone()).unwrap_or_default()
    }

    /// Regroup every indexed column from full rows and replace the posting lists.
    pub fn rebuild(&self, table: &TableMeta, rows: &[Row]) -> Result<()> {
        for column in &table.indexes {
            let shadow = index_table(&table.name, column);
            let mut groups: AHashMap<String, (Value, Vec<Value>)> = AHashMap::new();
            for row in rows {
                let (Some(pk), Some(key)) = (row.get(&table.pk), resolve(row, column).and_then(|v| index_key(&v))) else {
                    continue;
                };
                groups.entry(pk_key(&key)).or_insert_with(|| (key, Vec::new())).1.push(pk.clone());
            }
            let mut keys: Vec<Value> = groups.values().map(|(k, _)| k.clone()).collect();
            keys.sort_by(total_cmp);
            let shadow_rows = groups
                .into_values()
                .map(|(key, pks)| {
                    let mut row = posting_row(pks);
                    row.insert("id".into(), key);
                    row
                })
                .collect();
            self.store.replace_all(&shadow, shadow_rows)?;
            self.keys.insert(shadow, keys);
        }
        Ok(())
    }

    pub fn truncate(&self, table: &TableMeta) -> Result<()> {
        for column in &table.indexes {
            let shadow = index_table(&table.name, column);
            self.store.truncate(&shadow)?;
            self.keys.insert(shadow, Vec::new());
        }
        Ok(())
    }
}

fn posting_rows(row: Option<&Row>) -> Vec<Value> {
    row.and_then(|r| r.get("rows"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn posting_row(pks: Vec<Value>) -> Row {
    let mut row = Row::new();
    row.insert("rows".into(), Value::Array(pks));
    row
}

fn dedup_keys(keys: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(keys.len());
    for k in keys {
        if !out.iter().any(|o| total_cmp(o, &k) == Ordering::Equal && o.is_string() == k.is_string()) {
            out.push(k);
        }
    }
    out
}

/// Keep first occurrence of each primary key.
pub fn dedup_pks(pks: Vec<Value>) -> Vec<Value> {
    let mut seen = ahash::AHashSet::with_capacity(pks.len());
    pks.into_iter().filter(|pk| seen.insert(pk_key(pk))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, StorageAdapter};
    use crate::catalog::{Catalog, ColumnDecl, TableDecl};

    fn setup(cached: bool) -> (IndexManager, TableMeta) {
        let cat = Catalog::build(&[TableDecl::new(
            "t",
            vec![
                ColumnDecl::new("id", "int").props(&["pk"]),
                ColumnDecl::new("num", "int").props(&["idx"]),
                ColumnDecl::new("name", "string").props(&["idx"]),
            ],
        )])
        .unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        for t in cat.tables() {
            adapter.make_table(t).unwrap();
        }
        let meta = cat.table("t").unwrap().clone();
        let idx = IndexManager::new(Arc::new(ShadowStore::new(adapter, cached)));
        idx.load(&meta).unwrap();
        (idx, meta)
    }

    fn row(v: Value) -> Row {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_index_key_truncation() {
        let long = "x".repeat(40);
        assert_eq!(index_key(&json!(long)).unwrap().as_str().unwrap().len(), 32);
        assert_eq!(index_key(&json!({"a": [1, 2, 3, 4, 5]})).unwrap(), json!("{\"a\":[1,2,3,"));
        assert_eq!(index_key(&json!(3.5)), Some(json!(3.5)));
        assert!(index_key(&Value::Null).is_none());
    }

    #[test]
    fn test_pk_in_exactly_one_posting_list() {
        let (idx, meta) = setup(true);
        idx.set_indexes(&meta, &json!(1), None, &row(json!({"id": 1, "num": 5}))).unwrap();
        idx.set_indexes(&meta, &json!(2), None, &row(json!({"id": 2, "num": 5}))).unwrap();
        let old = row(json!({"id": 1, "num": 5}));
        idx.set_indexes(&meta, &json!(1), Some(&old), &row(json!({"id": 1, "num": 9}))).unwrap();

        assert_eq!(idx.lookup_eq(&meta, "num", &json!(5)).unwrap(), vec![json!(2)]);
        assert_eq!(idx.lookup_eq(&meta, "num", &json!(9)).unwrap(), vec![json!(1)]);
        // tombstoned key stays listed until rebuild
        assert_eq!(idx.keys(&meta, "num"), vec![json!(5), json!(9)]);

        idx.clear_indexes(&meta, &json!(2), &row(json!({"id": 2, "num": 5}))).unwrap();
        assert!(idx.lookup_eq(&meta, "num", &json!(5)).unwrap().is_empty());
    }

    #[test]
    fn test_range_lookup() {
        let (idx, meta) = setup(false);
        for i in 1..=49 {
            let r = row(json!({"id": i, "num": i, "name": format!("n{:02}", i)}));
            idx.set_indexes(&meta, &json!(i), None, &r).unwrap();
        }
        let lo = RangeBound::new(json!(29), true);
        let hi = RangeBound::new(json!(49), true);
        let mut hits: Vec<i64> = idx
            .lookup_range(&meta, "num", Some(&lo), Some(&hi))
            .unwrap()
            .unwrap()
            .iter()
            .filter_map(Value::as_i64)
            .collect();
        hits.sort();
        assert_eq!(hits, (29..=49).collect::<Vec<_>>());

        let lo = RangeBound::new(json!("n40"), false);
        let names = idx.lookup_range(&meta, "name", Some(&lo), None).unwrap().unwrap();
        assert_eq!(names.len(), 10);

        let mixed = idx.lookup_range(&meta, "num", Some(&RangeBound::new(json!(1), true)), Some(&RangeBound::new(json!("z"), true)));
        assert!(mixed.unwrap().is_none());
    }

    #[test]
    fn test_loose_equality_lookup() {
        let (idx, meta) = setup(true);
        idx.set_indexes(&meta, &json!(1), None, &row(json!({"id": 1, "num": 7}))).unwrap();
        assert_eq!(idx.lookup_eq(&meta, "num", &json!("7")).unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_rebuild_drops_tombstones() {
        let (idx, meta) = setup(true);
        let rows: Vec<Row> = (1..=6).map(|i| row(json!({"id": i, "num": i % 3}))).collect();
        idx.rebuild(&meta, &rows).unwrap();
        assert_eq!(idx.keys(&meta, "num"), vec![json!(0), json!(1), json!(2)]);
        let mut zero: Vec<i64> = idx.lookup_eq(&meta, "num", &json!(0)).unwrap().iter().filter_map(Value::as_i64).collect();
        zero.sort();
        assert_eq!(zero, vec![3, 6]);
    }
}
