//! Access path selection and row retrieval.
//!
//! Cheapest first: trie prefix, positional range, whole WHERE from indexes,
//! first clause from an index, full scan. Every fetched row is re-checked
//! against the full WHERE, so lossy index keys never leak extra rows.

use super::QueryExecutor;
use crate::adapter::ReadRange;
use crate::catalog::SearchColumn;
use crate::error::{Error, Result};
use crate::expr::{fold_sets, pk_set, PkSet};
use crate::geo::bounding_box;
use crate::index::RangeBound;
use crate::query::{fuzzy_args, Cond, Junction, Op, Operand, Where};
use crate::types::{pk_key, total_cmp, AccessPath, PkType, Row};
use serde_json::Value;
use std::cmp::Ordering;

pub(crate) struct Fetched {
    pub rows: Vec<Row>,
    pub access: AccessPath,
    /// rows read before filtering
    pub fetched: usize,
}

/// What one indexable condition asks of an index.
enum Probe {
    Keys(Vec<Value>),
    Range(Option<RangeBound>, Option<RangeBound>),
}

fn probe(c: &Cond, coerce: impl Fn(&Value) -> Option<Value>) -> Option<Probe> {
    let bound = |v: &Value, inclusive| coerce(v).map(|v| RangeBound::new(v, inclusive));
    Some(match c.op {
        Op::Eq => Probe::Keys(vec![coerce(&c.right)?]),
        Op::In => Probe::Keys(c.right.as_array()?.iter().map(&coerce).collect::<Option<Vec<_>>>()?),
        Op::Between => match c.right.as_array()?.as_slice() {
            [lo, hi] => Probe::Range(Some(bound(lo, true)?), Some(bound(hi, true)?)),
            _ => return None,
        },
        Op::Gt => Probe::Range(Some(bound(&c.right, false)?), None),
        Op::Ge => Probe::Range(Some(bound(&c.right, true)?), None),
        Op::Lt => Probe::Range(None, Some(bound(&c.right, false)?)),
        Op::Le => Probe::Range(None, Some(bound(&c.right, true)?)),
        _ => return None,
    })
}

/// Primary key value in the stored form for this key type.
pub(super) fn coerce_pk(pk_type: PkType, value: &Value) -> Option<Value> {
    match (pk_type, value) {
        (_, Value::Null) => None,
        (PkType::Int | PkType::Float, Value::Number(_)) => Some(value.clone()),
        (PkType::Int | PkType::Float, Value::String(s)) => {
            let n: f64 = s.trim().parse().ok()?;
            Some(if n.fract() == 0.0 { Value::from(n as i64) } else { Value::from(n) })
        }
        (PkType::Int | PkType::Float, _) => None,
        (PkType::Any, _) => Some(value.clone()),
        (_, Value::String(_)) => Some(value.clone()),
        (_, Value::Number(_)) => Some(Value::String(pk_key(value))),
        _ => None,
    }
}

/// Range bounds the index order answers the same way the evaluator does:
/// all numbers, or all non-numeric strings.
fn comparable_bounds(lo: &Option<RangeBound>, hi: &Option<RangeBound>) -> bool {
    let bounds: Vec<&Value> = [lo, hi].into_iter().flatten().map(|b| &b.value).collect();
    bounds.iter().all(|v| v.is_number())
        || bounds.iter().all(|v| matches!(v, Value::String(s) if s.trim().parse::<f64>().is_err()))
}

impl QueryExecutor<'_> {
    /// Run each `search()` condition once; results key the row-level check.
    pub(super) fn run_searches(&mut self) -> Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        let prefix = format!("{}.", self.table.name);
        let mut results = Vec::new();
        for c in filter.conds() {
            let Operand::Search(names) = &c.left else {
                continue;
            };
            let columns = names
                .iter()
                .map(|name| {
                    let name = name.strip_prefix(&prefix).unwrap_or(name);
                    self.table
                        .search_column(name)
                        .ok_or_else(|| Error::invalid(format!("{}.{name} is not a search column", self.table.name)))
                })
                .collect::<Result<Vec<&SearchColumn>>>()?;
            let hits = match c.op {
                Op::Eq => {
                    let text = c.right.as_str().unwrap_or_default();
                    self.db.search.search_exact(&self.table.name, &columns, text)?
                }
                _ => {
                    let (min, text) = fuzzy_args(&c.right)
                        .ok_or_else(|| Error::invalid("fuzzy search takes [minScore, text]"))?;
                    let mut hits = self.db.search.search_fuzzy(&self.table.name, &columns, text, min)?;
                    if c.op == Op::Gt {
                        hits.retain(|(_, score)| *score > min);
                    }
                    hits
                }
            };
            tracing::debug!(table = %self.table.name, cond = c.id, hits = hits.len(), "search evaluated");
            results.push((c.id, hits));
        }
        for (id, hits) in results {
            self.search.insert(id, hits.iter().map(|(pk, score)| (pk_key(pk), *score)).collect());
            self.search_sets.insert(id, pk_set(hits.into_iter().map(|(pk, _)| pk)));
        }
        Ok(())
    }

    pub fn access_path(&self) -> AccessPath {
        if self.query.trie.is_some() {
            return AccessPath::Trie;
        }
        if self.query.range.is_some() {
            return AccessPath::Range;
        }
        if !self.joins.is_empty() {
            return AccessPath::Scan;
        }
        match &self.filter {
            None => AccessPath::Scan,
            Some(w) if self.indexable(w) => AccessPath::Index,
            Some(Where::Group(items))
                if items.len() > 1 && items[1].0 == Junction::And && self.indexable(&items[0].1) =>
            {
                AccessPath::Partial
            }
            Some(_) => AccessPath::Scan,
        }
    }

    fn indexable(&self, w: &Where) -> bool {
        w.conds().into_iter().all(|c| self.can_index(c))
    }

    fn can_index(&self, c: &Cond) -> bool {
        match &c.left {
            Operand::Search(_) => true,
            Operand::Crow { column, .. } => {
                self.table.geo_indexed.iter().any(|g| g == column) && matches!(c.op, Op::Lt | Op::Le)
            }
            Operand::Column(col) if *col == self.table.pk => self.pk_probe(c).is_some(),
            Operand::Column(col) if self.table.indexes.contains(col) => self.column_probe(c).is_some(),
            _ => false,
        }
    }

    fn pk_probe(&self, c: &Cond) -> Option<Probe> {
        let pk_type = self.table.pk_type;
        let textual_bounds = match &c.right {
            Value::Array(items) => items.iter().all(Value::is_string),
            other => other.is_string(),
        };
        match probe(c, |v| coerce_pk(pk_type, v))? {
            Probe::Range(..) if pk_type == PkType::Any => None,
            // string keys order lexically, a number bound would compare numerically
            Probe::Range(..) if !pk_type.is_numeric() && !textual_bounds => None,
            p => Some(p),
        }
    }

    fn column_probe(&self, c: &Cond) -> Option<Probe> {
        match probe(c, |v| (!v.is_null()).then(|| v.clone()))? {
            Probe::Range(lo, hi) if comparable_bounds(&lo, &hi) => Some(Probe::Range(lo, hi)),
            Probe::Range(..) => None,
            keys => Some(keys),
        }
    }

    /// Pks matching one condition straight from an index. `None` when the
    /// condition has to be checked row by row.
    fn index_cond(&self, c: &Cond) -> Result<Option<PkSet>> {
        let table = self.table;
        match &c.left {
            Operand::Search(_) => Ok(self.search_sets.get(&c.id).cloned()),
            Operand::Crow { column, lat, lon } if self.can_index(c) => {
                let km = c.right.as_f64().unwrap_or(0.0);
                if km < 0.0 {
                    return Ok(Some(PkSet::new()));
                }
                let window = bounding_box(*lat, *lon, km);
                let lat_col = format!("{column}.lat");
                let lon_col = format!("{column}.lon");
                let incl = |v: f64| Some(RangeBound::new(Value::from(v), true));
                let Some(by_lat) = self.db.indexes.lookup_range(table, &lat_col, incl(window.lat.0).as_ref(), incl(window.lat.1).as_ref())? else {
                    return Ok(None);
                };
                let mut by_lon = PkSet::new();
                for (lo, hi) in &window.lon {
                    match self.db.indexes.lookup_range(table, &lon_col, incl(*lo).as_ref(), incl(*hi).as_ref())? {
                        Some(pks) => by_lon.extend(pk_set(pks)),
                        None => return Ok(None),
                    }
                }
                let mut set = pk_set(by_lat);
                set.retain(|k, _| by_lon.contains_key(k));
                Ok(Some(set))
            }
            Operand::Column(col) if *col == table.pk => {
                let Some(probe) = self.pk_probe(c) else {
                    return Ok(None);
                };
                let primary = self.db.primary[table.id].read();
                Ok(Some(match probe {
                    Probe::Keys(keys) => pk_set(keys.into_iter().filter(|k| primary.exists(k))),
                    Probe::Range(lo, hi) => pk_set(primary.range(
                        lo.as_ref().map(|b| (&b.value, b.inclusive)),
                        hi.as_ref().map(|b| (&b.value, b.inclusive)),
                    )),
                }))
            }
            Operand::Column(col) if table.indexes.contains(col) => match self.column_probe(c) {
                Some(Probe::Keys(keys)) => {
                    let mut set = PkSet::new();
                    for key in &keys {
                        set.extend(pk_set(self.db.indexes.lookup_eq(table, col, key)?));
                    }
                    Ok(Some(set))
                }
                Some(Probe::Range(lo, hi)) => {
                    Ok(self.db.indexes.lookup_range(table, col, lo.as_ref(), hi.as_ref())?.map(pk_set))
                }
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn index_set(&self, w: &Where) -> Result<Option<PkSet>> {
        fold_sets(w, &mut |c| self.index_cond(c))
    }

    /// Rows of the driving table matching the WHERE.
    pub(super) fn fetch(&self) -> Result<Fetched> {
        let access = self.access_path();
        let span = if access == AccessPath::Index { self.pk_span() } else { None };
        if let Some((lo, hi)) = span {
            let mut fetched = self.fetch_pk_span(lo, hi)?;
            self.rank(&mut fetched.rows);
            return Ok(fetched);
        }
        let mut fetched = match (access, &self.filter) {
            (AccessPath::Trie, _) => self.fetch_trie()?,
            (AccessPath::Range, _) => self.fetch_range()?,
            (AccessPath::Index, Some(w)) => match self.index_set(w)? {
                Some(set) => self.fetch_set(set, AccessPath::Index)?,
                None => self.fetch_scan()?,
            },
            (AccessPath::Partial, Some(Where::Group(items))) => match self.index_set(&items[0].1)? {
                Some(set) => self.fetch_set(set, AccessPath::Partial)?,
                None => self.fetch_scan()?,
            },
            _ => self.fetch_scan()?,
        };
        self.rank(&mut fetched.rows);
        Ok(fetched)
    }

    /// Closed bounds of a WHERE that is a single numeric pk BETWEEN, read
    /// from the adapter as one key range.
    fn pk_span(&self) -> Option<(Value, Value)> {
        let Some(Where::Cond(c)) = &self.filter else {
            return None;
        };
        if !matches!(&c.left, Operand::Column(col) if *col == self.table.pk) || !self.table.pk_type.is_numeric() {
            return None;
        }
        match self.pk_probe(c)? {
            Probe::Range(Some(lo), Some(hi)) if lo.inclusive && hi.inclusive => Some((lo.value, hi.value)),
            _ => None,
        }
    }

    fn fetch_pk_span(&self, lo: Value, hi: Value) -> Result<Fetched> {
        let mut rows = Vec::new();
        self.db
            .adapter
            .range_read(&self.table.name, ReadRange::Keys(lo, hi), &mut |row| rows.push(row))?;
        let fetched = rows.len();
        Ok(Fetched { rows: self.filter_rows(rows)?, access: AccessPath::Index, fetched })
    }

    /// A lone search condition with no ORDER BY returns best matches first.
    fn rank(&self, rows: &mut [Row]) {
        if !self.order.is_empty() {
            return;
        }
        let Some(Where::Cond(c)) = &self.filter else {
            return;
        };
        let Some(scores) = self.search.get(&c.id) else {
            return;
        };
        let score = |row: &Row| row.get(&self.pk_path).and_then(|pk| scores.get(&pk_key(pk))).copied().unwrap_or(0.0);
        rows.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal));
    }

    pub(super) fn filter_rows(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if self.keep(&row)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Read `pks` in the given order, in batches.
    fn read_pks(&self, pks: &[Value], access: AccessPath) -> Result<Fetched> {
        let mut rows = Vec::with_capacity(pks.len());
        for chunk in pks.chunks(self.db.config.scan_batch.max(1)) {
            rows.extend(self.db.adapter.batch_read(&self.table.name, chunk)?);
        }
        let fetched = rows.len();
        Ok(Fetched { rows: self.filter_rows(rows)?, access, fetched })
    }

    fn fetch_set(&self, set: PkSet, access: AccessPath) -> Result<Fetched> {
        let mut pks: Vec<Value> = set.into_values().collect();
        pks.sort_by(total_cmp);
        self.read_pks(&pks, access)
    }

    fn fetch_trie(&self) -> Result<Fetched> {
        let Some(tq) = &self.query.trie else {
            return self.fetch_scan();
        };
        let mut pks = {
            let tries = self.db.tries[self.table.id].read();
            let trie = tries
                .get(&tq.column)
                .ok_or_else(|| Error::invalid(format!("{}.{} has no trie", self.table.name, tq.column)))?;
            trie.search(&tq.search)
        };
        pks.sort_by(total_cmp);
        self.read_pks(&pks, AccessPath::Trie)
    }

    /// `range: [limit, offset]` over the primary key order; a negative limit
    /// counts back from the end.
    fn fetch_range(&self) -> Result<Fetched> {
        let Some((limit, offset)) = self.query.range else {
            return self.fetch_scan();
        };
        let offset = offset.max(0) as usize;
        let pks = {
            let primary = self.db.primary[self.table.id].read();
            let len = primary.len();
            let (from, to) = if limit < 0 {
                let end = len.saturating_sub(offset);
                (end.saturating_sub(limit.unsigned_abs() as usize), end)
            } else {
                (offset, offset.saturating_add(limit as usize))
            };
            primary.slice(from, to).to_vec()
        };
        self.read_pks(&pks, AccessPath::Range)
    }

    fn fetch_scan(&self) -> Result<Fetched> {
        let batch = self.db.config.scan_batch.max(1);
        let len = self.db.adapter.get_index_length(&self.table.name)?;
        let mut rows = Vec::new();
        let mut fetched = 0;
        let mut from = 0;
        while from < len {
            let mut chunk = Vec::with_capacity(batch);
            self.db
                .adapter
                .range_read(&self.table.name, ReadRange::Offsets(from, from + batch), &mut |row| chunk.push(row))?;
            let n = chunk.len();
            fetched += n;
            rows.extend(self.filter_rows(chunk)?);
            if n < batch {
                break;
            }
            from += batch;
        }
        Ok(Fetched { rows, access: AccessPath::Scan, fetched })
    }
}
