//! Nested-loop joins.
//!
//! Joined rows carry `table.column` keys for both sides. The first join
//! produces the result; each later join is computed against the driving table
//! on its own and merged in by the driving table's pk, filling only columns
//! that are still empty.

use super::fetch::Fetched;
use super::QueryExecutor;
use crate::catalog::TableMeta;
use crate::error::Result;
use crate::expr::{EvalCtx, SearchHits};
use crate::query::{JoinKind, JoinPlan};
use crate::types::{pk_key, AccessPath, Row};
use ahash::AHashMap;
use serde_json::Value;

fn prefixed(table: &str, row: &Row) -> Row {
    row.iter().map(|(k, v)| (format!("{table}.{k}"), v.clone())).collect()
}

/// All declared columns of `table` set to null.
fn null_row(table: &TableMeta) -> Row {
    table.columns.iter().map(|c| (format!("{}.{}", table.name, c.key), Value::Null)).collect()
}

fn merged(left: &Row, right: &Row) -> Row {
    let mut row = left.clone();
    row.extend(right.iter().map(|(k, v)| (k.clone(), v.clone())));
    row
}

impl QueryExecutor<'_> {
    pub(super) fn fetch_joined(&self) -> Result<Fetched> {
        let base: Vec<Row> = self.db.scan_table(self.table)?.iter().map(|r| prefixed(&self.table.name, r)).collect();
        let fetched = base.len();

        let mut rows = Vec::new();
        for (i, plan) in self.joins.iter().enumerate() {
            let joined = self.join_one(&base, plan)?;
            if i == 0 {
                rows = joined;
                continue;
            }
            let mut by_pk: AHashMap<String, Row> = AHashMap::new();
            for row in joined {
                if let Some(pk) = row.get(&self.pk_path).filter(|v| !v.is_null()) {
                    by_pk.entry(pk_key(pk)).or_insert(row);
                }
            }
            for row in &mut rows {
                let Some(extra) = row.get(&self.pk_path).and_then(|pk| by_pk.get(&pk_key(pk))) else {
                    continue;
                };
                for (k, v) in extra {
                    if row.get(k).map_or(true, Value::is_null) {
                        row.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Ok(Fetched { rows: self.filter_rows(rows)?, access: AccessPath::Scan, fetched })
    }

    fn join_one(&self, left: &[Row], plan: &JoinPlan) -> Result<Vec<Row>> {
        let right_table = self.db.user_table(&plan.table)?;
        let right: Vec<Row> = self.db.scan_table(right_table)?.iter().map(|r| prefixed(&plan.table, r)).collect();
        let no_hits = SearchHits::new();
        let ctx = EvalCtx::new(&self.pk_path, &no_hits);
        let on = |l: &Row, r: &Row| -> Result<Option<Row>> {
            let row = merged(l, r);
            match &plan.on {
                Some(w) if !self.db.evaluator.matches(w, &row, &ctx)? => Ok(None),
                _ => Ok(Some(row)),
            }
        };

        let mut out = Vec::new();
        let mut right_hit = vec![false; right.len()];
        let right_nulls = null_row(right_table);
        for l in left {
            let mut matched = false;
            for (ri, r) in right.iter().enumerate() {
                if let Some(row) = on(l, r)? {
                    matched = true;
                    right_hit[ri] = true;
                    out.push(row);
                }
            }
            if !matched && matches!(plan.kind, JoinKind::Left | JoinKind::Outer) {
                out.push(merged(l, &right_nulls));
            }
        }
        if matches!(plan.kind, JoinKind::Right | JoinKind::Outer) {
            let left_nulls = null_row(self.table);
            for (r, hit) in right.iter().zip(&right_hit) {
                if !hit {
                    out.push(merged(&left_nulls, r));
                }
            }
        }
        Ok(out)
    }
}
