//! Select pipeline, in fixed order:
//! JOIN → GROUP BY → ORM → projection → HAVING → ORDER BY → OFFSET → LIMIT.

use super::QueryExecutor;
use crate::error::Result;
use crate::expr::{EvalCtx, SearchHits};
use crate::query::{OrmPlan, ProjExpr, Projection, SortKey, Where};
use crate::types::{compare_values, resolve, total_cmp, AccessPath, Row};
use serde_json::Value;
use std::cmp::Ordering;

/// Column value for sorting and grouping; missing is null.
fn sort_value(row: &Row, column: &str) -> Value {
    resolve(row, column).map(|v| v.into_owned()).unwrap_or(Value::Null)
}

/// Nulls sort last in either direction.
fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let (x, y) = (sort_value(a, &key.column), sort_value(b, &key.column));
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {
                let ord = compare_values(&x, &y).unwrap_or_else(|| total_cmp(&x, &y));
                if key.desc {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub(crate) fn sort_rows(rows: &mut [Row], keys: &[SortKey]) {
    if !keys.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, keys));
    }
}

/// Sort by the group keys, then split into runs of equal keys.
fn group_rows(mut rows: Vec<Row>, keys: &[SortKey]) -> Vec<Vec<Row>> {
    sort_rows(&mut rows, keys);
    let mut groups: Vec<Vec<Row>> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(g) if g.first().is_some_and(|first| compare_rows(first, &row, keys) == Ordering::Equal) => g.push(row),
            _ => groups.push(vec![row]),
        }
    }
    groups
}

fn project_row(row: &Row, columns: &[Projection]) -> Row {
    columns
        .iter()
        .map(|p| {
            let value = match &p.expr {
                ProjExpr::Column(c) => sort_value(row, c),
                ProjExpr::Call(call) => call.eval_row(row),
            };
            (p.alias.clone(), value)
        })
        .collect()
}

/// Aggregates fold the whole group; everything else reads the first row.
fn project_group(group: &[Row], columns: &[Projection]) -> Row {
    let empty = Row::new();
    let first = group.first().unwrap_or(&empty);
    columns
        .iter()
        .map(|p| {
            let value = match &p.expr {
                ProjExpr::Call(call) if call.is_aggregate() => call.eval_group(group),
                ProjExpr::Call(call) => call.eval_row(first),
                ProjExpr::Column(c) => sort_value(first, c),
            };
            (p.alias.clone(), value)
        })
        .collect()
}

/// Primary keys held by a relation column.
pub(crate) fn related_ids(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(v) => vec![v.clone()],
    }
}

impl QueryExecutor<'_> {
    pub(super) fn select(&self) -> Result<(Vec<Row>, AccessPath, usize)> {
        let fetched = if self.joins.is_empty() { self.fetch()? } else { self.fetch_joined()? };
        let rows = self.shape(fetched.rows)?;
        Ok((rows, fetched.access, fetched.fetched))
    }

    fn shape(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        let aggregate = self.columns.as_ref().is_some_and(|cols| cols.iter().any(Projection::is_aggregate));
        let mut out = if aggregate {
            let columns = self.columns.as_deref().unwrap_or_default();
            let groups = if self.group.is_empty() { vec![rows] } else { group_rows(rows, &self.group) };
            let mut out = Vec::with_capacity(groups.len());
            for mut group in groups {
                if !self.orm.is_empty() && !group.is_empty() {
                    let first = group.remove(0);
                    group.insert(0, self.expand_orm(vec![first])?.remove(0));
                }
                out.push(project_group(&group, columns));
            }
            out
        } else {
            let rows = if self.group.is_empty() { rows } else { group_rows(rows, &self.group).concat() };
            let rows = self.expand_orm(rows)?;
            match &self.columns {
                Some(columns) => rows.iter().map(|r| project_row(r, columns)).collect(),
                None => rows,
            }
        };

        if let Some(having) = &self.having {
            let no_hits = SearchHits::new();
            let ctx = EvalCtx::new(&self.pk_path, &no_hits);
            let mut kept = Vec::with_capacity(out.len());
            for row in out {
                if self.db.evaluator.matches(having, &row, &ctx)? {
                    kept.push(row);
                }
            }
            out = kept;
        }
        sort_rows(&mut out, &self.order);
        Ok(page(out, self.query.offset.unwrap_or(0), self.query.limit))
    }

    /// Replace relation columns with the rows they point at.
    fn expand_orm(&self, mut rows: Vec<Row>) -> Result<Vec<Row>> {
        for plan in &self.orm {
            let Some(relation) = self.table.relations.iter().find(|r| r.column == plan.key) else {
                continue;
            };
            let target = self.db.catalog.get(relation.target);
            for row in &mut rows {
                let ids = related_ids(row.get(&plan.key));
                let related = self.db.adapter.batch_read(&target.name, &ids)?;
                let related = self.shape_related(related, plan, &target.pk)?;
                let value = if relation.many {
                    Value::Array(related.into_iter().map(Value::Object).collect())
                } else {
                    related.into_iter().next().map(Value::Object).unwrap_or(Value::Null)
                };
                row.insert(plan.key.clone(), value);
            }
        }
        Ok(rows)
    }

    fn shape_related(&self, rows: Vec<Row>, plan: &OrmPlan, pk: &str) -> Result<Vec<Row>> {
        let no_hits = SearchHits::new();
        let ctx = EvalCtx::new(pk, &no_hits);
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if plan.filter.as_ref().map_or(Ok(true), |w: &Where| self.db.evaluator.matches(w, &row, &ctx))? {
                kept.push(row);
            }
        }
        sort_rows(&mut kept, &plan.order_by);
        let kept = page(kept, plan.offset, plan.limit.map(|l| l as i64));
        Ok(match &plan.select {
            Some(columns) => kept.iter().map(|r| project_row(r, columns)).collect(),
            None => kept,
        })
    }
}

/// Skip `offset` rows, then keep at most `limit`. A negative limit keeps all.
fn page(rows: Vec<Row>, offset: usize, limit: Option<i64>) -> Vec<Row> {
    let rows = rows.into_iter().skip(offset);
    match limit {
        Some(n) if n >= 0 => rows.take(n as usize).collect(),
        _ => rows.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(v: Value) -> Vec<Row> {
        v.as_array().unwrap().iter().map(|r| r.as_object().unwrap().clone()).collect()
    }

    fn key(column: &str, desc: bool) -> SortKey {
        SortKey { column: column.to_string(), desc }
    }

    #[test]
    fn test_sort_nulls_last_both_directions() {
        let mut data = rows(json!([{"n": 2}, {"n": null}, {"n": 9}, {}, {"n": 5}]));
        sort_rows(&mut data, &[key("n", false)]);
        let asc: Vec<Value> = data.iter().map(|r| sort_value(r, "n")).collect();
        assert_eq!(asc, vec![json!(2), json!(5), json!(9), Value::Null, Value::Null]);

        sort_rows(&mut data, &[key("n", true)]);
        let desc: Vec<Value> = data.iter().map(|r| sort_value(r, "n")).collect();
        assert_eq!(desc, vec![json!(9), json!(5), json!(2), Value::Null, Value::Null]);
    }

    #[test]
    fn test_group_runs() {
        let data = rows(json!([{"g": "b", "v": 1}, {"g": "a", "v": 2}, {"g": "b", "v": 3}]));
        let groups = group_rows(data, &[key("g", false)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn test_page() {
        let data = rows(json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}]));
        assert_eq!(page(data.clone(), 1, Some(2)), data[1..3].to_vec());
        assert_eq!(page(data.clone(), 3, None), data[3..].to_vec());
        assert_eq!(page(data, 0, Some(-1)).len(), 4);
    }

    #[test]
    fn test_related_ids() {
        assert_eq!(related_ids(Some(&json!([1, null, 2]))), vec![json!(1), json!(2)]);
        assert_eq!(related_ids(Some(&json!(7))), vec![json!(7)]);
        assert!(related_ids(None).is_empty());
    }
}
