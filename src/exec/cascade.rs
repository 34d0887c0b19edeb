//! Relation and view cascades.
//!
//! Cascaded writes refresh the row's own views and go through `persist` so
//! the touched tables keep their indexes current, but never cascade again.

use super::pipeline::related_ids;
use crate::catalog::{TableMeta, ViewMode};
use crate::engine::TabelDB;
use crate::error::Result;
use crate::types::{values_equal, ColumnType, Row};
use serde_json::Value;

fn holds(value: Option<&Value>, id: &Value) -> bool {
    related_ids(value).iter().any(|v| values_equal(v, id))
}

/// `value` with `id` taken out: removed from an array, or a matching scalar
/// nulled. `None` when nothing changes.
fn without(value: Option<&Value>, id: &Value) -> Option<Value> {
    match value {
        Some(Value::Array(items)) => {
            let kept: Vec<Value> = items.iter().filter(|v| !values_equal(v, id)).cloned().collect();
            (kept.len() != items.len()).then_some(Value::Array(kept))
        }
        Some(v) if values_equal(v, id) => Some(Value::Null),
        _ => None,
    }
}

impl TabelDB {
    /// Rows of `table` whose `column` holds `id`, as a scalar or inside an array.
    fn rows_referencing(&self, table: &TableMeta, column: &str, id: &Value) -> Result<Vec<Row>> {
        let array_column = table.column(column).is_some_and(|c| ColumnType::parse(&c.ty).array);
        let candidates = if table.indexes.iter().any(|c| c == column) && !array_column {
            let pks = self.indexes.lookup_eq(table, column, id)?;
            self.adapter.batch_read(&table.name, &pks)?
        } else {
            self.scan_table(table)?
        };
        Ok(candidates.into_iter().filter(|r| holds(r.get(column), id)).collect())
    }

    /// Set `table[pk].column` to `edit(current)` if the row exists and the value changes.
    fn edit_column<F>(&self, table: &TableMeta, pk: &Value, column: &str, edit: F) -> Result<()>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let Some(row) = self.adapter.read(&table.name, pk)? else {
            return Ok(());
        };
        let Some(value) = edit(row.get(column)) else {
            return Ok(());
        };
        let mut updated = row.clone();
        updated.insert(column.to_string(), value);
        self.fill_views(table, &mut updated)?;
        self.persist(table, Some(&row), updated)?;
        Ok(())
    }

    /// Keep reverse relation columns in step with `new`'s relation columns.
    pub(crate) fn sync_relations(&self, table: &TableMeta, old: Option<&Row>, new: &Row) -> Result<()> {
        let Some(pk) = new.get(&table.pk) else {
            return Ok(());
        };
        for rel in &table.relations {
            let Some(reverse) = &rel.reverse else {
                continue;
            };
            let before = related_ids(old.and_then(|o| o.get(&rel.column)));
            let after = related_ids(new.get(&rel.column));
            let target = self.catalog.get(rel.target);
            let reverse_many = target.relations.iter().find(|r| r.column == *reverse).is_some_and(|r| r.many);

            for id in after.iter().filter(|a| !before.iter().any(|b| values_equal(a, b))) {
                let mut displaced = None;
                self.edit_column(target, id, reverse, |current| {
                    if reverse_many {
                        if holds(current, pk) {
                            return None;
                        }
                        let mut ids = related_ids(current);
                        ids.push(pk.clone());
                        Some(Value::Array(ids))
                    } else {
                        match current {
                            Some(prev) if values_equal(prev, pk) => None,
                            Some(prev) if !prev.is_null() => {
                                displaced = Some(prev.clone());
                                Some(pk.clone())
                            }
                            _ => Some(pk.clone()),
                        }
                    }
                })?;
                // a one-sided reverse can point at a single row; the previous owner lets go
                if let Some(prev) = displaced {
                    self.edit_column(table, &prev, &rel.column, |current| without(current, id))?;
                }
            }
            for id in before.iter().filter(|b| !after.iter().any(|a| values_equal(a, b))) {
                self.edit_column(target, id, reverse, |current| without(current, pk))?;
            }
        }
        Ok(())
    }

    /// Mirror view columns into a row about to be written.
    pub(crate) fn fill_views(&self, table: &TableMeta, row: &mut Row) -> Result<()> {
        for view in &table.views {
            let source = self.catalog.get(view.source);
            let found = match row.get(&view.by).filter(|v| !v.is_null()) {
                Some(id) => self.adapter.read(&source.name, id)?,
                None => None,
            };
            match found {
                Some(src) => {
                    row.insert(view.column.clone(), src.get(&view.source_column).cloned().unwrap_or(Value::Null));
                }
                None if view.mode == ViewMode::Live => {
                    row.insert(view.column.clone(), Value::Null);
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Push a source row's changed columns into the views that mirror them.
    pub(crate) fn propagate_views(&self, source: &TableMeta, old: Option<&Row>, new: &Row) -> Result<()> {
        let Some(pk) = new.get(&source.pk) else {
            return Ok(());
        };
        for (dependent, view) in self.catalog.views_from(source.id) {
            let after = new.get(&view.source_column);
            if old.is_some() && old.and_then(|o| o.get(&view.source_column)) == after {
                continue;
            }
            let value = after.cloned().unwrap_or(Value::Null);
            for row in self.rows_referencing(dependent, &view.by, pk)? {
                if row.get(&view.column) == Some(&value) {
                    continue;
                }
                let mut updated = row.clone();
                updated.insert(view.column.clone(), value.clone());
                self.persist(dependent, Some(&row), updated)?;
            }
        }
        Ok(())
    }

    /// After a delete: null live views sourced from the row, then drop its pk
    /// from every relation column pointing at it. Views go first since they
    /// find their rows through those relation columns.
    pub(crate) fn cascade_delete(&self, table: &TableMeta, row: &Row) -> Result<()> {
        let Some(pk) = row.get(&table.pk) else {
            return Ok(());
        };
        for (dependent, view) in self.catalog.views_from(table.id) {
            if view.mode == ViewMode::Ghost {
                continue;
            }
            for referencing in self.rows_referencing(dependent, &view.by, pk)? {
                if referencing.get(&view.column).map_or(true, Value::is_null) {
                    continue;
                }
                let mut updated = referencing.clone();
                updated.insert(view.column.clone(), Value::Null);
                self.persist(dependent, Some(&referencing), updated)?;
            }
        }
        for (source, rel) in self.catalog.relations_to(table.id) {
            for referencing in self.rows_referencing(source, &rel.column, pk)? {
                let Some(value) = without(referencing.get(&rel.column), pk) else {
                    continue;
                };
                let mut updated = referencing.clone();
                updated.insert(rel.column.clone(), value);
                self.fill_views(source, &mut updated)?;
                self.persist(source, Some(&referencing), updated)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_without() {
        assert_eq!(without(Some(&json!([1, 2, 3])), &json!(2)), Some(json!([1, 3])));
        assert_eq!(without(Some(&json!([1, 3])), &json!(2)), None);
        assert_eq!(without(Some(&json!(5)), &json!("5")), Some(Value::Null));
        assert_eq!(without(Some(&json!(6)), &json!(5)), None);
        assert_eq!(without(None, &json!(5)), None);
    }

    #[test]
    fn test_holds() {
        assert!(holds(Some(&json!([1, 2])), &json!(2)));
        assert!(holds(Some(&json!("a")), &json!("a")));
        assert!(!holds(Some(&Value::Null), &json!(1)));
    }
}
