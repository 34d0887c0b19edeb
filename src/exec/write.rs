//! Upsert, delete and drop.
//!
//! A write persists the row, then moves its pk through every derived index
//! (primary, secondary posting lists, full-text, trie) touching only columns
//! whose value changed, then runs relation and view cascades.

use super::fetch::coerce_pk;
use super::QueryExecutor;
use crate::catalog::TableMeta;
use crate::engine::TabelDB;
use crate::error::{Error, Result};
use crate::types::{is_nullish, now_ms, AccessPath, ChangeEvent, MutationSummary, PkType, Row};
use rand::Rng;
use serde_json::Value;

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

fn past_tense(action: &str) -> &'static str {
    match action {
        "upsert" => "upserted",
        "delete" => "deleted",
        _ => "dropped",
    }
}

impl TabelDB {
    /// Fresh primary key for a row that arrived without one.
    pub(crate) fn generate_pk(&self, table: &TableMeta) -> Result<Value> {
        Ok(match table.pk_type {
            PkType::Int | PkType::Float => Value::from(self.primary[table.id].write().next_id()),
            PkType::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
            PkType::TimeId => Value::String(format!("{}-{}", now_ms() / 1000, random_suffix(6))),
            PkType::TimeIdMs => Value::String(format!("{}-{}", now_ms(), random_suffix(4))),
            PkType::String | PkType::Any => {
                return Err(Error::invalid(format!(
                    "row for {} has no {} and the key cannot be generated",
                    table.name, table.pk
                )))
            }
        })
    }

    /// Store `new` and bring every derived index of `table` up to date.
    /// No relation or view cascades.
    pub(crate) fn persist(&self, table: &TableMeta, old: Option<&Row>, new: Row) -> Result<Row> {
        let pk = new
            .get(&table.pk)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| Error::invalid(format!("row for {} has no {}", table.name, table.pk)))?;
        let stored = self.adapter.write(&table.name, Some(&pk), new)?;
        self.primary[table.id].write().add(pk.clone(), true);
        self.indexes.set_indexes(table, &pk, old, &stored)?;

        for sc in &table.search {
            let after = stored.get(&sc.column);
            if old.is_none() || old.and_then(|o| o.get(&sc.column)) != after {
                self.search.update(&table.name, sc, &pk, after)?;
            }
        }
        if !table.tries.is_empty() {
            let mut tries = self.tries[table.id].write();
            for column in &table.tries {
                let before = old.and_then(|o| o.get(column)).and_then(Value::as_str);
                let after = stored.get(column).and_then(Value::as_str);
                if old.is_some() && before == after {
                    continue;
                }
                let trie = tries.entry(column.clone()).or_default();
                if let Some(word) = before {
                    trie.remove(word, &pk);
                }
                if let Some(word) = after {
                    trie.insert(word, pk.clone());
                }
            }
        }
        Ok(stored)
    }

    /// Delete one row and its derived index entries. No cascades.
    pub(crate) fn remove_row(&self, table: &TableMeta, row: &Row) -> Result<()> {
        let Some(pk) = row.get(&table.pk) else {
            return Ok(());
        };
        self.adapter.delete(&table.name, pk)?;
        self.primary[table.id].write().remove(pk, true);
        self.indexes.clear_indexes(table, pk, row)?;
        for sc in &table.search {
            self.search.clear(&table.name, sc, pk)?;
        }
        if !table.tries.is_empty() {
            let mut tries = self.tries[table.id].write();
            for column in &table.tries {
                if let (Some(trie), Some(word)) = (tries.get_mut(column), row.get(column).and_then(Value::as_str)) {
                    trie.remove(word, pk);
                }
            }
        }
        Ok(())
    }
}

impl QueryExecutor<'_> {
    fn upsert_rows(&self) -> Result<Vec<Row>> {
        match &self.query.action_args {
            Some(Value::Object(row)) => Ok(vec![row.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row.clone()),
                    other => Err(Error::invalid(format!("upsert rows must be objects, got {other}"))),
                })
                .collect(),
            _ => Err(Error::invalid(format!("upsert into {} needs row data", self.table.name))),
        }
    }

    fn resolve_pk(&self, row: &Row) -> Result<Value> {
        let table = self.table;
        match row.get(&table.pk) {
            Some(v) if !is_nullish(Some(v)) => coerce_pk(table.pk_type, v)
                .ok_or_else(|| Error::invalid(format!("{v} is not a valid {}.{}", table.name, table.pk))),
            _ => self.db.generate_pk(table),
        }
    }

    fn fill_defaults(&self, row: &mut Row) {
        for (column, default) in self.table.defaults() {
            if !row.contains_key(column) {
                row.insert(column.to_string(), default.clone());
            }
        }
    }

    /// With a WHERE, patch every matching row. Without one, each row is
    /// keyed by its pk (generated when missing) and merged over the stored
    /// row if there is one. Keys are resolved for the whole batch before
    /// anything is written, so one bad key aborts the batch.
    pub(super) fn upsert(&self) -> Result<(Vec<Row>, AccessPath, usize)> {
        let table = self.table;
        let rows = self.upsert_rows()?;
        let mut pairs: Vec<(Option<Row>, Row)> = Vec::with_capacity(rows.len());
        let (access, fetched) = if self.filter.is_some() {
            let [patch] = rows.as_slice() else {
                return Err(Error::invalid("upsert with a where takes a single object"));
            };
            let found = self.fetch()?;
            for old in found.rows {
                let mut new = old.clone();
                for (k, v) in patch {
                    if *k != table.pk {
                        new.insert(k.clone(), v.clone());
                    }
                }
                pairs.push((Some(old), new));
            }
            (found.access, found.fetched)
        } else {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                keyed.push((self.resolve_pk(&row)?, row));
            }
            let mut reads = 0;
            for (pk, row) in keyed {
                let old = self.db.adapter.read(&table.name, &pk)?;
                reads += usize::from(old.is_some());
                let mut new = Row::new();
                new.insert(table.pk.clone(), pk.clone());
                if let Some(old) = &old {
                    new.extend(old.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                new.extend(row);
                new.insert(table.pk.clone(), pk);
                pairs.push((old, new));
            }
            (AccessPath::None, reads)
        };

        let mut stored_rows = Vec::with_capacity(pairs.len());
        for (old, mut new) in pairs {
            self.fill_defaults(&mut new);
            self.db.fill_views(table, &mut new)?;
            let stored = self.db.persist(table, old.as_ref(), new)?;
            self.db.sync_relations(table, old.as_ref(), &stored)?;
            self.db.propagate_views(table, old.as_ref(), &stored)?;
            stored_rows.push(stored);
        }
        self.finish("upsert", stored_rows, access, fetched)
    }

    /// Delete matching rows. Without a WHERE, range or trie lookup this is a
    /// drop that keeps the auto-increment counter. Each row is re-read before removal since an
    /// earlier row's cascade may have edited it.
    pub(super) fn delete(&self) -> Result<(Vec<Row>, AccessPath, usize)> {
        if self.filter.is_none() && self.query.range.is_none() && self.query.trie.is_none() {
            return self.drop_rows(false);
        }
        let table = self.table;
        let found = self.fetch()?;
        let mut removed = Vec::with_capacity(found.rows.len());
        for row in found.rows {
            let Some(pk) = row.get(&table.pk) else {
                continue;
            };
            let Some(current) = self.db.adapter.read(&table.name, pk)? else {
                continue;
            };
            self.db.remove_row(table, &current)?;
            self.db.cascade_delete(table, &current)?;
            removed.push(current);
        }
        self.finish("delete", removed, found.access, found.fetched)
    }

    /// `actionArgs: {resetAI: true}` also restarts the auto-increment counter.
    pub(super) fn drop_all(&self) -> Result<(Vec<Row>, AccessPath, usize)> {
        let reset_ai = self
            .query
            .action_args
            .as_ref()
            .and_then(|a| a.get("resetAI"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.drop_rows(reset_ai)
    }

    /// Remove every row and truncate the table's shadow tables, then run the
    /// delete cascade for each removed row.
    fn drop_rows(&self, reset_ai: bool) -> Result<(Vec<Row>, AccessPath, usize)> {
        let table = self.table;
        let rows = self.db.scan_table(table)?;
        self.db.adapter.drop_table(&table.name)?;
        {
            let mut primary = self.db.primary[table.id].write();
            let mut fresh = primary.clone_empty();
            if reset_ai {
                fresh.reset_ai();
            }
            *primary = fresh;
        }
        self.db.indexes.truncate(table)?;
        for sc in &table.search {
            self.db.search.truncate(&table.name, sc)?;
        }
        self.db.tries[table.id].write().clear();
        for row in &rows {
            self.db.cascade_delete(table, row)?;
        }
        tracing::info!(table = %table.name, rows = rows.len(), reset_ai, "table dropped");
        let fetched = rows.len();
        self.finish("drop", rows, AccessPath::Scan, fetched)
    }

    /// Emit the change event and build the summary row.
    fn finish(&self, action: &str, rows: Vec<Row>, access: AccessPath, fetched: usize) -> Result<(Vec<Row>, AccessPath, usize)> {
        let pks: Vec<Value> = rows.iter().filter_map(|r| r.get(&self.table.pk).cloned()).collect();
        if !rows.is_empty() {
            self.db.emit(ChangeEvent {
                table: self.table.name.clone(),
                action: action.to_string(),
                affected_row_pks: pks.clone(),
                affected_rows: rows.clone(),
                time: now_ms(),
            });
        }
        let n = rows.len();
        let summary = MutationSummary {
            msg: format!("{n} row{} {}", if n == 1 { "" } else { "s" }, past_tense(action)),
            affected_row_pks: pks,
            affected_rows: rows,
        };
        Ok((vec![summary.into_row()], access, fetched))
    }
}
