//! ShadowStore — rows of the hidden index tables, cached or write-through.
//!
//! Cached mode keeps every shadow table in memory, marks touched keys dirty and
//! persists them on `flush()` (called by a single-flight background thread and
//! on demand). Uncached mode does a synchronous read-modify-write against the
//! adapter for every change; callers serialize through the per-table queue.

use crate::adapter::{ReadRange, StorageAdapter};
use crate::error::Result;
use crate::types::{pk_key, Row};
use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Table = AHashMap<String, Row>;

/// Cache slot for a shadow row id. Strings are tagged so `7` and `"7"` keep
/// separate rows, as they do in the backend.
fn slot(id: &Value) -> String {
    match id {
        Value::String(s) => format!("s:{s}"),
        other => pk_key(other),
    }
}

pub struct ShadowStore {
    adapter: Arc<dyn StorageAdapter>,
    cached: bool,
    /// table → key → row (cached mode only)
    tables: DashMap<String, Table>,
    /// table → keys with unsaved changes; a dirty key missing from `tables` is a delete
    dirty: DashMap<String, AHashMap<String, Value>>,
    flush_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl ShadowStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>, cached: bool) -> Self {
        Self {
            adapter,
            cached,
            tables: DashMap::new(),
            dirty: DashMap::new(),
            flush_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Pull a whole shadow table into memory (cached mode) or just scan it.
    pub fn load(&self, table: &str) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.adapter.range_read(table, ReadRange::All, &mut |row| rows.push(row))?;
        if self.cached {
            let map: Table = rows
                .iter()
                .filter_map(|r| r.get("id").map(|id| (slot(id), r.clone())))
                .collect();
            self.tables.insert(table.to_string(), map);
        }
        Ok(rows)
    }

    pub fn get(&self, table: &str, id: &Value) -> Result<Option<Row>> {
        if self.cached {
            return Ok(self.tables.get(table).and_then(|t| t.get(&slot(id)).cloned()));
        }
        self.adapter.read(table, id)
    }

    /// Every row of a shadow table.
    pub fn scan(&self, table: &str) -> Result<Vec<Row>> {
        if self.cached {
            return Ok(self.tables.get(table).map(|t| t.values().cloned().collect()).unwrap_or_default());
        }
        let mut rows = Vec::new();
        self.adapter.range_read(table, ReadRange::All, &mut |row| rows.push(row))?;
        Ok(rows)
    }

    /// Read-modify-write of one row. `edit` receives the current row (if any)
    /// and returns the replacement; `None` deletes.
    pub fn update<F>(&self, table: &str, id: &Value, edit: F) -> Result<()>
    where
        F: FnOnce(Option<Row>) -> Option<Row>,
    {
        let key = slot(id);
        if self.cached {
            {
                let mut t = self.tables.entry(table.to_string()).or_default();
                let current = t.remove(&key);
                if let Some(mut row) = edit(current) {
                    row.insert("id".to_string(), id.clone());
                    t.insert(key.clone(), row);
                }
            }
            self.dirty.entry(table.to_string()).or_default().insert(key, id.clone());
            return Ok(());
        }
        let current = self.adapter.read(table, id)?;
        let existed = current.is_some();
        match edit(current) {
            Some(mut row) => {
                row.insert("id".to_string(), id.clone());
                self.adapter.write(table, Some(id), row)?;
            }
            None if existed => self.adapter.delete(table, id)?,
            None => {}
        }
        Ok(())
    }

    pub fn put(&self, table: &str, row: Row) -> Result<()> {
        let id = row.get("id").cloned().unwrap_or(Value::Null);
        self.update(table, &id, move |_| Some(row))
    }

    pub fn remove(&self, table: &str, id: &Value) -> Result<()> {
        self.update(table, id, |_| None)
    }

    /// Empty a shadow table in memory and in the backend.
    pub fn truncate(&self, table: &str) -> Result<()> {
        if self.cached {
            self.tables.insert(table.to_string(), Table::new());
            self.dirty.remove(table);
        }
        self.adapter.drop_table(table)
    }

    /// Replace a shadow table wholesale.
    pub fn replace_all(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        self.truncate(table)?;
        for row in rows {
            self.put(table, row)?;
        }
        Ok(())
    }

    /// Persist every dirty key. Forced flushes wait for a running one.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.flush_dirty()
    }

    /// Background tick: skip when another flush is already running.
    fn try_flush(&self) -> Option<Result<()>> {
        let _guard = self.flush_lock.try_lock()?;
        Some(self.flush_dirty())
    }

    fn flush_dirty(&self) -> Result<()> {
        if !self.cached {
            return Ok(());
        }
        let names: Vec<String> = self.dirty.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let keys = match self.dirty.remove(&name) {
                Some((_, keys)) => keys,
                None => continue,
            };
            let ops: Vec<(Value, Option<Row>)> = match self.tables.get(&name) {
                Some(t) => keys.iter().map(|(key, id)| (id.clone(), t.get(key).cloned())).collect(),
                None => keys.values().map(|id| (id.clone(), None)).collect(),
            };
            let persisted = ops.into_iter().try_for_each(|(id, row)| match row {
                Some(row) => self.adapter.write(&name, Some(&id), row).map(|_| ()),
                None => self.adapter.delete(&name, &id),
            });
            if let Err(err) = persisted {
                // keep the batch dirty so the next flush retries it
                self.dirty.entry(name).or_default().extend(keys);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.iter().map(|e| e.value().len()).sum()
    }

    /// Spawn the periodic flusher. It holds only a weak handle and exits once
    /// the store is stopped or dropped.
    pub fn start_flusher(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.cached {
            return None;
        }
        let weak: Weak<ShadowStore> = Arc::downgrade(self);
        let spawned = thread::Builder::new().name("tabel-flush".into()).spawn(move || loop {
            thread::sleep(interval);
            let Some(store) = weak.upgrade() else { break };
            if store.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Some(Err(err)) = store.try_flush() {
                tracing::warn!(error = %err, "background index flush failed");
            }
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "could not start index flusher, flushing on demand only");
                None
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::catalog::{Catalog, ColumnDecl, TableDecl};
    use serde_json::json;

    fn store(cached: bool) -> (Arc<MemoryAdapter>, ShadowStore) {
        let cat = Catalog::build(&[TableDecl::new(
            "t",
            vec![ColumnDecl::new("id", "int").props(&["pk"]), ColumnDecl::new("n", "int").props(&["idx"])],
        )])
        .unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        for t in cat.tables() {
            adapter.make_table(t).unwrap();
        }
        let s = ShadowStore::new(adapter.clone(), cached);
        (adapter, s)
    }

    fn posting(pks: Vec<i64>) -> Row {
        json!({"rows": pks}).as_object().unwrap().clone()
    }

    #[test]
    fn test_cached_defers_until_flush() {
        let (adapter, s) = store(true);
        s.update("_idx_t_n", &json!(5), |_| Some(posting(vec![1, 2]))).unwrap();
        assert_eq!(s.get("_idx_t_n", &json!(5)).unwrap().unwrap()["rows"], json!([1, 2]));
        assert!(adapter.read("_idx_t_n", &json!(5)).unwrap().is_none());
        assert_eq!(s.dirty_len(), 1);

        s.flush().unwrap();
        assert_eq!(adapter.read("_idx_t_n", &json!(5)).unwrap().unwrap()["rows"], json!([1, 2]));
        assert_eq!(s.dirty_len(), 0);

        s.remove("_idx_t_n", &json!(5)).unwrap();
        s.flush().unwrap();
        assert!(adapter.read("_idx_t_n", &json!(5)).unwrap().is_none());
    }

    #[test]
    fn test_uncached_writes_through() {
        let (adapter, s) = store(false);
        s.update("_idx_t_n", &json!("x"), |_| Some(posting(vec![7]))).unwrap();
        assert_eq!(adapter.read("_idx_t_n", &json!("x")).unwrap().unwrap()["id"], json!("x"));
        s.update("_idx_t_n", &json!("x"), |cur| {
            let mut row = cur.unwrap();
            row.insert("rows".into(), json!([7, 8]));
            Some(row)
        })
        .unwrap();
        assert_eq!(s.scan("_idx_t_n").unwrap().len(), 1);
        assert_eq!(s.get("_idx_t_n", &json!("x")).unwrap().unwrap()["rows"], json!([7, 8]));
    }

    #[test]
    fn test_background_flusher() {
        let (adapter, s) = store(true);
        let s = Arc::new(s);
        let handle = s.start_flusher(Duration::from_millis(5)).unwrap();
        s.put("_idx_t_n", json!({"id": 1, "rows": [3]}).as_object().unwrap().clone()).unwrap();
        let mut persisted = false;
        for _ in 0..200 {
            if adapter.read("_idx_t_n", &json!(1)).unwrap().is_some() {
                persisted = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(persisted);
        s.stop();
        handle.join().unwrap();
    }
}
