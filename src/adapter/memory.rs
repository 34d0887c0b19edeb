//! In-memory adapter: one ordered map per table.

use super::{ReadRange, StorageAdapter};
use crate::catalog::TableMeta;
use crate::error::{Error, Result};
use crate::types::{total_cmp, OrdValue, PkType, Row};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

struct MemTable {
    pk: String,
    pk_type: PkType,
    next_ai: i64,
    rows: BTreeMap<OrdValue, Row>,
}

impl MemTable {
    fn generate_pk(&mut self) -> Value {
        match self.pk_type {
            PkType::Int | PkType::Float => {
                let id = self.next_ai;
                self.next_ai += 1;
                Value::from(id)
            }
            _ => Value::String(uuid::Uuid::new_v4().to_string()),
        }
    }
}

#[derive(Default)]
pub struct MemoryAdapter {
    id: RwLock<String>,
    tables: RwLock<AHashMap<String, MemTable>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    fn missing(table: &str) -> Error {
        Error::adapter(format!("memory adapter: table {table} does not exist"))
    }
}

impl StorageAdapter for MemoryAdapter {
    fn set_id(&self, id: &str) {
        *self.id.write() = id.to_string();
    }

    fn make_table(&self, table: &TableMeta) -> Result<()> {
        self.tables.write().entry(table.name.clone()).or_insert_with(|| MemTable {
            pk: table.pk.clone(),
            pk_type: table.pk_type,
            next_ai: 1,
            rows: BTreeMap::new(),
        });
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn write(&self, table: &str, pk: Option<&Value>, mut row: Row) -> Result<Row> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        let key = match pk {
            Some(v) if !v.is_null() => v.clone(),
            _ => t.generate_pk(),
        };
        if let Some(n) = key.as_i64() {
            t.next_ai = t.next_ai.max(n + 1);
        }
        row.insert(t.pk.clone(), key.clone());
        t.rows.insert(OrdValue(key), row.clone());
        Ok(row)
    }

    fn read(&self, table: &str, pk: &Value) -> Result<Option<Row>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.get(&OrdValue(pk.clone())).cloned())
    }

    fn range_read(&self, table: &str, range: ReadRange, on_row: &mut dyn FnMut(Row)) -> Result<()> {
        // copy out first so the callback runs without the lock held
        let rows: Vec<Row> = {
            let tables = self.tables.read();
            let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
            match range {
                ReadRange::All => t.rows.values().cloned().collect(),
                ReadRange::Keys(lo, hi) => {
                    if total_cmp(&lo, &hi) == Ordering::Greater {
                        Vec::new()
                    } else {
                        let bounds = (Bound::Included(OrdValue(lo)), Bound::Included(OrdValue(hi)));
                        t.rows.range(bounds).map(|(_, r)| r.clone()).collect()
                    }
                }
                ReadRange::Offsets(from, to) => t
                    .rows
                    .values()
                    .skip(from)
                    .take(to.saturating_sub(from))
                    .cloned()
                    .collect(),
            }
        };
        for row in rows {
            on_row(row);
        }
        Ok(())
    }

    fn delete(&self, table: &str, pk: &Value) -> Result<()> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        t.rows.remove(&OrdValue(pk.clone()));
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        t.rows.clear();
        Ok(())
    }

    fn get_index(&self, table: &str) -> Result<Vec<Value>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.keys().map(|k| k.0.clone()).collect())
    }

    fn get_index_length(&self, table: &str) -> Result<usize> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.len())
    }

    fn destroy(&self) -> Result<()> {
        self.tables.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ColumnDecl, TableDecl};
    use serde_json::json;

    fn adapter() -> MemoryAdapter {
        let cat = Catalog::build(&[TableDecl::new(
            "t",
            vec![ColumnDecl::new("id", "int").props(&["pk", "ai"]), ColumnDecl::new("v", "string")],
        )])
        .unwrap();
        let a = MemoryAdapter::new();
        a.make_table(cat.table("t").unwrap()).unwrap();
        a.connect().unwrap();
        a
    }

    fn row(v: serde_json::Value) -> Row {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_write_read_generated_pk() {
        let a = adapter();
        let first = a.write("t", None, row(json!({"v": "a"}))).unwrap();
        let second = a.write("t", None, row(json!({"v": "b"}))).unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));
        assert_eq!(a.read("t", &json!(2)).unwrap().unwrap()["v"], json!("b"));
        assert!(a.read("t", &json!(99)).unwrap().is_none());
    }

    #[test]
    fn test_range_reads() {
        let a = adapter();
        for i in 1..=10 {
            a.write("t", Some(&json!(i)), row(json!({"v": i.to_string()}))).unwrap();
        }
        let mut seen = Vec::new();
        a.range_read("t", ReadRange::Keys(json!(3), json!(5)), &mut |r| seen.push(r["id"].clone())).unwrap();
        assert_eq!(seen, vec![json!(3), json!(4), json!(5)]);

        seen.clear();
        a.range_read("t", ReadRange::Offsets(8, 20), &mut |r| seen.push(r["id"].clone())).unwrap();
        assert_eq!(seen, vec![json!(9), json!(10)]);

        seen.clear();
        a.range_read("t", ReadRange::Keys(json!(5), json!(3)), &mut |r| seen.push(r["id"].clone())).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn test_missing_table_is_adapter_error() {
        let a = MemoryAdapter::new();
        assert!(matches!(a.read("nope", &json!(1)), Err(Error::Adapter(_))));
    }
}
