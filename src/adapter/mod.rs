//! Storage Adapter Contract
//!
//! The engine never touches storage directly. Every user table and every
//! shadow index table is read and written through this trait, so a backend
//! only has to store rows keyed by primary key and answer ordered range reads.
//!
//! Implementations:
//! - `MemoryAdapter`: ordered in-memory maps (reference backend, tests)

mod memory;

pub use memory::MemoryAdapter;

use crate::catalog::TableMeta;
use crate::error::Result;
use crate::types::Row;
use serde_json::Value;

/// Which rows a range read visits.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadRange {
    /// Whole table in key order.
    All,
    /// Primary key bounds, both inclusive.
    Keys(Value, Value),
    /// Positional window `[from, to)` over the key order.
    Offsets(usize, usize),
}

pub trait StorageAdapter: Send + Sync {
    /// Database id, set once before `connect`.
    fn set_id(&self, id: &str);

    /// Declare a table before `connect`. Idempotent.
    fn make_table(&self, table: &TableMeta) -> Result<()>;

    fn connect(&self) -> Result<()>;

    /// Store a row. `None` asks the backend to generate the key.
    /// Returns the row as stored, primary key included.
    fn write(&self, table: &str, pk: Option<&Value>, row: Row) -> Result<Row>;

    /// Absent keys are `Ok(None)`, never an error.
    fn read(&self, table: &str, pk: &Value) -> Result<Option<Row>>;

    fn range_read(&self, table: &str, range: ReadRange, on_row: &mut dyn FnMut(Row)) -> Result<()>;

    fn delete(&self, table: &str, pk: &Value) -> Result<()>;

    /// Remove every row, keep the table declared.
    fn drop_table(&self, table: &str) -> Result<()>;

    /// Every primary key in key order.
    fn get_index(&self, table: &str) -> Result<Vec<Value>>;

    fn get_index_length(&self, table: &str) -> Result<usize>;

    fn destroy(&self) -> Result<()>;

    /// Rows for many keys; absent keys are skipped.
    fn batch_read(&self, table: &str, pks: &[Value]) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(pks.len());
        for pk in pks {
            if let Some(row) = self.read(table, pk)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}
