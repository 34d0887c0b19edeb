// Tabel v0.4.0 - Embedded Table Database Engine
// Secondary indexes, full-text search, ORM relations and views over a pluggable storage adapter

pub mod adapter;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod expr;
pub mod functions;
pub mod geo;
pub mod index;
pub mod primary;
pub mod query;
pub mod trie;
pub mod types;

// Re-export main types
pub use adapter::{MemoryAdapter, ReadRange, StorageAdapter};
pub use catalog::{schema_from_json, ColumnDecl, RelationDecl, TableDecl, ViewDecl, ViewMode};
pub use config::Config;
pub use engine::TabelDB;
pub use error::{Error, Result};
pub use index::Tokenizer;
pub use query::Query;
pub use types::{AccessPath, ChangeEvent, Outcome, Row, Trace};
