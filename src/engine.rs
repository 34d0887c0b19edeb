//! TabelDB: the engine handle.
//!
//! Owns the catalog, one primary index per table, the secondary / full-text /
//! trie indexes and the storage adapter. Every query goes through
//! [`TabelDB::query`]; mutations notify change listeners once they are applied.

use crate::adapter::{ReadRange, StorageAdapter};
use crate::catalog::{exact_table, fuzzy_table, token_table, Catalog, ColumnDecl, TableDecl, TableId, TableMeta};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::QueryExecutor;
use crate::expr::Evaluator;
use crate::functions::FunctionRegistry;
use crate::index::{IndexManager, SearchIndex, ShadowStore, Tokenizer, TokenizerRegistry};
use crate::primary::PrimaryIndex;
use crate::query::{Action, Query};
use crate::trie::PrefixTrie;
use crate::types::{AccessPath, ChangeEvent, Outcome, Row, Trace};
use ahash::AHashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use smallvec::SmallVec;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Queue guards held by one mutation. Most writes touch one to three tables.
pub(crate) type TableLocks<'a> = SmallVec<[MutexGuard<'a, ()>; 4]>;

pub struct TabelDB {
    pub(crate) config: Config,
    pub(crate) adapter: Arc<dyn StorageAdapter>,
    pub(crate) catalog: Catalog,
    /// indexed by `TableId`; shadow tables keep an unused empty index
    pub(crate) primary: Vec<RwLock<PrimaryIndex>>,
    pub(crate) store: Arc<ShadowStore>,
    pub(crate) indexes: IndexManager,
    pub(crate) search: SearchIndex,
    /// table id → column → trie
    pub(crate) tries: Vec<RwLock<AHashMap<String, PrefixTrie>>>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) tokenizers: Arc<TokenizerRegistry>,
    pub(crate) evaluator: Evaluator,
    /// Per-table write queue, held by every mutation and rebuild.
    queues: Vec<Mutex<()>>,
    listeners: RwLock<Vec<ChangeListener>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl TabelDB {
    /// Declare every table with the adapter, connect, then load primary keys
    /// and index state.
    pub fn connect(schema: Vec<TableDecl>, adapter: Arc<dyn StorageAdapter>, config: Config) -> Result<Self> {
        let catalog = Catalog::build(&schema)?;
        let tokenizers = Arc::new(TokenizerRegistry::new(&config.default_tokenizer));
        let store = Arc::new(ShadowStore::new(adapter.clone(), config.cache));
        let search = SearchIndex::new(store.clone(), tokenizers.clone());
        for table in catalog.user_tables() {
            for sc in &table.search {
                search.check_tokenizer(sc)?;
            }
        }

        adapter.set_id(&config.id);
        for table in catalog.tables() {
            adapter.make_table(table)?;
        }
        adapter.connect()?;

        let db = Self {
            primary: catalog.tables().map(|t| RwLock::new(PrimaryIndex::new(t.pk_type, t.ai))).collect(),
            tries: catalog.tables().map(|_| RwLock::new(AHashMap::new())).collect(),
            queues: catalog.tables().map(|_| Mutex::new(())).collect(),
            indexes: IndexManager::new(store.clone()),
            functions: FunctionRegistry::new(),
            evaluator: Evaluator::new(),
            listeners: RwLock::new(Vec::new()),
            flusher: Mutex::new(None),
            config,
            adapter,
            catalog,
            store,
            search,
            tokenizers,
        };
        db.load()?;
        if db.config.cache {
            *db.flusher.lock() = db.store.start_flusher(db.config.flush_interval());
        }
        tracing::info!(
            id = %db.config.id,
            tables = db.catalog.user_tables().count(),
            cached = db.config.cache,
            "database connected"
        );
        Ok(db)
    }

    fn load(&self) -> Result<()> {
        for table in self.catalog.user_tables() {
            let pks = self.adapter.get_index(&table.name)?;
            tracing::debug!(table = %table.name, rows = pks.len(), "primary index loaded");
            self.primary[table.id].write().set(pks);
            self.indexes.load(table)?;
            if self.store.is_cached() {
                for sc in &table.search {
                    self.store.load(&token_table(&table.name, &sc.column))?;
                    self.store.load(&exact_table(&table.name, &sc.column))?;
                    self.store.load(&fuzzy_table(&table.name, &sc.column))?;
                }
            }
            if !table.tries.is_empty() {
                let rows = self.scan_table(table)?;
                self.fill_tries(table, &rows);
            }
        }
        Ok(())
    }

    fn fill_tries(&self, table: &TableMeta, rows: &[Row]) {
        let mut tries = self.tries[table.id].write();
        tries.clear();
        for column in &table.tries {
            let trie = tries.entry(column.clone()).or_default();
            for row in rows {
                if let (Some(pk), Some(Value::String(word))) = (row.get(&table.pk), row.get(column)) {
                    trie.insert(word, pk.clone());
                }
            }
        }
    }

    /// Run a query and return its rows.
    pub fn query(&self, query: Query) -> Result<Vec<Row>> {
        self.query_traced(query).map(|o| o.rows)
    }

    /// Parse a JSON query document and run it.
    pub fn query_json(&self, json: &str) -> Result<Vec<Row>> {
        let query: Query = serde_json::from_str(json)?;
        self.query(query)
    }

    /// Run a query and report how its rows were found.
    pub fn query_traced(&self, query: Query) -> Result<Outcome> {
        let started = Instant::now();
        let action = Action::parse(&query.action)?;
        let (rows, access, fetched) = match action {
            Action::ShowTables => {
                let rows: Vec<Row> = self.catalog.user_tables().map(|t| single("table", Value::from(t.name.clone()))).collect();
                (rows, AccessPath::None, 0)
            }
            Action::Describe => (self.describe(&query.table)?, AccessPath::None, 0),
            Action::RebuildIndexes => {
                let table = (!query.table.is_empty()).then_some(query.table.as_str());
                let count = self.rebuild_indexes(table)?;
                (vec![single("msg", Value::from(format!("{count} table(s) reindexed")))], AccessPath::None, 0)
            }
            Action::Select | Action::Upsert | Action::Delete | Action::Drop => {
                let table = self.user_table(&query.table)?;
                let _locks = if action == Action::Select { TableLocks::new() } else { self.lock_tables(table.id) };
                let exec = QueryExecutor::new(self, table, &query, action)?;
                exec.run()?
            }
        };
        let trace = Trace {
            access,
            fetched,
            returned: rows.len(),
            time_us: started.elapsed().as_micros() as u64,
        };
        tracing::debug!(
            table = %query.table,
            action = action.name(),
            access = ?trace.access,
            fetched = trace.fetched,
            returned = trace.returned,
            time_us = trace.time_us,
            "query done"
        );
        Ok(Outcome { rows, trace })
    }

    /// Access path a select would take, without reading any rows.
    pub fn explain(&self, query: &Query) -> Result<AccessPath> {
        let table = self.user_table(&query.table)?;
        let action = Action::parse(&query.action)?;
        Ok(QueryExecutor::new(self, table, query, action)?.access_path())
    }

    pub(crate) fn user_table(&self, name: &str) -> Result<&TableMeta> {
        let table = self.catalog.table(name)?;
        if table.hidden {
            return Err(Error::invalid(format!("{name} is an internal table")));
        }
        Ok(table)
    }

    /// Serialize writes on every table the mutation can reach. Caching only
    /// defers persistence; the read, merge, persist and reindex of a row must
    /// not interleave with another writer. Locks are taken in table id order.
    fn lock_tables(&self, table: TableId) -> TableLocks<'_> {
        self.catalog.write_closure(table).into_iter().map(|id| self.queues[id].lock()).collect()
    }

    fn describe(&self, name: &str) -> Result<Vec<Row>> {
        let table = self.user_table(name)?;
        table
            .columns
            .iter()
            .map(|c: &ColumnDecl| match serde_json::to_value(c)? {
                Value::Object(row) => Ok(row),
                other => Err(Error::invalid(format!("column {} described as {other}", c.key))),
            })
            .collect()
    }

    /// Register a change listener, called after every applied mutation.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Rebuild primary, secondary, full-text and trie indexes from the rows
    /// themselves. Drops tombstoned posting lists. Returns the number of
    /// tables processed.
    pub fn rebuild_indexes(&self, table: Option<&str>) -> Result<usize> {
        let targets: Vec<&TableMeta> = match table {
            Some(name) => vec![self.user_table(name)?],
            None => self.catalog.user_tables().collect(),
        };
        for table in &targets {
            let _locks = self.lock_tables(table.id);
            let rows = self.scan_table(table)?;
            self.primary[table.id].write().set(self.adapter.get_index(&table.name)?);
            self.indexes.rebuild(table, &rows)?;
            for sc in &table.search {
                let pairs = rows.iter().filter_map(|r| r.get(&table.pk).map(|pk| (pk, r.get(&sc.column))));
                self.search.rebuild(&table.name, sc, pairs)?;
            }
            self.fill_tries(table, &rows);
            tracing::info!(table = %table.name, rows = rows.len(), "indexes rebuilt");
        }
        self.flush()?;
        Ok(targets.len())
    }

    /// Every row of a table, in key order.
    pub(crate) fn scan_table(&self, table: &TableMeta) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.adapter.range_read(&table.name, ReadRange::All, &mut |row| rows.push(row))?;
        Ok(rows)
    }

    /// Persist cached index state now.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Stop background work and drop every table in the backend.
    pub fn destroy(&self) -> Result<()> {
        self.store.stop();
        self.adapter.destroy()
    }

    pub fn register_scalar<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.functions.register_scalar(name, f);
    }

    pub fn register_aggregate<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.functions.register_aggregate(name, f);
    }

    /// Make a tokenizer available to `search` columns. Columns naming it must
    /// be reindexed with `rebuild_indexes` if they already hold rows.
    pub fn register_tokenizer(&self, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizers.register(tokenizer);
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rows currently tracked by a table's primary index.
    pub fn count(&self, table: &str) -> Result<usize> {
        Ok(self.primary[self.user_table(table)?.id].read().len())
    }
}

impl Drop for TabelDB {
    fn drop(&mut self) {
        self.store.stop();
        if let Err(err) = self.store.flush() {
            tracing::warn!(error = %err, "final index flush failed");
        }
        self.flusher.lock().take();
    }
}

fn single(key: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert(key.to_string(), value);
    row
}
