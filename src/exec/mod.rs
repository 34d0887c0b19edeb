//! Query execution
//!
//! A `QueryExecutor` is built per query: it compiles every clause up front,
//! runs full-text searches once, then picks an access path and drives the
//! select pipeline or a mutation.
//!
//! - `fetch`: access path choice and row retrieval
//! - `join`: nested-loop joins
//! - `pipeline`: grouping, ORM expansion, projection, HAVING, ordering, paging
//! - `write`: upsert / delete / drop
//! - `cascade`: ORM reverse-column sync and view propagation

mod cascade;
mod fetch;
mod join;
mod pipeline;
mod write;

use crate::catalog::TableMeta;
use crate::engine::TabelDB;
use crate::error::{Error, Result};
use crate::expr::{EvalCtx, PkSet, SearchHits};
use crate::query::{
    parse_joins, parse_orm, parse_projections, parse_sort, Action, CompileMode, JoinPlan, OrmPlan, Projection, Query,
    SortKey, Where, WhereCompiler,
};
use crate::types::{AccessPath, Row};
use ahash::AHashMap;
use serde_json::Value;

pub struct QueryExecutor<'db> {
    db: &'db TabelDB,
    table: &'db TableMeta,
    query: &'db Query,
    action: Action,
    filter: Option<Where>,
    joins: Vec<JoinPlan>,
    orm: Vec<OrmPlan>,
    columns: Option<Vec<Projection>>,
    having: Option<Where>,
    order: Vec<SortKey>,
    group: Vec<SortKey>,
    /// pk path inside rows the WHERE sees (`table.pk` once joined)
    pk_path: String,
    /// search condition id → scores by pk key
    search: SearchHits,
    /// search condition id → matching pks
    search_sets: AHashMap<usize, PkSet>,
}

impl<'db> QueryExecutor<'db> {
    pub fn new(db: &'db TabelDB, table: &'db TableMeta, query: &'db Query, action: Action) -> Result<Self> {
        let functions = &db.functions;
        let depth = db.config.max_where_depth;
        let compile = |value: &Value, mode| WhereCompiler::new(functions, depth, mode).compile(value);

        let filter = query.where_clause.as_ref().map(|w| compile(w, CompileMode::Where)).transpose()?;
        let joins = query.join.as_ref().map(|j| parse_joins(j, functions, depth)).transpose()?.unwrap_or_default();
        let orm = query.orm.as_deref().map(|o| parse_orm(o, functions, depth)).transpose()?.unwrap_or_default();
        if !joins.is_empty() && !orm.is_empty() {
            return Err(Error::invalid("join and orm cannot be used in the same query"));
        }
        if !joins.is_empty() && action != Action::Select {
            return Err(Error::invalid(format!("join is not supported on {}", action.name())));
        }
        for j in &joins {
            db.user_table(&j.table)?;
        }
        for o in &orm {
            if !table.relations.iter().any(|r| r.column == o.key) {
                return Err(Error::invalid(format!("{}.{} is not a relation column", table.name, o.key)));
            }
        }

        let columns = match (action, &query.action_args) {
            (Action::Select, Some(args)) if !args.is_null() => Some(parse_projections(args, functions)?),
            _ => None,
        };
        let having = query.having.as_ref().map(|h| compile(h, CompileMode::Having)).transpose()?;
        let order = query.order_by.as_ref().map(parse_sort).transpose()?.unwrap_or_default();
        let group = query.group_by.as_ref().map(parse_sort).transpose()?.unwrap_or_default();
        let pk_path = if joins.is_empty() { table.pk.clone() } else { format!("{}.{}", table.name, table.pk) };

        let mut exec = Self {
            db,
            table,
            query,
            action,
            filter,
            joins,
            orm,
            columns,
            having,
            order,
            group,
            pk_path,
            search: SearchHits::new(),
            search_sets: AHashMap::new(),
        };
        exec.run_searches()?;
        Ok(exec)
    }

    /// Rows, access path and number of rows read before filtering.
    pub fn run(&self) -> Result<(Vec<Row>, AccessPath, usize)> {
        match self.action {
            Action::Select => self.select(),
            Action::Upsert => self.upsert(),
            Action::Delete => self.delete(),
            Action::Drop => self.drop_all(),
            other => Err(Error::invalid(format!("{} is not a table query", other.name()))),
        }
    }

    fn ctx(&self) -> EvalCtx<'_> {
        EvalCtx::new(&self.pk_path, &self.search)
    }

    /// Re-check a fetched row against the whole WHERE.
    fn keep(&self, row: &Row) -> Result<bool> {
        match &self.filter {
            Some(w) => self.db.evaluator.matches(w, row, &self.ctx()),
            None => Ok(true),
        }
    }
}
