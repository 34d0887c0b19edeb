//! Table Catalog
//!
//! Built once at connect from the schema declaration and immutable afterwards.
//! Tables live in an arena addressed by `TableId`; ORM relations and view
//! bindings are adjacency lists keyed by id, so cyclic relation graphs need no
//! shared references.
//!
//! Every secondary index and search column gets hidden shadow tables:
//! - `_idx_{table}_{column}`: `{id: indexKey, rows: [pk...]}`
//! - `_fts_tokens_{table}_{column}`: `{id: pk, hash, tokens}`
//! - `_fts_exact_{table}_{column}` / `_fts_fuzzy_{table}_{column}`: `{id: term, rows: [{pk, i, l}]}`

use crate::error::{Error, Result};
use crate::types::{ColumnType, PkType};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TableId = usize;

/// Column name used when a table declares no primary key.
pub const IMPLICIT_PK: &str = "_id";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RelationDecl {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ViewDecl {
    pub table: String,
    pub by: String,
    pub column: String,
    #[serde(default)]
    pub mode: ViewMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Source delete nulls the mirrored value.
    #[default]
    Live,
    /// Source delete leaves the last value in place.
    Ghost,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ColumnDecl {
    pub key: String,
    #[serde(rename = "type", default = "any_type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<ViewDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
}

fn any_type() -> String {
    "any".to_string()
}

impl ColumnDecl {
    pub fn new(key: &str, ty: &str) -> Self {
        Self {
            key: key.to_string(),
            ty: ty.to_string(),
            props: Vec::new(),
            default: None,
            relation: None,
            view: None,
            tokenizer: None,
        }
    }

    pub fn props(mut self, props: &[&str]) -> Self {
        self.props = props.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn has(&self, prop: &str) -> bool {
        self.props.iter().any(|p| p.eq_ignore_ascii_case(prop))
    }
}

#[derive(Clone, Debug)]
pub struct TableDecl {
    pub name: String,
    pub columns: Vec<ColumnDecl>,
}

impl TableDecl {
    pub fn new(name: &str, columns: Vec<ColumnDecl>) -> Self {
        Self { name: name.to_string(), columns }
    }
}

/// Parse `{table: [columnDecl...]}` keeping declaration order.
pub fn schema_from_json(schema: &Value) -> Result<Vec<TableDecl>> {
    let tables = schema
        .as_object()
        .ok_or_else(|| Error::config("schema must be an object of table -> columns"))?;
    tables
        .iter()
        .map(|(name, cols)| {
            let columns: Vec<ColumnDecl> = serde_json::from_value(cols.clone())
                .map_err(|e| Error::config(format!("table {name}: {e}")))?;
            Ok(TableDecl { name: name.clone(), columns })
        })
        .collect()
}

/// ORM edge: `column` holds primary keys of `target`.
#[derive(Clone, Debug)]
pub struct Relation {
    pub column: String,
    pub target: TableId,
    pub many: bool,
    /// Column on `target` kept in sync with this one.
    pub reverse: Option<String>,
}

/// `column` mirrors `source.source_column` of the row whose pk is in `by`.
#[derive(Clone, Debug)]
pub struct ViewBinding {
    pub column: String,
    pub source: TableId,
    pub by: String,
    pub source_column: String,
    pub mode: ViewMode,
}

#[derive(Clone, Debug)]
pub struct SearchColumn {
    pub column: String,
    pub tokenizer: String,
}

#[derive(Clone, Debug)]
pub struct TableMeta {
    pub id: TableId,
    pub name: String,
    pub pk: String,
    pub pk_type: PkType,
    pub ai: bool,
    pub columns: Vec<ColumnDecl>,
    /// Indexed column paths; an indexed geo column contributes `col.lat` and `col.lon`.
    pub indexes: Vec<String>,
    pub geo_indexed: Vec<String>,
    pub search: Vec<SearchColumn>,
    pub tries: Vec<String>,
    pub relations: Vec<Relation>,
    pub views: Vec<ViewBinding>,
    pub hidden: bool,
}

impl TableMeta {
    pub fn column(&self, key: &str) -> Option<&ColumnDecl> {
        self.columns.iter().find(|c| c.key == key)
    }

    pub fn is_indexed(&self, column: &str) -> bool {
        column == self.pk || self.indexes.iter().any(|c| c == column)
    }

    pub fn search_column(&self, column: &str) -> Option<&SearchColumn> {
        self.search.iter().find(|s| s.column == column)
    }

    pub fn defaults(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().filter_map(|c| c.default.as_ref().map(|d| (c.key.as_str(), d)))
    }
}

pub fn index_table(table: &str, column: &str) -> String {
    format!("_idx_{table}_{column}")
}

pub fn token_table(table: &str, column: &str) -> String {
    format!("_fts_tokens_{table}_{column}")
}

pub fn exact_table(table: &str, column: &str) -> String {
    format!("_fts_exact_{table}_{column}")
}

pub fn fuzzy_table(table: &str, column: &str) -> String {
    format!("_fts_fuzzy_{table}_{column}")
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: Vec<TableMeta>,
    by_name: AHashMap<String, TableId>,
    /// target → [(source table, relation index on source)]
    rel_to: AHashMap<TableId, Vec<(TableId, usize)>>,
    /// source → [(dependent table, view index on dependent)]
    views_from: AHashMap<TableId, Vec<(TableId, usize)>>,
}

impl Catalog {
    pub fn build(decls: &[TableDecl]) -> Result<Self> {
        let mut cat = Catalog::default();
        for decl in decls {
            if decl.name.starts_with('_') {
                return Err(Error::config(format!("table name {} is reserved", decl.name)));
            }
            if cat.by_name.contains_key(&decl.name) {
                return Err(Error::config(format!("table {} declared twice", decl.name)));
            }
            let id = cat.tables.len();
            cat.by_name.insert(decl.name.clone(), id);
            cat.tables.push(Self::describe_table(id, decl)?);
        }

        // relations and views need every user table registered first
        for decl in decls {
            let id = cat.by_name[&decl.name];
            for col in &decl.columns {
                let ty = ColumnType::parse(&col.ty);
                let target = match &col.relation {
                    Some(rel) => Some(rel.table.clone()),
                    None if cat.by_name.contains_key(&ty.base) => Some(ty.base.clone()),
                    None => None,
                };
                if let Some(target) = target {
                    let target_id = *cat.by_name.get(&target).ok_or_else(|| {
                        Error::config(format!("{}.{} relates to unknown table {target}", decl.name, col.key))
                    })?;
                    let reverse = col.relation.as_ref().and_then(|r| r.reverse.clone());
                    cat.add_relation(id, col.key.clone(), target_id, ty.array, reverse)?;
                }
                if let Some(view) = &col.view {
                    let source = *cat.by_name.get(&view.table).ok_or_else(|| {
                        Error::config(format!("{}.{} views unknown table {}", decl.name, col.key, view.table))
                    })?;
                    let binding = ViewBinding {
                        column: col.key.clone(),
                        source,
                        by: view.by.clone(),
                        source_column: view.column.clone(),
                        mode: view.mode,
                    };
                    let views = &mut cat.tables[id].views;
                    views.push(binding);
                    let at = views.len() - 1;
                    cat.views_from.entry(source).or_default().push((id, at));
                }
            }
        }

        for (t, decl) in decls.iter().enumerate() {
            let meta = &cat.tables[t];
            let needs_pk = !meta.indexes.is_empty()
                || !meta.search.is_empty()
                || !meta.tries.is_empty()
                || !meta.relations.is_empty();
            if needs_pk && !decl.columns.iter().any(|c| c.has("pk")) {
                return Err(Error::config(format!(
                    "table {} has indexed columns but no primary key",
                    meta.name
                )));
            }
        }

        cat.add_shadow_tables();
        Ok(cat)
    }

    fn describe_table(id: TableId, decl: &TableDecl) -> Result<TableMeta> {
        let pks: Vec<&ColumnDecl> = decl.columns.iter().filter(|c| c.has("pk")).collect();
        if pks.len() > 1 {
            return Err(Error::config(format!("table {} declares more than one primary key", decl.name)));
        }
        let mut columns = decl.columns.clone();
        let (pk, pk_type, ai) = match pks.first() {
            Some(col) => {
                let ty = ColumnType::parse(&col.ty);
                (col.key.clone(), PkType::from_type(&ty.base), col.has("ai"))
            }
            None => {
                columns.insert(0, ColumnDecl::new(IMPLICIT_PK, "uuid").props(&["pk"]));
                (IMPLICIT_PK.to_string(), PkType::Uuid, false)
            }
        };

        let mut indexes = Vec::new();
        let mut geo_indexed = Vec::new();
        let mut search = Vec::new();
        let mut tries = Vec::new();
        for col in &decl.columns {
            if col.has("idx") && col.key != pk {
                if ColumnType::parse(&col.ty).base == "geo" {
                    indexes.push(format!("{}.lat", col.key));
                    indexes.push(format!("{}.lon", col.key));
                    geo_indexed.push(col.key.clone());
                } else {
                    indexes.push(col.key.clone());
                }
            }
            if col.has("search") {
                search.push(SearchColumn {
                    column: col.key.clone(),
                    tokenizer: col.tokenizer.clone().unwrap_or_default(),
                });
            }
            if col.has("trie") {
                tries.push(col.key.clone());
            }
        }

        Ok(TableMeta {
            id,
            name: decl.name.clone(),
            pk,
            pk_type,
            ai,
            columns,
            indexes,
            geo_indexed,
            search,
            tries,
            relations: Vec::new(),
            views: Vec::new(),
            hidden: false,
        })
    }

    /// Register `source.column → target`, plus the implied reverse edge when
    /// a reverse column is named.
    fn add_relation(
        &mut self,
        source: TableId,
        column: String,
        target: TableId,
        many: bool,
        reverse: Option<String>,
    ) -> Result<()> {
        if self.tables[source].relations.iter().any(|r| r.column == column) {
            return Ok(());
        }
        self.tables[source].relations.push(Relation {
            column: column.clone(),
            target,
            many,
            reverse: reverse.clone(),
        });
        let at = self.tables[source].relations.len() - 1;
        self.rel_to.entry(target).or_default().push((source, at));

        if let Some(rev) = reverse {
            let rev_many = self.tables[target]
                .column(&rev)
                .map(|c| ColumnType::parse(&c.ty).array)
                .ok_or_else(|| {
                    Error::config(format!(
                        "reverse column {}.{rev} is not declared",
                        self.tables[target].name
                    ))
                })?;
            self.add_relation(target, rev, source, rev_many, Some(column))?;
        }
        Ok(())
    }

    fn add_shadow_tables(&mut self) {
        let user_tables = self.tables.len();
        for t in 0..user_tables {
            let name = self.tables[t].name.clone();
            let mut shadows = Vec::new();
            for col in &self.tables[t].indexes {
                shadows.push(index_table(&name, col));
            }
            for s in &self.tables[t].search {
                shadows.push(token_table(&name, &s.column));
                shadows.push(exact_table(&name, &s.column));
                shadows.push(fuzzy_table(&name, &s.column));
            }
            for shadow in shadows {
                let id = self.tables.len();
                self.by_name.insert(shadow.clone(), id);
                self.tables.push(TableMeta {
                    id,
                    name: shadow,
                    pk: "id".to_string(),
                    pk_type: PkType::Any,
                    ai: false,
                    columns: vec![ColumnDecl::new("id", "any").props(&["pk"])],
                    indexes: Vec::new(),
                    geo_indexed: Vec::new(),
                    search: Vec::new(),
                    tries: Vec::new(),
                    relations: Vec::new(),
                    views: Vec::new(),
                    hidden: true,
                });
            }
        }
    }

    pub fn id(&self, name: &str) -> Option<TableId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: TableId) -> &TableMeta {
        &self.tables[id]
    }

    pub fn table(&self, name: &str) -> Result<&TableMeta> {
        self.id(name)
            .map(|id| &self.tables[id])
            .ok_or_else(|| Error::invalid(format!("unknown table {name}")))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter()
    }

    pub fn user_tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter().filter(|t| !t.hidden)
    }

    /// Relations on other tables that point at `target`.
    pub fn relations_to(&self, target: TableId) -> impl Iterator<Item = (&TableMeta, &Relation)> {
        self.rel_to
            .get(&target)
            .into_iter()
            .flatten()
            .map(move |(src, at)| (&self.tables[*src], &self.tables[*src].relations[*at]))
    }

    /// View bindings on other tables sourced from `source`.
    pub fn views_from(&self, source: TableId) -> impl Iterator<Item = (&TableMeta, &ViewBinding)> {
        self.views_from
            .get(&source)
            .into_iter()
            .flatten()
            .map(move |(dep, at)| (&self.tables[*dep], &self.tables[*dep].views[*at]))
    }

    /// Tables a write to `table` may touch, sorted by id so locks are taken in
    /// a global order.
    pub fn write_closure(&self, table: TableId) -> Vec<TableId> {
        let mut ids = vec![table];
        ids.extend(self.tables[table].relations.iter().map(|r| r.target));
        ids.extend(self.rel_to.get(&table).into_iter().flatten().map(|(src, _)| *src));
        ids.extend(self.views_from.get(&table).into_iter().flatten().map(|(dep, _)| *dep));
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog() -> Vec<TableDecl> {
        schema_from_json(&json!({
            "users": [
                {"key": "id", "type": "int", "props": ["pk", "ai"]},
                {"key": "name", "type": "string", "props": ["idx", "trie"]},
                {"key": "posts", "type": "int[]", "relation": {"table": "posts", "reverse": "author"}}
            ],
            "posts": [
                {"key": "id", "type": "int", "props": ["pk", "ai"]},
                {"key": "author", "type": "int"},
                {"key": "body", "type": "string", "props": ["search"]},
                {"key": "authorName", "type": "string",
                 "view": {"table": "users", "by": "author", "column": "name", "mode": "ghost"}},
                {"key": "loc", "type": "geo", "props": ["idx"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_build_blog_catalog() {
        let cat = Catalog::build(&blog()).unwrap();
        let users = cat.table("users").unwrap();
        assert_eq!(users.pk, "id");
        assert!(users.ai);
        assert_eq!(users.indexes, vec!["name"]);
        assert_eq!(users.tries, vec!["name"]);
        assert_eq!(users.relations.len(), 1);

        let posts = cat.table("posts").unwrap();
        assert_eq!(posts.indexes, vec!["loc.lat", "loc.lon"]);
        // reverse edge registered on posts.author
        assert_eq!(posts.relations[0].column, "author");
        assert!(!posts.relations[0].many);
        assert_eq!(cat.views_from(users.id).count(), 1);

        for shadow in ["_idx_users_name", "_idx_posts_loc.lat", "_fts_tokens_posts_body", "_fts_fuzzy_posts_body"] {
            assert!(cat.table(shadow).unwrap().hidden, "{shadow}");
        }
        assert_eq!(cat.user_tables().count(), 2);
        assert_eq!(cat.write_closure(users.id), vec![users.id, posts.id]);
    }

    #[test]
    fn test_unknown_relation_table() {
        let decls = schema_from_json(&json!({
            "a": [{"key": "id", "type": "int", "props": ["pk"]},
                  {"key": "b", "type": "int", "relation": {"table": "nope"}}]
        }))
        .unwrap();
        assert!(matches!(Catalog::build(&decls), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_indexed_table_needs_pk() {
        let decls = vec![TableDecl::new("t", vec![ColumnDecl::new("n", "int").props(&["idx"])])];
        assert!(matches!(Catalog::build(&decls), Err(Error::Configuration(_))));

        let plain = vec![TableDecl::new("t", vec![ColumnDecl::new("n", "int")])];
        let cat = Catalog::build(&plain).unwrap();
        assert_eq!(cat.table("t").unwrap().pk, IMPLICIT_PK);
    }

    #[test]
    fn test_two_pks_rejected() {
        let decls = vec![TableDecl::new(
            "t",
            vec![ColumnDecl::new("a", "int").props(&["pk"]), ColumnDecl::new("b", "int").props(&["pk"])],
        )];
        assert!(Catalog::build(&decls).is_err());
    }
}
