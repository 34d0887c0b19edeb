//! Query object
//!
//! A query arrives as a JSON-shaped object (`{table, action, where, ...}`) and
//! is compiled once into typed parts before any row is touched: WHERE trees,
//! projections with resolved functions, ordering, joins and ORM expansions.
//! Malformed tuples and unknown functions fail here.

use crate::error::{Error, Result};
use crate::functions::{split_call, FnCall, FunctionRegistry};
use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub table: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub action_args: Option<Value>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Value>,
    #[serde(default)]
    pub join: Option<Value>,
    #[serde(default)]
    pub order_by: Option<Value>,
    #[serde(default)]
    pub group_by: Option<Value>,
    #[serde(default)]
    pub having: Option<Value>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub range: Option<(i64, i64)>,
    #[serde(default)]
    pub orm: Option<Vec<Value>>,
    #[serde(default)]
    pub trie: Option<TrieQuery>,
}

fn default_action() -> String {
    "select".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrieQuery {
    pub column: String,
    pub search: String,
}

impl Query {
    fn with_action(table: &str, action: &str, args: Option<Value>) -> Self {
        Self { table: table.to_string(), action: action.to_string(), action_args: args, ..Default::default() }
    }

    pub fn select(table: &str) -> Self {
        Self::with_action(table, "select", None)
    }

    /// Rows as an object or array of objects.
    pub fn upsert(table: &str, rows: Value) -> Self {
        Self::with_action(table, "upsert", Some(rows))
    }

    pub fn delete(table: &str) -> Self {
        Self::with_action(table, "delete", None)
    }

    pub fn drop(table: &str) -> Self {
        Self::with_action(table, "drop", None)
    }

    pub fn show_tables() -> Self {
        Self::with_action("", "show tables", None)
    }

    pub fn describe(table: &str) -> Self {
        Self::with_action(table, "describe", None)
    }

    pub fn columns(mut self, columns: Value) -> Self {
        self.action_args = Some(columns);
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.action_args = Some(args);
        self
    }

    pub fn filter(mut self, where_clause: Value) -> Self {
        self.where_clause = Some(where_clause);
        self
    }

    pub fn join(mut self, join: Value) -> Self {
        self.join = Some(join);
        self
    }

    pub fn order_by(mut self, order: Value) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn group_by(mut self, group: Value) -> Self {
        self.group_by = Some(group);
        self
    }

    pub fn having(mut self, having: Value) -> Self {
        self.having = Some(having);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Positional read: `limit` rows from `offset`; a negative limit reads the last rows.
    pub fn range(mut self, limit: i64, offset: i64) -> Self {
        self.range = Some((limit, offset));
        self
    }

    pub fn orm(mut self, orm: Value) -> Self {
        self.orm = orm.as_array().cloned();
        self
    }

    pub fn trie(mut self, column: &str, search: &str) -> Self {
        self.trie = Some(TrieQuery { column: column.to_string(), search: search.to_string() });
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Select,
    Upsert,
    Delete,
    Drop,
    ShowTables,
    Describe,
    RebuildIndexes,
}

impl Action {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "select" => Ok(Action::Select),
            "upsert" => Ok(Action::Upsert),
            "delete" => Ok(Action::Delete),
            "drop" => Ok(Action::Drop),
            "show tables" => Ok(Action::ShowTables),
            "describe" => Ok(Action::Describe),
            "rebuild indexes" => Ok(Action::RebuildIndexes),
            other => Err(Error::invalid(format!("unknown action '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::Select => "select",
            Action::Upsert => "upsert",
            Action::Delete => "delete",
            Action::Drop => "drop",
            Action::ShowTables => "show tables",
            Action::Describe => "describe",
            Action::RebuildIndexes => "rebuild indexes",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Between,
    NotBetween,
    Like,
    NotLike,
    Regexp,
    Includes,
    NotIncludes,
    Intersect,
    IntersectAll,
    NotIntersect,
    Null,
    NotNull,
}

impl Op {
    pub fn parse(raw: &str) -> Result<Self> {
        let norm = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        Ok(match norm.as_str() {
            "=" | "==" => Op::Eq,
            "!=" | "<>" => Op::Ne,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "<" => Op::Lt,
            "<=" => Op::Le,
            "IN" => Op::In,
            "NOT IN" => Op::NotIn,
            "BETWEEN" => Op::Between,
            "NOT BETWEEN" => Op::NotBetween,
            "LIKE" => Op::Like,
            "NOT LIKE" => Op::NotLike,
            "REGEXP" | "REGEX" => Op::Regexp,
            "INCLUDES" => Op::Includes,
            "NOT INCLUDES" => Op::NotIncludes,
            "INTERSECT" => Op::Intersect,
            "INTERSECT ALL" => Op::IntersectAll,
            "NOT INTERSECT" => Op::NotIntersect,
            "NULL" | "IS NULL" => Op::Null,
            "NOT NULL" | "IS NOT NULL" => Op::NotNull,
            _ => return Err(Error::invalid(format!("unknown operator '{raw}'"))),
        })
    }

    /// Operators whose right side must be an array.
    fn wants_array(self) -> bool {
        matches!(
            self,
            Op::In | Op::NotIn | Op::Between | Op::NotBetween | Op::Intersect | Op::IntersectAll | Op::NotIntersect
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::Gt | Op::Ge | Op::Lt | Op::Le | Op::Ne)
    }
}

/// Left side of a condition.
#[derive(Clone, Debug)]
pub enum Operand {
    Column(String),
    /// `search(col, ...)` over full-text columns
    Search(Vec<String>),
    /// `crow(col, lat, lon)` distance in km
    Crow { column: String, lat: f64, lon: f64 },
    Call(FnCall),
}

#[derive(Clone, Debug)]
pub struct Cond {
    /// Position in the tree, keys precomputed search results.
    pub id: usize,
    pub left: Operand,
    pub op: Op,
    pub right: Value,
    /// Join conditions may compare two columns.
    pub right_column: Option<String>,
}

impl Cond {
    pub fn column(&self) -> Option<&str> {
        match &self.left {
            Operand::Column(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Junction {
    And,
    Or,
}

/// WHERE tree. A group is a left-to-right chain; the first junction is unused.
#[derive(Clone, Debug)]
pub enum Where {
    Cond(Cond),
    Group(Vec<(Junction, Where)>),
}

impl Where {
    pub fn conds(&self) -> Vec<&Cond> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Cond>) {
        match self {
            Where::Cond(c) => out.push(c),
            Where::Group(items) => items.iter().for_each(|(_, w)| w.collect(out)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    Where,
    /// `table.column` strings on the right are column references
    Join,
    /// left sides name output columns verbatim (`COUNT(*)`, aliases)
    Having,
}

pub struct WhereCompiler<'a> {
    functions: &'a FunctionRegistry,
    max_depth: usize,
    mode: CompileMode,
    next_id: usize,
}

impl<'a> WhereCompiler<'a> {
    pub fn new(functions: &'a FunctionRegistry, max_depth: usize, mode: CompileMode) -> Self {
        Self { functions, max_depth, mode, next_id: 0 }
    }

    pub fn compile(&mut self, value: &Value) -> Result<Where> {
        self.compile_at(value, 0)
    }

    fn compile_at(&mut self, value: &Value, depth: usize) -> Result<Where> {
        if depth > self.max_depth {
            return Err(Error::invalid(format!("where clause nested deeper than {}", self.max_depth)));
        }
        let items = value
            .as_array()
            .ok_or_else(|| Error::invalid(format!("where clause must be an array, got {value}")))?;
        match items.first() {
            Some(Value::Array(_)) => {
                let mut out = Vec::with_capacity(items.len() / 2 + 1);
                let mut junction = Junction::And;
                let mut expect_clause = true;
                for item in items {
                    if expect_clause {
                        out.push((junction, self.compile_at(item, depth + 1)?));
                    } else {
                        junction = match item.as_str().map(|s| s.trim().to_uppercase()).as_deref() {
                            Some("AND") => Junction::And,
                            Some("OR") => Junction::Or,
                            _ => return Err(Error::invalid(format!("expected AND/OR, got {item}"))),
                        };
                    }
                    expect_clause = !expect_clause;
                }
                if expect_clause {
                    return Err(Error::invalid("where clause ends with a dangling AND/OR"));
                }
                Ok(Where::Group(out))
            }
            Some(Value::String(_)) => Ok(Where::Cond(self.compile_cond(items)?)),
            _ => Err(Error::invalid(format!("malformed where clause {value}"))),
        }
    }

    fn compile_cond(&mut self, items: &[Value]) -> Result<Cond> {
        let left = items[0].as_str().unwrap_or_default().trim();
        let op_raw = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid(format!("condition on '{left}' has no operator")))?;
        let op = Op::parse(op_raw)?;
        let right = items.get(2).cloned().unwrap_or(Value::Null);
        if items.len() < 3 && !matches!(op, Op::Null | Op::NotNull) {
            return Err(Error::invalid(format!("condition on '{left}' has no value")));
        }
        if op.wants_array() {
            let arr = right
                .as_array()
                .ok_or_else(|| Error::invalid(format!("{op_raw} on '{left}' needs an array, got {right}")))?;
            if matches!(op, Op::Between | Op::NotBetween) && arr.len() != 2 {
                return Err(Error::invalid(format!("{op_raw} on '{left}' needs [low, high]")));
            }
        }

        let operand = self.operand(left, op, &right)?;
        let right_column = match (&self.mode, &right) {
            (CompileMode::Join, Value::String(s)) if s.contains('.') => Some(s.clone()),
            _ => None,
        };
        let id = self.next_id;
        self.next_id += 1;
        Ok(Cond { id, left: operand, op, right, right_column })
    }

    fn operand(&self, left: &str, op: Op, right: &Value) -> Result<Operand> {
        if self.mode == CompileMode::Having {
            return Ok(Operand::Column(left.to_string()));
        }
        let Some((name, args)) = split_call(left) else {
            return Ok(Operand::Column(left.to_string()));
        };
        match name.to_lowercase().as_str() {
            "search" => {
                if args.is_empty() {
                    return Err(Error::invalid("search() needs at least one column"));
                }
                match op {
                    Op::Eq if right.is_string() => {}
                    Op::Gt | Op::Ge if fuzzy_args(right).is_some() => {}
                    _ => {
                        return Err(Error::invalid(
                            "search() takes '=' with text, or '>'/'>=' with [minScore, text]",
                        ))
                    }
                }
                Ok(Operand::Search(args.iter().map(|a| a.to_string()).collect()))
            }
            "crow" => {
                let parsed = match args.as_slice() {
                    [column, lat, lon] => lat.parse::<f64>().ok().zip(lon.parse::<f64>().ok()).map(|(lat, lon)| Operand::Crow {
                        column: column.to_string(),
                        lat,
                        lon,
                    }),
                    _ => None,
                };
                let operand = parsed.ok_or_else(|| Error::invalid(format!("crow() expects (column, lat, lon), got {left}")))?;
                if !op.is_comparison() || right.as_f64().is_none() {
                    return Err(Error::invalid("crow() compares against a distance in km"));
                }
                Ok(operand)
            }
            _ => match self.functions.compile(left)? {
                Some(call) => Ok(Operand::Call(call)),
                None => Ok(Operand::Column(left.to_string())),
            },
        }
    }
}

/// `[minScore, "text"]` of a fuzzy search condition.
pub fn fuzzy_args(right: &Value) -> Option<(f64, &str)> {
    let arr = right.as_array()?;
    match arr.as_slice() {
        [score, text] => Some((score.as_f64()?, text.as_str()?)),
        _ => None,
    }
}

/// `ORDER BY` / `GROUP BY` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub desc: bool,
}

/// Accepts `["col DESC", "other"]`, `{col: "desc"}` or a single string.
pub fn parse_sort(value: &Value) -> Result<Vec<SortKey>> {
    let from_text = |s: &str| {
        let mut parts = s.split_whitespace();
        let column = parts.next().unwrap_or_default().to_string();
        let desc = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
        SortKey { column, desc }
    };
    match value {
        Value::String(s) => Ok(vec![from_text(s)]),
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_str().map(from_text).ok_or_else(|| Error::invalid(format!("bad sort key {i}"))))
            .collect(),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(column, dir)| SortKey {
                column: column.clone(),
                desc: dir.as_str().is_some_and(|d| d.eq_ignore_ascii_case("desc")),
            })
            .collect()),
        other => Err(Error::invalid(format!("bad sort key {other}"))),
    }
}

#[derive(Clone, Debug)]
pub enum ProjExpr {
    Column(String),
    Call(FnCall),
}

#[derive(Clone, Debug)]
pub struct Projection {
    pub expr: ProjExpr,
    pub alias: String,
}

impl Projection {
    pub fn is_aggregate(&self) -> bool {
        matches!(&self.expr, ProjExpr::Call(c) if c.is_aggregate())
    }
}

/// `["name", "COUNT(*) AS total", "UPPER(name) AS n"]`
pub fn parse_projections(value: &Value, functions: &FunctionRegistry) -> Result<Vec<Projection>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::invalid(format!("select columns must be an array, got {value}")))?;
    items
        .iter()
        .map(|item| {
            let text = item.as_str().ok_or_else(|| Error::invalid(format!("bad select column {item}")))?;
            let (expr, alias) = split_alias(text);
            let projected = match functions.compile(expr)? {
                Some(call) => ProjExpr::Call(call),
                None => ProjExpr::Column(expr.to_string()),
            };
            Ok(Projection { expr: projected, alias: alias.unwrap_or(expr).to_string() })
        })
        .collect()
}

fn split_alias(text: &str) -> (&str, Option<&str>) {
    let lower = text.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(at) => (text[..at].trim(), Some(text[at + 4..].trim())),
        None => (text.trim(), None),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
    Right,
    Outer,
    Cross,
}

#[derive(Clone, Debug)]
pub struct JoinPlan {
    pub kind: JoinKind,
    pub table: String,
    pub on: Option<Where>,
}

#[derive(Deserialize)]
struct RawJoin {
    #[serde(rename = "type", default = "default_join")]
    kind: String,
    table: String,
    #[serde(default, rename = "where")]
    on: Option<Value>,
}

fn default_join() -> String {
    "left".to_string()
}

pub fn parse_joins(value: &Value, functions: &FunctionRegistry, max_depth: usize) -> Result<Vec<JoinPlan>> {
    let raw: Vec<RawJoin> = match value {
        Value::Array(_) => serde_json::from_value(value.clone())?,
        _ => vec![serde_json::from_value(value.clone())?],
    };
    raw.into_iter()
        .map(|j| {
            let kind = match j.kind.to_lowercase().as_str() {
                "left" => JoinKind::Left,
                "inner" => JoinKind::Inner,
                "right" => JoinKind::Right,
                "outer" | "full" => JoinKind::Outer,
                "cross" => JoinKind::Cross,
                other => return Err(Error::invalid(format!("unknown join type '{other}'"))),
            };
            let on = match (&j.on, kind) {
                (Some(w), _) => Some(WhereCompiler::new(functions, max_depth, CompileMode::Join).compile(w)?),
                (None, JoinKind::Cross) => None,
                (None, _) => return Err(Error::invalid(format!("{} join on {} needs a where", j.kind, j.table))),
            };
            Ok(JoinPlan { kind, table: j.table, on })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct OrmPlan {
    pub key: String,
    pub select: Option<Vec<Projection>>,
    pub filter: Option<Where>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrm {
    key: String,
    #[serde(default)]
    select: Option<Value>,
    #[serde(default, rename = "where")]
    filter: Option<Value>,
    #[serde(default)]
    order_by: Option<Value>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

pub fn parse_orm(items: &[Value], functions: &FunctionRegistry, max_depth: usize) -> Result<Vec<OrmPlan>> {
    items
        .iter()
        .map(|item| {
            let raw: RawOrm = match item {
                Value::String(key) => RawOrm {
                    key: key.clone(),
                    select: None,
                    filter: None,
                    order_by: None,
                    limit: None,
                    offset: None,
                },
                _ => serde_json::from_value(item.clone())?,
            };
            Ok(OrmPlan {
                key: raw.key,
                select: raw.select.map(|s| parse_projections(&s, functions)).transpose()?,
                filter: raw
                    .filter
                    .map(|w| WhereCompiler::new(functions, max_depth, CompileMode::Where).compile(&w))
                    .transpose()?,
                order_by: raw.order_by.map(|o| parse_sort(&o)).transpose()?.unwrap_or_default(),
                limit: raw.limit,
                offset: raw.offset.unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(v: Value) -> Result<Where> {
        let reg = FunctionRegistry::new();
        WhereCompiler::new(&reg, 8, CompileMode::Where).compile(&v)
    }

    #[test]
    fn test_query_from_json() {
        let q: Query = serde_json::from_value(json!({
            "table": "users",
            "action": "select",
            "where": ["age", ">", 3],
            "orderBy": ["name DESC"],
            "range": [-5, 0],
            "trie": {"column": "name", "search": "bi"}
        }))
        .unwrap();
        assert_eq!(q.range, Some((-5, 0)));
        assert_eq!(q.trie.unwrap().search, "bi");
        assert_eq!(parse_sort(q.order_by.as_ref().unwrap()).unwrap(), vec![SortKey { column: "name".into(), desc: true }]);
    }

    #[test]
    fn test_compile_tree_and_ids() {
        let w = compile(json!([["a", "=", 1], "AND", [["b", "<", 2], "OR", ["c", "IS NULL"]]])).unwrap();
        let ids: Vec<usize> = w.conds().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        match w {
            Where::Group(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].0, Junction::And);
            }
            _ => panic!("expected group"),
        }
    }

    #[test]
    fn test_set_ops_need_arrays() {
        assert!(matches!(compile(json!(["a", "IN", 3])), Err(Error::Validation(_))));
        assert!(matches!(compile(json!(["a", "BETWEEN", [1]])), Err(Error::Validation(_))));
        assert!(matches!(compile(json!(["a", "INTERSECT ALL", "x"])), Err(Error::Validation(_))));
        assert!(compile(json!(["a", "NOT IN", [1, 2]])).is_ok());
    }

    #[test]
    fn test_helpers_and_unknown_functions() {
        let w = compile(json!(["crow(loc, -6.2, 106.8)", "<", 10])).unwrap();
        assert!(matches!(&w, Where::Cond(Cond { left: Operand::Crow { .. }, .. })));
        let s = compile(json!(["search(title, body)", ">=", [0.5, "rust"]])).unwrap();
        assert!(matches!(&s, Where::Cond(Cond { left: Operand::Search(cols), .. }) if cols.len() == 2));
        assert!(matches!(compile(json!(["WAT(x)", "=", 1])), Err(Error::Configuration(_))));
        assert!(compile(json!([["a", "=", 1], "AND"])).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut v = json!(["a", "=", 1]);
        for _ in 0..10 {
            v = json!([v, "AND", ["b", "=", 2]]);
        }
        assert!(compile(v).is_err());
    }

    #[test]
    fn test_projections_and_joins() {
        let reg = FunctionRegistry::new();
        let p = parse_projections(&json!(["name", "COUNT(*) AS total"]), &reg).unwrap();
        assert_eq!(p[1].alias, "total");
        assert!(p[1].is_aggregate());
        assert!(parse_projections(&json!(["BOGUS(x)"]), &reg).is_err());

        let joins = parse_joins(&json!({"type": "inner", "table": "posts", "where": ["users.id", "=", "posts.author"]}), &reg, 8).unwrap();
        assert_eq!(joins[0].kind, JoinKind::Inner);
        let conds = joins[0].on.as_ref().unwrap().conds().into_iter().cloned().collect::<Vec<_>>();
        assert_eq!(conds[0].right_column.as_deref(), Some("posts.author"));
    }
}
