use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// A row is a column → value map. Rows handed out by read paths are never
/// edited in place; write paths clone before mutating.
pub type Row = Map<String, Value>;

/// Primary key flavours. Decides how missing keys are generated and whether
/// the primary index keeps itself sorted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PkType {
    Int,
    Float,
    String,
    Uuid,
    TimeId,
    TimeIdMs,
    Any,
}

impl PkType {
    pub fn from_type(base: &str) -> Self {
        match base {
            "int" => PkType::Int,
            "float" | "number" => PkType::Float,
            "string" => PkType::String,
            "uuid" => PkType::Uuid,
            "timeId" => PkType::TimeId,
            "timeIdms" => PkType::TimeIdMs,
            _ => PkType::Any,
        }
    }

    /// Random keys have no useful order, so their index skips sorting.
    pub fn sortable(self) -> bool {
        !matches!(self, PkType::Uuid)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, PkType::Int | PkType::Float)
    }
}

/// Parsed column type: `int[]` → base `int`, array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnType {
    pub base: String,
    pub array: bool,
}

impl ColumnType {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_suffix("[]") {
            Some(base) => Self { base: base.to_string(), array: true },
            None => Self { base: trimmed.to_string(), array: false },
        }
    }
}

/// Post-mutation notification.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub action: String,
    #[serde(rename = "affectedRowPKS")]
    pub affected_row_pks: Vec<Value>,
    pub affected_rows: Vec<Row>,
    pub time: u64,
}

/// Result row of a mutation query.
#[derive(Clone, Debug, Serialize)]
pub struct MutationSummary {
    pub msg: String,
    #[serde(rename = "affectedRowPKS")]
    pub affected_row_pks: Vec<Value>,
    #[serde(rename = "affectedRows")]
    pub affected_rows: Vec<Row>,
}

impl MutationSummary {
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("msg".into(), Value::String(self.msg));
        row.insert("affectedRowPKS".into(), Value::Array(self.affected_row_pks));
        row.insert(
            "affectedRows".into(),
            Value::Array(self.affected_rows.into_iter().map(Value::Object).collect()),
        );
        row
    }
}

/// How a query found its rows, cheapest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPath {
    /// No rows read (mutations on an empty match, describe, show tables)
    None,
    Trie,
    /// Positional window over the primary index
    Range,
    /// Whole WHERE answered from primary, secondary, search or geo indexes
    Index,
    /// First clause from an index, rest filtered
    Partial,
    Scan,
}

/// Execution report for a single query.
#[derive(Clone, Debug, Serialize)]
pub struct Trace {
    pub access: AccessPath,
    /// Rows read from the adapter before filtering
    pub fetched: usize,
    pub returned: usize,
    pub time_us: u64,
}

/// Every query returns rows plus a trace.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub rows: Vec<Row>,
    pub trace: Trace,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// String form of a key, used for existence sets and PK dedup.
/// `0` and `"0"` coerce to the same key.
pub fn pk_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Empty string counts as null.
pub fn is_nullish(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Resolve a column path against a row. A literal key wins (joined rows carry
/// `table.column` keys); otherwise dots walk nested objects, and a trailing
/// `length` on an array or string yields its length.
pub fn resolve<'a>(row: &'a Row, path: &str) -> Option<Cow<'a, Value>> {
    if let Some(v) = row.get(path) {
        return Some(Cow::Borrowed(v));
    }
    if !path.contains('.') {
        return None;
    }
    let mut parts = path.split('.');
    let mut current = row.get(parts.next()?)?;
    for part in parts {
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(items) if part == "length" => {
                return Some(Cow::Owned(Value::from(items.len())));
            }
            Value::String(s) if part == "length" => {
                return Some(Cow::Owned(Value::from(s.chars().count())));
            }
            Value::Array(items) => current = items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(Cow::Borrowed(current))
}

/// Loose comparison used by predicates. Numbers compare numerically, a numeric
/// string compares against a number, otherwise only same-kind values compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Number(x), Value::String(s)) => x.as_f64()?.partial_cmp(&s.trim().parse::<f64>().ok()?),
        (Value::String(s), Value::Number(y)) => s.trim().parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            if a == b { Some(Ordering::Equal) } else { None }
        }
        _ => None,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal)
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: kind first, then value.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// JSON value with a total order, usable as a sorted-map key.
#[derive(Clone, Debug)]
pub struct OrdValue(pub Value);

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        total_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for OrdValue {}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        total_cmp(&self.0, &other.0)
    }
}
