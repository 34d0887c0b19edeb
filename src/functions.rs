//! Function registry
//!
//! Scalar functions map one row's argument values to a value; aggregates fold
//! one argument value per row of a group. Names are case-insensitive and
//! resolved when the query is compiled.

use crate::error::{Error, Result};
use crate::geo::crow_km;
use crate::types::{compare_values, is_nullish, resolve, Row};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

pub type ScalarFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
pub type AggregateFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum Function {
    Scalar(ScalarFn),
    Aggregate(AggregateFn),
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Function::Scalar(_) => f.write_str("Scalar"),
            Function::Aggregate(_) => f.write_str("Aggregate"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FnArg {
    Column(String),
    Literal(Value),
    Star,
}

impl FnArg {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            return FnArg::Star;
        }
        let quoted = |q: char| raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q);
        if quoted('\'') || quoted('"') {
            return FnArg::Literal(Value::String(raw[1..raw.len() - 1].to_string()));
        }
        match raw {
            "true" => return FnArg::Literal(Value::Bool(true)),
            "false" => return FnArg::Literal(Value::Bool(false)),
            "null" | "NULL" => return FnArg::Literal(Value::Null),
            _ => {}
        }
        if let Ok(n) = raw.parse::<i64>() {
            return FnArg::Literal(Value::from(n));
        }
        if let Ok(f) = raw.parse::<f64>() {
            return FnArg::Literal(Value::from(f));
        }
        FnArg::Column(raw.to_string())
    }

    pub fn value(&self, row: &Row) -> Value {
        match self {
            FnArg::Column(c) => resolve(row, c).map(|v| v.into_owned()).unwrap_or(Value::Null),
            FnArg::Literal(v) => v.clone(),
            FnArg::Star => Value::Bool(true),
        }
    }
}

/// A resolved `NAME(args)` expression.
#[derive(Clone, Debug)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<FnArg>,
    pub func: Function,
}

impl FnCall {
    pub fn is_aggregate(&self) -> bool {
        matches!(self.func, Function::Aggregate(_))
    }

    pub fn eval_row(&self, row: &Row) -> Value {
        let args: Vec<Value> = self.args.iter().map(|a| a.value(row)).collect();
        match &self.func {
            Function::Scalar(f) => f(&args),
            Function::Aggregate(f) => f(&args[..args.len().min(1)]),
        }
    }

    pub fn eval_group(&self, rows: &[Row]) -> Value {
        match &self.func {
            Function::Aggregate(f) => {
                let arg = self.args.first().cloned().unwrap_or(FnArg::Star);
                let values: Vec<Value> = rows.iter().map(|r| arg.value(r)).collect();
                f(&values)
            }
            Function::Scalar(_) => rows.first().map(|r| self.eval_row(r)).unwrap_or(Value::Null),
        }
    }
}

/// Split `NAME(a, b)` into name and raw args. `None` when the text is not a call.
pub fn split_call(text: &str) -> Option<(&str, Vec<&str>)> {
    let text = text.trim();
    let open = text.find('(')?;
    if !text.ends_with(')') {
        return None;
    }
    let name = text[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let inner = text[open + 1..text.len() - 1].trim();
    let args = if inner.is_empty() { Vec::new() } else { inner.split(',').map(str::trim).collect() };
    Some((name, args))
}

pub struct FunctionRegistry {
    functions: RwLock<AHashMap<String, Function>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn numbers(values: &[Value]) -> impl Iterator<Item = f64> + '_ {
    values.iter().filter_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

fn extreme(values: &[Value], want: Ordering) -> Value {
    values
        .iter()
        .filter(|v| !is_nullish(Some(*v)))
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if compare_values(v, b) != Some(want) => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        let reg = Self { functions: RwLock::new(AHashMap::new()) };

        reg.register_scalar("UPPER", |a| Value::String(text(&a[0]).to_uppercase()));
        reg.register_scalar("LOWER", |a| Value::String(text(&a[0]).to_lowercase()));
        reg.register_scalar("LENGTH", |a| match &a[0] {
            Value::Array(items) => Value::from(items.len()),
            Value::Null => Value::Null,
            other => Value::from(text(other).chars().count()),
        });
        reg.register_scalar("ABS", |a| numbers(&a[..1]).next().map(|n| number_value(n.abs())).unwrap_or(Value::Null));
        reg.register_scalar("ROUND", |a| {
            let digits = a.get(1).and_then(Value::as_i64).unwrap_or(0) as i32;
            match numbers(&a[..1]).next() {
                Some(n) => {
                    let scale = 10f64.powi(digits);
                    number_value((n * scale).round() / scale)
                }
                None => Value::Null,
            }
        });
        reg.register_scalar("CONCAT", |a| Value::String(a.iter().map(text).collect()));
        reg.register_scalar("COALESCE", |a| {
            a.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null)
        });
        reg.register_scalar("CROW", |a| {
            let point = &a[0];
            let (lat, lon) = match (point.get("lat").and_then(Value::as_f64), point.get("lon").and_then(Value::as_f64)) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => return Value::Null,
            };
            match (a.get(1).and_then(Value::as_f64), a.get(2).and_then(Value::as_f64)) {
                (Some(lat2), Some(lon2)) => Value::from(crow_km(lat, lon, lat2, lon2)),
                _ => Value::Null,
            }
        });

        reg.register_aggregate("COUNT", |vals| {
            Value::from(vals.iter().filter(|v| !v.is_null()).count())
        });
        reg.register_aggregate("SUM", |vals| number_value(numbers(vals).sum()));
        reg.register_aggregate("AVG", |vals| {
            let nums: Vec<f64> = numbers(vals).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::from(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        });
        reg.register_aggregate("MIN", |vals| extreme(vals, Ordering::Less));
        reg.register_aggregate("MAX", |vals| extreme(vals, Ordering::Greater));
        reg
    }

    /// Scalars always receive at least one argument (missing ones are null).
    pub fn register_scalar<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let padded: ScalarFn = Arc::new(move |args: &[Value]| {
            if args.is_empty() {
                f(&[Value::Null])
            } else {
                f(args)
            }
        });
        self.functions.write().insert(name.to_uppercase(), Function::Scalar(padded));
    }

    pub fn register_aggregate<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.functions.write().insert(name.to_uppercase(), Function::Aggregate(Arc::new(f)));
    }

    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions.read().get(&name.to_uppercase()).cloned()
    }

    /// Resolve `NAME(args)` text. `Ok(None)` when the text is not a call at all.
    pub fn compile(&self, text: &str) -> Result<Option<FnCall>> {
        let Some((name, raw_args)) = split_call(text) else {
            return Ok(None);
        };
        let func = self
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown function {name}")))?;
        Ok(Some(FnCall {
            name: name.to_uppercase(),
            args: raw_args.into_iter().map(FnArg::parse).collect(),
            func,
        }))
    }
}
