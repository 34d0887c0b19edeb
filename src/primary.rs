//! Primary Key Index
//!
//! Sorted key sequence with binary-search insert/remove, an O(1) existence set
//! keyed by the string form of each key, and the auto-increment counter.
//! Random-key tables (uuid) skip sorting: appends are O(1) but range scans
//! degrade to a filter.

use crate::types::{pk_key, total_cmp, PkType};
use ahash::AHashSet;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Change notification emitted by `add` / `remove`.
#[derive(Clone, Debug, PartialEq)]
pub enum PkChange {
    Added(Value),
    Removed(Value),
}

pub type PkListener = Arc<dyn Fn(&PkChange) + Send + Sync>;

pub struct PrimaryIndex {
    keys: Vec<Value>,
    exists: AHashSet<String>,
    sorted: bool,
    pk_type: PkType,
    ai: bool,
    next_ai: i64,
    listeners: Vec<PkListener>,
}

impl PrimaryIndex {
    pub fn new(pk_type: PkType, ai: bool) -> Self {
        Self {
            keys: Vec::new(),
            exists: AHashSet::new(),
            sorted: pk_type.sortable(),
            pk_type,
            ai,
            next_ai: 1,
            listeners: Vec::new(),
        }
    }

    /// Fresh empty index with the same type, sort mode and AI counter.
    pub fn clone_empty(&self) -> Self {
        Self {
            keys: Vec::new(),
            exists: AHashSet::new(),
            sorted: self.sorted,
            pk_type: self.pk_type,
            ai: self.ai,
            next_ai: self.next_ai,
            listeners: self.listeners.clone(),
        }
    }

    pub fn on_change(&mut self, listener: PkListener) {
        self.listeners.push(listener);
    }

    /// Numeric keys feed the counter even without `ai`, so generated keys
    /// never collide with explicit ones.
    fn counts(&self) -> bool {
        self.ai || self.pk_type.is_numeric()
    }

    /// Bulk replace. Moves the AI counter past the largest integer key; it
    /// never moves back.
    pub fn set(&mut self, mut keys: Vec<Value>) {
        if self.sorted {
            keys.sort_by(total_cmp);
            keys.dedup_by(|a, b| total_cmp(a, b) == Ordering::Equal);
        }
        self.exists = keys.iter().map(pk_key).collect();
        if self.counts() {
            let max = keys.iter().filter_map(Value::as_i64).max().unwrap_or(0);
            self.next_ai = self.next_ai.max(max + 1);
        }
        self.keys = keys;
    }

    /// Insert a key; no-op when already present. Returns whether it was added.
    pub fn add(&mut self, key: Value, notify: bool) -> bool {
        if !self.exists.insert(pk_key(&key)) {
            return false;
        }
        if let Some(n) = key.as_i64() {
            if self.counts() && n >= self.next_ai {
                self.next_ai = n + 1;
            }
        }
        if self.sorted {
            let pos = self.get_location(&key);
            self.keys.insert(pos, key.clone());
        } else {
            self.keys.push(key.clone());
        }
        if notify {
            self.emit(&PkChange::Added(key));
        }
        true
    }

    pub fn remove(&mut self, key: &Value, notify: bool) -> bool {
        if !self.exists.remove(&pk_key(key)) {
            return false;
        }
        let pos = self.index_of(key);
        if pos >= 0 {
            self.keys.remove(pos as usize);
        }
        if notify {
            self.emit(&PkChange::Removed(key.clone()));
        }
        true
    }

    fn emit(&self, change: &PkChange) {
        for listener in &self.listeners {
            listener(change);
        }
    }

    pub fn exists(&self, key: &Value) -> bool {
        self.exists.contains(&pk_key(key))
    }

    /// Position of a key, -1 when absent.
    pub fn index_of(&self, key: &Value) -> isize {
        if !self.exists(key) {
            return -1;
        }
        if self.sorted {
            match self.keys.binary_search_by(|k| total_cmp(k, key)) {
                Ok(pos) => pos as isize,
                Err(_) => -1,
            }
        } else {
            let wanted = pk_key(key);
            self.keys.iter().position(|k| pk_key(k) == wanted).map(|p| p as isize).unwrap_or(-1)
        }
    }

    /// Insertion position for any key; unsorted indexes always answer the tail.
    pub fn get_location(&self, key: &Value) -> usize {
        if !self.sorted {
            return self.keys.len();
        }
        self.keys.partition_point(|k| total_cmp(k, key) == Ordering::Less)
    }

    /// Keys within bounds, in index order.
    pub fn range(&self, lo: Option<(&Value, bool)>, hi: Option<(&Value, bool)>) -> Vec<Value> {
        let above = |k: &Value| match lo {
            Some((v, inclusive)) => match total_cmp(k, v) {
                Ordering::Greater => true,
                Ordering::Equal => inclusive,
                Ordering::Less => false,
            },
            None => true,
        };
        let below = |k: &Value| match hi {
            Some((v, inclusive)) => match total_cmp(k, v) {
                Ordering::Less => true,
                Ordering::Equal => inclusive,
                Ordering::Greater => false,
            },
            None => true,
        };
        if !self.sorted {
            return self.keys.iter().filter(|k| above(k) && below(k)).cloned().collect();
        }
        let start = match lo {
            Some((v, _)) => self.get_location(v),
            None => 0,
        };
        self.keys[start..]
            .iter()
            .skip_while(|k| !above(k))
            .take_while(|k| below(k))
            .cloned()
            .collect()
    }

    /// Positional window `[from, to)`, clamped.
    pub fn slice(&self, from: usize, to: usize) -> &[Value] {
        let to = to.min(self.keys.len());
        let from = from.min(to);
        &self.keys[from..to]
    }

    /// Hand out the next auto-increment value.
    pub fn next_id(&mut self) -> i64 {
        let id = self.next_ai;
        self.next_ai += 1;
        id
    }

    pub fn reset_ai(&mut self) {
        self.next_ai = 1;
    }

    pub fn keys(&self) -> &[Value] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn pk_type(&self) -> PkType {
        self.pk_type
    }
}
