//! Prefix trie for `trie` columns. Case-insensitive; each node keeps the
//! primary keys of rows whose value ends there.

use crate::types::pk_key;
use ahash::AHashMap;
use serde_json::Value;

#[derive(Default)]
struct Node {
    children: AHashMap<char, Node>,
    pks: Vec<Value>,
}

#[derive(Default)]
pub struct PrefixTrie {
    root: Node,
    len: usize,
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, word: &str, pk: Value) {
        let mut node = &mut self.root;
        for ch in word.to_lowercase().chars() {
            node = node.children.entry(ch).or_default();
        }
        let key = pk_key(&pk);
        if !node.pks.iter().any(|p| pk_key(p) == key) {
            node.pks.push(pk);
            self.len += 1;
        }
    }

    pub fn remove(&mut self, word: &str, pk: &Value) {
        let mut node = &mut self.root;
        for ch in word.to_lowercase().chars() {
            match node.children.get_mut(&ch) {
                Some(next) => node = next,
                None => return,
            }
        }
        let key = pk_key(pk);
        let before = node.pks.len();
        node.pks.retain(|p| pk_key(p) != key);
        self.len -= before - node.pks.len();
    }

    /// Primary keys of every value starting with `prefix`.
    pub fn search(&self, prefix: &str) -> Vec<Value> {
        let mut node = &self.root;
        for ch in prefix.to_lowercase().chars() {
            match node.children.get(&ch) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            out.extend(n.pks.iter().cloned());
            stack.extend(n.children.values());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefix_search() {
        let mut t = PrefixTrie::new();
        t.insert("Billy", json!(1));
        t.insert("bill", json!(2));
        t.insert("bob", json!(3));
        let mut hits: Vec<i64> = t.search("BIL").iter().filter_map(Value::as_i64).collect();
        hits.sort();
        assert_eq!(hits, vec![1, 2]);
        assert!(t.search("x").is_empty());
        t.remove("bill", &json!(2));
        assert_eq!(t.search("bil"), vec![json!(1)]);
        assert_eq!(t.len(), 2);
    }
}
