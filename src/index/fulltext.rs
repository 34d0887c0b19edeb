//! Full-text inverted indexes for `search` columns.
//!
//! Three shadow tables per column:
//! - token cache `{id: pk, hash, tokens}`: last indexed content, so unchanged
//!   values are skipped and changed ones are diffed term by term
//! - exact index `{id: term, rows: [{pk, i: [positions], l: docLen}]}`
//! - fuzzy index, same shape, keyed by the term's consonant skeleton
//!
//! Exact queries need every query term present; the score is term frequency
//! per document length plus a bonus for each in-order phrase occurrence.
//! Fuzzy queries score on skeleton hits, then re-score against the cached
//! tokens with edit distance. Both score sets are max-normalized to [0, 1].

use super::store::ShadowStore;
use super::tokenizer::{Tokenizer, TokenizerRegistry};
use crate::catalog::{exact_table, fuzzy_table, token_table, SearchColumn};
use crate::error::{Error, Result};
use crate::types::{pk_key, Row};
use ahash::{AHashMap, AHashSet};
use serde_json::{json, Value};
use std::sync::Arc;

type Positions = AHashMap<String, Vec<usize>>;

/// One document's entry in a term's posting list.
struct Hit {
    pk: Value,
    positions: Vec<usize>,
    len: usize,
}

pub struct SearchIndex {
    store: Arc<ShadowStore>,
    tokenizers: Arc<TokenizerRegistry>,
}

impl SearchIndex {
    pub fn new(store: Arc<ShadowStore>, tokenizers: Arc<TokenizerRegistry>) -> Self {
        Self { store, tokenizers }
    }

    fn tokenizer(&self, sc: &SearchColumn) -> Result<Arc<dyn Tokenizer>> {
        self.tokenizers
            .get(&sc.tokenizer)
            .ok_or_else(|| Error::config(format!("unknown tokenizer '{}' on {}", sc.tokenizer, sc.column)))
    }

    pub fn check_tokenizer(&self, sc: &SearchColumn) -> Result<()> {
        self.tokenizer(sc).map(|_| ())
    }

    /// Reindex one row's value. No-op when the content hash is unchanged.
    pub fn update(&self, table: &str, sc: &SearchColumn, pk: &Value, value: Option<&Value>) -> Result<()> {
        let text = value_text(value);
        let tokens = if text.is_empty() { Vec::new() } else { self.tokenizer(sc)?.tokenize(&text) };
        let hash = format!("{:016x}", seahash::hash(text.as_bytes()));

        let cache_table = token_table(table, &sc.column);
        let cached = self.store.get(&cache_table, pk)?;
        if cached.as_ref().and_then(|c| c.get("hash")).and_then(Value::as_str) == Some(hash.as_str()) {
            return Ok(());
        }
        let old_tokens = cached.as_ref().map(cached_tokens).unwrap_or_default();

        self.apply_diff(&exact_table(table, &sc.column), pk, &old_tokens, &tokens, |t| t.to_string())?;
        self.apply_diff(&fuzzy_table(table, &sc.column), pk, &old_tokens, &tokens, fuzzy_key)?;

        if value.is_none() && tokens.is_empty() {
            return self.store.remove(&cache_table, pk);
        }
        let row = json!({"id": pk, "hash": hash, "tokens": tokens});
        self.store.put(&cache_table, into_row(row))
    }

    /// Drop a row from both inverted indexes and the token cache.
    pub fn clear(&self, table: &str, sc: &SearchColumn, pk: &Value) -> Result<()> {
        let cache_table = token_table(table, &sc.column);
        let Some(cached) = self.store.get(&cache_table, pk)? else {
            return Ok(());
        };
        let old_tokens = cached_tokens(&cached);
        self.apply_diff(&exact_table(table, &sc.column), pk, &old_tokens, &[], |t| t.to_string())?;
        self.apply_diff(&fuzzy_table(table, &sc.column), pk, &old_tokens, &[], fuzzy_key)?;
        self.store.remove(&cache_table, pk)
    }

    pub fn truncate(&self, table: &str, sc: &SearchColumn) -> Result<()> {
        self.store.truncate(&token_table(table, &sc.column))?;
        self.store.truncate(&exact_table(table, &sc.column))?;
        self.store.truncate(&fuzzy_table(table, &sc.column))
    }

    /// Touch only the terms whose positions or document length changed.
    fn apply_diff(
        &self,
        index: &str,
        pk: &Value,
        old: &[String],
        new: &[String],
        key: impl Fn(&str) -> String,
    ) -> Result<()> {
        let old_pos = positions(old, &key);
        let new_pos = positions(new, &key);
        let length_changed = old.len() != new.len();
        let mut terms: Vec<&String> = old_pos.keys().chain(new_pos.keys()).collect();
        terms.sort();
        terms.dedup();
        for term in terms {
            let before = old_pos.get(term);
            let after = new_pos.get(term);
            if before == after && !length_changed {
                continue;
            }
            let entry = after.map(|p| json!({"pk": pk, "i": p, "l": new.len()}));
            let pk_str = pk_key(pk);
            self.store.update(index, &Value::String(term.clone()), move |current| {
                let mut rows: Vec<Value> = current
                    .and_then(|r| r.get("rows").and_then(Value::as_array).cloned())
                    .unwrap_or_default();
                rows.retain(|r| r.get("pk").map(pk_key).as_deref() != Some(pk_str.as_str()));
                rows.extend(entry);
                if rows.is_empty() {
                    return None;
                }
                Some(into_row(json!({"rows": rows})))
            })?;
        }
        Ok(())
    }

    fn postings(&self, index: &str, term: &str) -> Result<Vec<Hit>> {
        let row = self.store.get(index, &Value::String(term.to_string()))?;
        Ok(row.map(|r| parse_hits(&r)).unwrap_or_default())
    }

    /// Rows containing every query term in at least one of `columns`.
    pub fn search_exact(&self, table: &str, columns: &[&SearchColumn], query: &str) -> Result<Vec<(Value, f64)>> {
        let mut scores: AHashMap<String, (Value, f64)> = AHashMap::new();
        for sc in columns {
            let terms = self.tokenizer(sc)?.tokenize(query);
            if terms.is_empty() {
                continue;
            }
            let index = exact_table(table, &sc.column);
            let mut per_term: Vec<AHashMap<String, Hit>> = Vec::with_capacity(terms.len());
            for term in &terms {
                let hits = self.postings(&index, term)?;
                per_term.push(hits.into_iter().map(|h| (pk_key(&h.pk), h)).collect());
            }
            for (key, first) in &per_term[0] {
                if !per_term.iter().all(|m| m.contains_key(key)) {
                    continue;
                }
                let mut seen = AHashSet::new();
                let mut score = 0.0;
                for (term, hits) in terms.iter().zip(&per_term) {
                    if seen.insert(term) {
                        let h = &hits[key];
                        score += h.positions.len() as f64 / h.len.max(1) as f64;
                    }
                }
                score += phrase_count(key, &per_term) as f64;
                let slot = scores.entry(key.clone()).or_insert_with(|| (first.pk.clone(), 0.0));
                slot.1 += score;
            }
        }
        Ok(normalize(scores.into_values().collect()))
    }

    /// Typo-tolerant search. Keeps rows whose final normalized score reaches `min_score`.
    pub fn search_fuzzy(
        &self,
        table: &str,
        columns: &[&SearchColumn],
        query: &str,
        min_score: f64,
    ) -> Result<Vec<(Value, f64)>> {
        let mut index_scores: AHashMap<String, (Value, f64)> = AHashMap::new();
        let mut query_terms: Vec<(usize, Vec<String>)> = Vec::new();
        for (col, sc) in columns.iter().enumerate() {
            let mut terms = self.tokenizer(sc)?.tokenize(query);
            terms.sort();
            terms.dedup();
            if terms.is_empty() {
                continue;
            }
            let index = fuzzy_table(table, &sc.column);
            let n = terms.len() as f64;
            for term in &terms {
                for hit in self.postings(&index, &fuzzy_key(term))? {
                    let slot = index_scores.entry(pk_key(&hit.pk)).or_insert_with(|| (hit.pk.clone(), 0.0));
                    slot.1 += 1.0 / n;
                }
            }
            query_terms.push((col, terms));
        }

        // the skeleton match only proves a candidate, distance decides the score
        let mut confirmed = Vec::with_capacity(index_scores.len());
        for (pk, idx_score) in normalize(index_scores.into_values().collect()) {
            let mut relevance: f64 = 0.0;
            for (col, terms) in &query_terms {
                let sc = columns[*col];
                let Some(cached) = self.store.get(&token_table(table, &sc.column), &pk)? else {
                    continue;
                };
                relevance = relevance.max(term_relevance(terms, &cached_tokens(&cached)));
            }
            if relevance > 0.0 {
                confirmed.push((pk, idx_score * relevance));
            }
        }
        Ok(normalize(confirmed).into_iter().filter(|(_, s)| *s >= min_score).collect())
    }

    /// Rebuild one column from scratch over `(pk, value)` pairs.
    pub fn rebuild<'a>(
        &self,
        table: &str,
        sc: &SearchColumn,
        rows: impl Iterator<Item = (&'a Value, Option<&'a Value>)>,
    ) -> Result<()> {
        self.truncate(table, sc)?;
        for (pk, value) in rows {
            self.update(table, sc, pk, value)?;
        }
        Ok(())
    }
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items.iter().map(|v| value_text(Some(v))).collect::<Vec<_>>().join(" "),
        Some(other) => other.to_string(),
    }
}

fn cached_tokens(row: &Row) -> Vec<String> {
    row.get("tokens")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn positions(tokens: &[String], key: impl Fn(&str) -> String) -> Positions {
    let mut map: Positions = AHashMap::new();
    for (i, token) in tokens.iter().enumerate() {
        map.entry(key(token)).or_default().push(i);
    }
    map
}

fn parse_hits(row: &Row) -> Vec<Hit> {
    row.get("rows")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|r| {
                    Some(Hit {
                        pk: r.get("pk")?.clone(),
                        positions: r
                            .get("i")?
                            .as_array()?
                            .iter()
                            .filter_map(|p| p.as_u64().map(|p| p as usize))
                            .collect(),
                        len: r.get("l")?.as_u64()? as usize,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// In-order occurrences of the full query phrase in one document.
fn phrase_count(key: &str, per_term: &[AHashMap<String, Hit>]) -> usize {
    if per_term.len() < 2 {
        return 0;
    }
    let starts = &per_term[0][key].positions;
    starts
        .iter()
        .filter(|&&p| {
            per_term[1..]
                .iter()
                .enumerate()
                .all(|(k, hits)| hits[key].positions.contains(&(p + k + 1)))
        })
        .count()
}

fn normalize(scores: Vec<(Value, f64)>) -> Vec<(Value, f64)> {
    let max = scores.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let mut out: Vec<(Value, f64)> = scores.into_iter().map(|(pk, s)| (pk, s / max)).collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    out
}

/// Mean over query terms of the best `1 - distance / longer length` against the document.
fn term_relevance(query: &[String], doc: &[String]) -> f64 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let total: f64 = query
        .iter()
        .map(|q| {
            doc.iter()
                .map(|t| {
                    let longest = q.chars().count().max(t.chars().count()).max(1);
                    1.0 - levenshtein(q, t) as f64 / longest as f64
                })
                .fold(0.0_f64, f64::max)
        })
        .sum();
    total / query.len() as f64
}

/// First letter plus the remaining consonants, repeats collapsed.
pub fn fuzzy_key(term: &str) -> String {
    let lower = term.to_lowercase();
    let mut chars = lower.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut key = String::from(first);
    let mut last = first;
    for c in chars {
        if c != last && !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y' | 'h' | 'w') {
            key.push(c);
        }
        last = c;
    }
    key
}

/// Two-row Levenshtein over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, StorageAdapter};
    use crate::catalog::{Catalog, ColumnDecl, TableDecl};

    fn setup(cached: bool) -> (SearchIndex, SearchColumn) {
        let cat = Catalog::build(&[TableDecl::new(
            "docs",
            vec![ColumnDecl::new("id", "int").props(&["pk"]), ColumnDecl::new("body", "string").props(&["search"])],
        )])
        .unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        for t in cat.tables() {
            adapter.make_table(t).unwrap();
        }
        let store = Arc::new(ShadowStore::new(adapter, cached));
        let sc = cat.table("docs").unwrap().search[0].clone();
        (SearchIndex::new(store, Arc::new(TokenizerRegistry::new("english"))), sc)
    }

    #[test]
    fn test_fuzzy_key_and_distance() {
        assert_eq!(fuzzy_key("billy"), "bl");
        assert_eq!(fuzzy_key("bily"), "bl");
        assert_eq!(fuzzy_key("Jakarta"), "jkrt");
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_exact_requires_all_terms_and_ranks_phrases() {
        let (idx, sc) = setup(true);
        idx.update("docs", &sc, &json!(1), Some(&json!("the quick brown fox"))).unwrap();
        idx.update("docs", &sc, &json!(2), Some(&json!("brown quick dog"))).unwrap();
        idx.update("docs", &sc, &json!(3), Some(&json!("slow turtle"))).unwrap();

        let hits = idx.search_exact("docs", &[&sc], "quick brown").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, json!(1));
        assert_eq!(hits[0].1, 1.0);
        assert!(hits[1].1 < 1.0);
        assert!(idx.search_exact("docs", &[&sc], "quick turtle").unwrap().is_empty());
    }

    #[test]
    fn test_update_diff_and_clear() {
        let (idx, sc) = setup(false);
        idx.update("docs", &sc, &json!(1), Some(&json!("alpha beta"))).unwrap();
        idx.update("docs", &sc, &json!(1), Some(&json!("alpha gamma"))).unwrap();
        assert!(idx.search_exact("docs", &[&sc], "beta").unwrap().is_empty());
        assert_eq!(idx.search_exact("docs", &[&sc], "gamma").unwrap().len(), 1);
        idx.clear("docs", &sc, &json!(1)).unwrap();
        assert!(idx.search_exact("docs", &[&sc], "alpha").unwrap().is_empty());
    }

    #[test]
    fn test_fuzzy_tolerates_typos() {
        let (idx, sc) = setup(true);
        idx.update("docs", &sc, &json!(1), Some(&json!("jakarta traffic report"))).unwrap();
        idx.update("docs", &sc, &json!(2), Some(&json!("bandung weather"))).unwrap();
        let hits = idx.search_fuzzy("docs", &[&sc], "jakrta", 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, json!(1));
    }
}
