//! M3: Full-text and Geo
//!
//! Test Cases:
//! - TC-3.1: Exact search requires every term and ranks by score
//! - TC-3.2: Fuzzy search tolerates typos
//! - TC-3.3: Search combined with other conditions
//! - TC-3.4: Search indexes follow writes
//! - TC-3.5: CROW distance via the geo index vs full scan vs haversine
//! - TC-3.6: Custom tokenizers
//!
//! Run individual tests with:
//!   cargo test --test m3_search_geo tc_3_5 -- --nocapture

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Arc;
use tabel::{schema_from_json, AccessPath, Config, Error, MemoryAdapter, Query, Row, TabelDB, Tokenizer};

fn setup_db() -> TabelDB {
    let schema = schema_from_json(&json!({
        "articles": [
            {"key": "id", "type": "int", "props": ["pk", "ai"]},
            {"key": "title", "type": "string", "props": ["search"]},
            {"key": "body", "type": "string", "props": ["search"]},
            {"key": "year", "type": "int"}
        ],
        "places": [
            {"key": "id", "type": "int", "props": ["pk"]},
            {"key": "loc", "type": "geo", "props": ["idx"]}
        ],
        "places_plain": [
            {"key": "id", "type": "int", "props": ["pk"]},
            {"key": "loc", "type": "geo"}
        ]
    }))
    .unwrap();
    TabelDB::connect(schema, Arc::new(MemoryAdapter::new()), Config::default()).unwrap()
}

fn seed_articles(db: &TabelDB) {
    db.query(Query::upsert(
        "articles",
        json!([
            {"title": "Rust database engine", "body": "storage and indexes", "year": 2021},
            {"title": "A database written in Go", "body": "goroutines everywhere", "year": 2019},
            {"title": "Rust compiler internals", "body": "the tokio runtime is not here", "year": 2023}
        ]),
    ))
    .unwrap();
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
}

fn search(db: &TabelDB, filter: Value) -> Vec<i64> {
    ids(&db.query(Query::select("articles").filter(filter)).unwrap())
}

// ============================================================================
// TC-3.1: Exact search requires every term and ranks by score
// ============================================================================
mod tc_3_1_exact {
    use super::*;

    #[test]
    fn test_all_terms_required() {
        let db = setup_db();
        seed_articles(&db);
        assert_eq!(search(&db, json!(["search(title)", "=", "rust database"])), vec![1]);
        assert!(search(&db, json!(["search(title)", "=", "rust go"])).is_empty());
    }

    #[test]
    fn test_ranked_by_score() {
        let db = setup_db();
        seed_articles(&db);
        // shorter document, higher term frequency
        let out = db.query_traced(Query::select("articles").filter(json!(["search(title)", "=", "database"]))).unwrap();
        assert_eq!(out.trace.access, AccessPath::Index);
        assert_eq!(ids(&out.rows), vec![1, 2]);

        // explicit ordering wins over rank
        let ordered = ids(
            &db.query(
                Query::select("articles")
                    .filter(json!(["search(title)", "=", "database"]))
                    .order_by(json!(["year"])),
            )
            .unwrap(),
        );
        assert_eq!(ordered, vec![2, 1]);
    }

    #[test]
    fn test_multi_column_search() {
        let db = setup_db();
        seed_articles(&db);
        assert_eq!(search(&db, json!(["search(title, body)", "=", "tokio"])), vec![3]);
        let both = search(&db, json!(["search(title, body)", "=", "rust"]));
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_search_on_plain_column_fails() {
        let db = setup_db();
        let err = db.query(Query::select("articles").filter(json!(["search(year)", "=", "x"]))).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

// ============================================================================
// TC-3.2: Fuzzy search tolerates typos
// ============================================================================
mod tc_3_2_fuzzy {
    use super::*;

    #[test]
    fn test_typo_matches() {
        let db = setup_db();
        seed_articles(&db);
        let mut found = search(&db, json!(["search(title)", ">", [0.5, "databse"]]));
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);
        assert_eq!(search(&db, json!(["search(title)", ">=", [0.5, "compiller"]])), vec![3]);
    }

    #[test]
    fn test_unrelated_text_misses() {
        let db = setup_db();
        seed_articles(&db);
        assert!(search(&db, json!(["search(title)", ">", [0.3, "zebra"]])).is_empty());
    }
}

// ============================================================================
// TC-3.3: Search combined with other conditions
// ============================================================================
mod tc_3_3_combined {
    use super::*;

    #[test]
    fn test_search_and_pk() {
        let db = setup_db();
        seed_articles(&db);
        let q = Query::select("articles").filter(json!([["search(title)", "=", "rust"], "AND", ["id", ">", 1]]));
        assert_eq!(db.explain(&q).unwrap(), AccessPath::Index);
        assert_eq!(ids(&db.query(q).unwrap()), vec![3]);
    }

    #[test]
    fn test_search_and_unindexed_column() {
        let db = setup_db();
        seed_articles(&db);
        let q = Query::select("articles").filter(json!([["search(title)", "=", "rust"], "AND", ["year", "<", 2022]]));
        assert_eq!(db.explain(&q).unwrap(), AccessPath::Partial);
        assert_eq!(ids(&db.query(q).unwrap()), vec![1]);
    }

    #[test]
    fn test_search_or_scan() {
        let db = setup_db();
        seed_articles(&db);
        let mut found = search(&db, json!([["year", "=", 2019], "OR", ["search(body)", "=", "storage"]]));
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);
    }
}

// ============================================================================
// TC-3.4: Search indexes follow writes
// ============================================================================
mod tc_3_4_maintenance {
    use super::*;

    #[test]
    fn test_update_and_delete() {
        let db = setup_db();
        seed_articles(&db);
        db.query(Query::upsert("articles", json!({"id": 2, "title": "A datastore written in Zig"}))).unwrap();
        assert_eq!(search(&db, json!(["search(title)", "=", "database"])), vec![1]);
        assert_eq!(search(&db, json!(["search(title)", "=", "zig"])), vec![2]);

        db.query(Query::delete("articles").filter(json!(["id", "=", 1]))).unwrap();
        assert!(search(&db, json!(["search(title)", "=", "database"])).is_empty());
        assert!(search(&db, json!(["search(title)", ">", [0.2, "databse"]])).is_empty());
    }

    #[test]
    fn test_rebuild_restores_search() {
        let db = setup_db();
        seed_articles(&db);
        db.rebuild_indexes(Some("articles")).unwrap();
        assert_eq!(search(&db, json!(["search(title)", "=", "rust database"])), vec![1]);
    }
}

// ============================================================================
// TC-3.5: CROW distance via the geo index vs full scan vs haversine
// ============================================================================
mod tc_3_5_crow {
    use super::*;

    const R: f64 = 6371.0088;

    fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
        let dp = (lat2 - lat1).to_radians();
        let dl = (lon2 - lon1).to_radians();
        let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
        2.0 * R * a.sqrt().asin()
    }

    fn seed_points(db: &TabelDB, n: usize) -> Vec<(i64, f64, f64)> {
        let mut rng = StdRng::seed_from_u64(2024);
        let points: Vec<(i64, f64, f64)> =
            (1..=n as i64).map(|id| (id, rng.gen_range(-80.0..80.0), rng.gen_range(-180.0..180.0))).collect();
        let rows: Vec<Value> =
            points.iter().map(|(id, lat, lon)| json!({"id": id, "loc": {"lat": lat, "lon": lon}})).collect();
        db.query(Query::upsert("places", Value::Array(rows.clone()))).unwrap();
        db.query(Query::upsert("places_plain", Value::Array(rows))).unwrap();
        points
    }

    fn check(db: &TabelDB, points: &[(i64, f64, f64)], lat: f64, lon: f64, km: f64) -> Vec<i64> {
        let filter = json!([format!("CROW(loc, {lat}, {lon})"), "<", km]);
        let fast = db.query_traced(Query::select("places").filter(filter.clone())).unwrap();
        let slow = db.query_traced(Query::select("places_plain").filter(filter)).unwrap();
        assert_eq!(fast.trace.access, AccessPath::Index);
        assert_eq!(slow.trace.access, AccessPath::Scan);

        let mut expected: Vec<i64> =
            points.iter().filter(|(_, a, b)| haversine(*a, *b, lat, lon) < km).map(|(id, _, _)| *id).collect();
        expected.sort_unstable();
        let (mut a, mut b) = (ids(&fast.rows), ids(&slow.rows));
        a.sort_unstable();
        b.sort_unstable();
        println!("crow({lat}, {lon}) < {km}: {} rows, index fetched {}", a.len(), fast.trace.fetched);
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert!(fast.trace.fetched < points.len());
        a
    }

    #[test]
    fn test_crow_800km_5000_points() {
        let db = setup_db();
        let points = seed_points(&db, 5000);
        let found = check(&db, &points, -6.2, 106.8, 800.0);
        assert!(!found.is_empty());
    }

    #[test]
    fn test_crow_across_antimeridian() {
        let db = setup_db();
        let points = seed_points(&db, 3000);
        check(&db, &points, 10.0, 179.5, 1500.0);
        check(&db, &points, -30.0, -179.9, 900.0);
    }

    #[test]
    fn test_crow_projection() {
        let db = setup_db();
        db.query(Query::upsert("places", json!({"id": 1, "loc": {"lat": -6.2088, "lon": 106.8456}}))).unwrap();
        let rows = db
            .query(Query::select("places").columns(json!(["id", "CROW(loc, -6.9175, 107.6191) AS km"])))
            .unwrap();
        let km = rows[0]["km"].as_f64().unwrap();
        assert!((km - haversine(-6.2088, 106.8456, -6.9175, 107.6191)).abs() < 1e-6);
    }

    #[test]
    fn test_crow_needs_a_distance() {
        let db = setup_db();
        let err = db.query(Query::select("places").filter(json!(["CROW(loc, 1, 2)", "=", "far"]))).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

// ============================================================================
// TC-3.6: Custom tokenizers
// ============================================================================
mod tc_3_6_tokenizers {
    use super::*;

    struct CommaTokenizer;

    impl Tokenizer for CommaTokenizer {
        fn tokenize(&self, text: &str) -> Vec<String> {
            text.split(',').map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect()
        }

        fn name(&self) -> &str {
            "comma"
        }
    }

    #[test]
    fn test_unknown_tokenizer_rejected() {
        let schema = schema_from_json(&json!({
            "t": [
                {"key": "id", "type": "int", "props": ["pk"]},
                {"key": "tags", "type": "string", "props": ["search"], "tokenizer": "comma"}
            ]
        }))
        .unwrap();
        let err = TabelDB::connect(schema, Arc::new(MemoryAdapter::new()), Config::default()).err();
        assert!(matches!(err, Some(Error::Configuration(_))));
    }

    #[test]
    fn test_registered_tokenizer_after_rebuild() {
        let schema = schema_from_json(&json!({
            "t": [
                {"key": "id", "type": "int", "props": ["pk"]},
                {"key": "tags", "type": "string", "props": ["search"], "tokenizer": "raw"}
            ]
        }))
        .unwrap();
        let db = TabelDB::connect(schema, Arc::new(MemoryAdapter::new()), Config::default()).unwrap();
        db.query(Query::upsert("t", json!([{"id": 1, "tags": "New York"}, {"id": 2, "tags": "york"}]))).unwrap();

        // raw keeps case and splits on whitespace
        let hits = ids(&db.query(Query::select("t").filter(json!(["search(tags)", "=", "York"]))).unwrap());
        assert_eq!(hits, vec![1]);

        db.register_tokenizer(Arc::new(CommaTokenizer));
        assert!(db.query(Query::select("t").filter(json!(["search(tags)", "=", "New"]))).is_ok());
    }
}
