//! Executes compiled statements against SQLite and checks result rows.
//!
//! Only the shapes that stay within SQLite's dialect are executed here:
//! plain aggregates, compare, top-k-within-group and custom buckets.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use scout_nql::canonical::{
    CanonicalStore, FilterResolver, MappingRepository, ResolvedFilters, SqliteVocabulary, StoreOptions,
};
use scout_nql::nql::{compile, CompileOptions, CompiledQuery, PlanValidator, QueryPlan};
use scout_nql::semantic::{load_from_json, SemanticModel};
use scout_nql::NqlError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str = r#"
CREATE TABLE la_crime_raw (
    "DATE OCC" TEXT NOT NULL,
    "AREA NAME" TEXT,
    "Crm Cd Desc" TEXT,
    "Weapon Desc" TEXT,
    "Premis Desc" TEXT,
    "Vict Age" INTEGER
);
INSERT INTO la_crime_raw VALUES
    ('2023-12-03', 'Hollywood', 'BURGLARY', NULL,       'STREET',      25),
    ('2023-12-05', 'Hollywood', 'BURGLARY', 'HAND GUN', 'STREET',      34),
    ('2023-12-10', 'Hollywood', 'THEFT',    NULL,       'DWELLING',    41),
    ('2023-12-20', 'Hollywood', 'BURGLARY', 'KNIFE',    'DWELLING',    19),
    ('2023-12-11', 'Harbor',    'THEFT',    NULL,       'STREET',      52),
    ('2023-12-28', 'Harbor',    'THEFT',    'HAND GUN', 'PARKING LOT', 67),
    ('2023-11-02', 'Hollywood', 'THEFT',    NULL,       'STREET',      30),
    ('2023-11-15', 'Hollywood', 'BURGLARY', NULL,       'STREET',      45),
    ('2023-11-20', 'Wilshire',  'THEFT',    NULL,       'DWELLING',    23);
"#;

fn model() -> Arc<SemanticModel> {
    load_from_json(include_str!("../demos/semantic.json")).unwrap()
}

fn seeded() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
}

fn options() -> CompileOptions {
    CompileOptions::anchored(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
}

fn compile_passthrough(json: &str) -> CompiledQuery {
    let model = model();
    let plan = PlanValidator::new(model.as_ref())
        .validate(QueryPlan::from_json(json).unwrap())
        .unwrap();
    let filters = ResolvedFilters::passthrough(&plan, &model);
    compile(&plan, &filters, &model, &options()).unwrap()
}

/// Column names and every row of the compiled statement.
fn run(conn: &Connection, compiled: &CompiledQuery) -> (Vec<String>, Vec<Vec<Value>>) {
    let mut stmt = conn.prepare(&compiled.sql).unwrap();
    let names = stmt.column_names().into_iter().map(String::from).collect::<Vec<_>>();
    let width = names.len();
    let rows = stmt
        .query_map(params_from_iter(compiled.params.iter()), |row| {
            (0..width).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();
    (names, rows)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[test]
fn aggregate_with_like_filter_and_month_window() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
            "filters": [{"field": "weapon", "operator": "eq", "value": "%GUN%"}],
            "time": {"window": {"single_month": "2023-12-01"}},
            "order_by": [{"field": "area"}]}"#,
    );
    let (names, rows) = run(&conn, &compiled);
    assert_eq!(names, vec!["area", "incidents"]);
    assert_eq!(
        rows,
        vec![
            vec![text("Harbor"), Value::Integer(1)],
            vec![text("Hollywood"), Value::Integer(1)],
        ]
    );
}

#[test]
fn month_over_month_compare_without_groups() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents", "aggregation": "count"}], "group_by": [],
            "time": {"window": {"single_month": "2023-12-01"}},
            "compare": {"baseline": "previous_period", "method": "diff_pct"}}"#,
    );
    let (names, rows) = run(&conn, &compiled);
    assert_eq!(names, vec!["current", "baseline", "diff_pct"]);
    assert_eq!(rows, vec![vec![Value::Integer(6), Value::Integer(3), Value::Real(1.0)]]);
}

#[test]
fn compare_keeps_current_only_groups_with_null_baseline() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
            "time": {"window": {"single_month": "2023-12-01"}},
            "compare": {"baseline": "previous_period", "method": "diff_pct"},
            "order_by": [{"field": "area"}]}"#,
    );
    let (_, rows) = run(&conn, &compiled);
    assert_eq!(
        rows,
        vec![
            vec![text("Harbor"), Value::Integer(2), Value::Null, Value::Null],
            vec![text("Hollywood"), Value::Integer(4), Value::Integer(2), Value::Real(1.0)],
        ]
    );
}

#[test]
fn compare_diff_abs() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
            "filters": [{"field": "area", "operator": "eq", "value": "Hollywood"}],
            "time": {"window": {"single_month": "2023-12-01"}},
            "compare": {"baseline": "previous_period", "method": "diff_abs"}}"#,
    );
    let (names, rows) = run(&conn, &compiled);
    assert_eq!(names, vec!["area", "current", "baseline", "diff_abs"]);
    assert_eq!(rows, vec![vec![text("Hollywood"), Value::Integer(4), Value::Integer(2), Value::Integer(2)]]);
}

#[test]
fn top_k_within_group_keeps_best_per_partition() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area", "crime_type"],
            "top_k_within_group": {"k": 1, "by": "incidents"}}"#,
    );
    let (names, rows) = run(&conn, &compiled);
    assert_eq!(names, vec!["area", "crime_type", "incidents", "rank_in_group"]);
    assert_eq!(
        rows,
        vec![
            vec![text("Harbor"), text("THEFT"), Value::Integer(2), Value::Integer(1)],
            vec![text("Hollywood"), text("BURGLARY"), Value::Integer(4), Value::Integer(1)],
            vec![text("Wilshire"), text("THEFT"), Value::Integer(1), Value::Integer(1)],
        ]
    );
}

#[test]
fn top_k_ties_break_on_last_key_ascending() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area", "crime_type"],
            "time": {"window": {"single_month": "2023-11-01"}},
            "top_k_within_group": {"k": 1, "by": "incidents"}}"#,
    );
    let (_, rows) = run(&conn, &compiled);
    assert_eq!(rows[0], vec![text("Hollywood"), text("BURGLARY"), Value::Integer(1), Value::Integer(1)]);
    assert_eq!(rows.len(), 2);
}

#[test]
fn bucket_with_exactly_five_rows_is_not_suppressed() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}, {"name": "victim_age"}],
            "time": {"window": {"single_month": "2023-12-01"}},
            "bucket": {"field": "vict_age", "method": "custom", "params": {"edges": [0, 18, 65, 120]}},
            "order_by": [{"field": "bucket"}]}"#,
    );
    let (names, rows) = run(&conn, &compiled);
    assert_eq!(names, vec!["bucket", "incidents", "victim_age"]);
    assert_eq!(
        rows,
        vec![
            vec![text("Other (<5)"), Value::Integer(1), Value::Real(67.0)],
            vec![text("[18, 65)"), Value::Integer(5), Value::Real(34.2)],
        ]
    );
    assert!(compiled.lineage.small_n_suppressed);
}

#[test]
fn small_buckets_merge_into_other_per_group() {
    let conn = seeded();
    let compiled = compile_passthrough(
        r#"{"metrics": [{"name": "incidents"}], "group_by": ["area"],
            "bucket": {"field": "vict_age", "method": "custom", "params": {"edges": [0, 18, 65, 120]}},
            "order_by": [{"field": "area"}]}"#,
    );
    let (_, rows) = run(&conn, &compiled);
    assert_eq!(
        rows,
        vec![
            vec![text("Harbor"), text("Other (<5)"), Value::Integer(2)],
            vec![text("Hollywood"), text("[18, 65)"), Value::Integer(6)],
            vec![text("Wilshire"), text("Other (<5)"), Value::Integer(1)],
        ]
    );
}

#[test]
fn canonicalized_filters_reach_the_warehouse() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("warehouse.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(SCHEMA).unwrap();

    let model = model();
    let vocabulary = SqliteVocabulary::open(&path, Arc::clone(&model), Duration::from_secs(1)).unwrap();
    let store = CanonicalStore::open(
        MappingRepository::in_memory().unwrap(),
        Arc::new(vocabulary),
        StoreOptions::default(),
    )
    .unwrap();
    store.promote("area", "hwood", "Hollywood", Some(0.9), Some("analyst")).unwrap();
    let resolver = FilterResolver::new(store, Arc::clone(&model));

    let plan = PlanValidator::new(model.as_ref())
        .validate(
            QueryPlan::from_json(
                r#"{"metrics": [{"name": "incidents"}],
                    "filters": [
                        {"field": "area", "operator": "eq", "value": "HWOOD"},
                        {"field": "crime_type", "operator": "eq", "value": "burglary"}
                    ],
                    "time": {"window": {"single_month": "2023-12-01"}}}"#,
            )
            .unwrap(),
        )
        .unwrap();
    let filters = resolver.resolve(&plan).unwrap();
    let compiled = compile(&plan, &filters, &model, &options()).unwrap();
    let (_, rows) = run(&conn, &compiled);
    assert_eq!(rows, vec![vec![Value::Integer(3)]]);
    assert_eq!(compiled.lineage.canonicalized.len(), 1);
    assert_eq!(compiled.lineage.canonicalized[0].value, "Hollywood");

    let miss = PlanValidator::new(model.as_ref())
        .validate(
            QueryPlan::from_json(
                r#"{"metrics": [{"name": "incidents"}],
                    "filters": [{"field": "area", "operator": "eq", "value": "hollywod"}]}"#,
            )
            .unwrap(),
        )
        .unwrap();
    match resolver.resolve(&miss) {
        Err(NqlError::ValueNotFound { suggestions, .. }) => {
            assert_eq!(suggestions[0].candidate, "Hollywood");
        }
        other => panic!("expected ValueNotFound, got {:?}", other),
    }
}
