use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rebatch::error::BatchError;
use rebatch::store::{FilterSpec, JobStore};
use serde_json::json;
use tempfile::TempDir;

fn cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn vals(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Store with the name/url fixture rows used across these tests.
fn seeded_store() -> JobStore {
    let store = JobStore::open_in_memory().unwrap();
    store.init_schema(&cols(&["name", "url"])).unwrap();
    store.insert(&vals(&["n-1", "https://a"])).unwrap();
    store.insert(&vals(&["n-2", "https://b"])).unwrap();
    store.insert(&vals(&["n-3", "https://c"])).unwrap();
    store
}

#[test]
fn test_schema_round_trip() {
    let store = JobStore::open_in_memory().unwrap();
    store.init_schema(&cols(&["a", "b"])).unwrap();
    store.insert(&vals(&["x", "y"])).unwrap();

    let (rows, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1]);
    assert_eq!(rows.len(), 1);

    let row = &rows[0];
    assert_eq!(row["rowid"], json!(1));
    assert_eq!(row["a"], json!("x"));
    assert_eq!(row["b"], json!("y"));
    assert_eq!(row["succeed"], json!(0));
    assert_eq!(row["attempts"], json!(0));
    assert_eq!(row["last_stdout"], json!(""));
    assert_eq!(row["last_stderr"], json!(""));
    assert_eq!(row["last_attempt_dt"], json!(""));
}

#[test]
fn test_default_order_puts_never_attempted_rows_first() {
    let store = seeded_store();
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
    store.update_outcome(2, false, "", "", t1).unwrap();
    store.update_outcome(3, false, "", "", t2).unwrap();

    // Row 1 was never attempted (empty timestamp sorts lowest), then
    // oldest attempt first.
    let (_, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn test_default_order_ties_break_by_rowid() {
    let store = seeded_store();
    let (_, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn test_oldest_attempted_row_surfaces_first() {
    let store = seeded_store();
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
    let t3 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    store.update_outcome(1, false, "", "", t3).unwrap();
    store.update_outcome(2, false, "", "", t1).unwrap();
    store.update_outcome(3, false, "", "", t2).unwrap();

    let (_, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![2, 3, 1]);
}

#[test]
fn test_succeeded_rows_are_excluded_until_reset() {
    let store = seeded_store();
    store.update_outcome(2, true, "done", "", Utc::now()).unwrap();

    let (_, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1, 3]);

    // Any predicate still carries the implicit succeed = 0 constraint.
    let spec = FilterSpec {
        filter: "name LIKE 'n-%'".to_string(),
        ..Default::default()
    };
    let (_, keys) = store.filter(&spec).unwrap();
    assert_eq!(keys, vec![1, 3]);

    store.reset().unwrap();
    let (rows, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1, 2, 3]);
    for row in &rows {
        assert_eq!(row["attempts"], json!(0));
        assert_eq!(row["last_stdout"], json!(""));
        assert_eq!(row["last_attempt_dt"], json!(""));
    }
}

#[test]
fn test_update_outcome_increments_attempts() {
    let store = seeded_store();
    for _ in 0..3 {
        store.update_outcome(1, false, "out", "err", Utc::now()).unwrap();
    }
    let (rows, _) = store.filter(&FilterSpec::default()).unwrap();
    let row = rows.iter().find(|r| r["rowid"] == json!(1)).unwrap();
    assert_eq!(row["attempts"], json!(3));
    assert_eq!(row["last_stdout"], json!("out"));
    assert_eq!(row["last_stderr"], json!("err"));
}

#[test]
fn test_concurrent_updates_to_different_rows_lose_no_counts() {
    let store = Arc::new(seeded_store());
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    let mut handles = Vec::new();
    for rowid in 1..=3i64 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                store.update_outcome(rowid, false, "", "", at).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (rows, _) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row["attempts"], json!(25));
    }
}

#[test]
fn test_reset_is_idempotent() {
    let store = seeded_store();
    store.update_outcome(1, true, "out", "err", Utc::now()).unwrap();
    store.update_outcome(2, false, "out", "err", Utc::now()).unwrap();

    store.reset().unwrap();
    let (first, _) = store.filter(&FilterSpec::default()).unwrap();
    store.reset().unwrap();
    let (second, _) = store.filter(&FilterSpec::default()).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(first[0]["name"], json!("n-1"));
    assert_eq!(first[0]["url"], json!("https://a"));
}

#[test]
fn test_filter_order_filter_and_take() {
    let store = seeded_store();

    let spec = FilterSpec {
        order: "name DESC".to_string(),
        ..Default::default()
    };
    let (_, keys) = store.filter(&spec).unwrap();
    assert_eq!(keys, vec![3, 2, 1]);

    let spec = FilterSpec {
        filter: "url LIKE '%c'".to_string(),
        ..Default::default()
    };
    let (rows, keys) = store.filter(&spec).unwrap();
    assert_eq!(keys, vec![3]);
    assert_eq!(rows[0]["name"], json!("n-3"));

    let spec = FilterSpec {
        take: 1,
        ..Default::default()
    };
    let (rows, keys) = store.filter(&spec).unwrap();
    assert_eq!(keys, vec![1]);
    assert_eq!(rows[0]["name"], json!("n-1"));
}

#[test]
fn test_query_failure_carries_the_original_fragments() {
    let store = seeded_store();
    let spec = FilterSpec {
        filter: "no_such_column = 1".to_string(),
        ..Default::default()
    };
    let err = store.filter(&spec).unwrap_err();
    assert!(matches!(err, BatchError::QueryFailure { .. }));
    assert!(err.to_string().contains("no_such_column = 1"));
}

#[test]
fn test_init_schema_is_idempotent_but_conflicts_on_mismatch() {
    let store = JobStore::open_in_memory().unwrap();
    store.init_schema(&cols(&["a", "b"])).unwrap();
    store.init_schema(&cols(&["a", "b"])).unwrap();

    let err = store.init_schema(&cols(&["a", "c"])).unwrap_err();
    assert!(matches!(err, BatchError::SchemaConflict { .. }));
}

#[test]
fn test_insert_arity_mismatch() {
    let store = seeded_store();
    let err = store.insert(&vals(&["only-one"])).unwrap_err();
    assert!(matches!(
        err,
        BatchError::ArityMismatch {
            expected: 2,
            got: 1
        }
    ));
}

#[test]
fn test_update_outcome_row_not_found() {
    let store = seeded_store();
    let err = store
        .update_outcome(99, true, "", "", Utc::now())
        .unwrap_err();
    assert!(matches!(err, BatchError::RowNotFound(99)));
}

#[test]
fn test_operations_without_schema_fail_early() {
    let store = JobStore::open_in_memory().unwrap();
    assert!(matches!(
        store.filter(&FilterSpec::default()).unwrap_err(),
        BatchError::SchemaMissing
    ));
    assert!(matches!(
        store.insert(&vals(&["x"])).unwrap_err(),
        BatchError::SchemaMissing
    ));
}

#[test]
fn test_reopen_recovers_schema_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = JobStore::open(&path).unwrap();
        store.init_schema(&cols(&["name", "url"])).unwrap();
        store.insert(&vals(&["n-1", "https://a"])).unwrap();
    }

    let store = JobStore::open(&path).unwrap();
    assert_eq!(store.columns(), cols(&["name", "url"]));
    let (rows, keys) = store.filter(&FilterSpec::default()).unwrap();
    assert_eq!(keys, vec![1]);
    assert_eq!(rows[0]["name"], json!("n-1"));
}
