//! Unit tests for the SQLite observation store: inserts, decay, prune,
//! the manopt cache, and prune bookkeeping.

use zsh_tool::store::{Observation, Store};

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let store = Store::open(&dir.path().join("alan.db")).expect("open store");
    (dir, store)
}

fn obs(fingerprint: &str, template: &str, exit_code: i32) -> Observation {
    Observation {
        session_id: "test-session".to_string(),
        command_fingerprint: fingerprint.to_string(),
        command_preview: "cmd preview".to_string(),
        template: template.to_string(),
        exit_code,
        pipestatus: vec![exit_code],
        duration_ms: 100,
        timed_out: false,
        output_snippet: Some("out".to_string()),
        error_snippet: None,
    }
}

// ---------------------------------------------------------------------------
// Insert + pattern aggregation
// ---------------------------------------------------------------------------

#[test]
fn test_insert_and_query_pattern() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("fp1", "t", 0)).unwrap();
    store.insert_observation(&obs("fp1", "t", 1)).unwrap();

    let agg = store.query_pattern("fp1", 24.0).unwrap().expect("known");
    assert_eq!(agg.observations, 2);
    assert!(agg.weighted_observations > 1.9);
    assert!((agg.success_rate - 0.5).abs() < 0.05);
    assert_eq!(agg.timeout_rate, 0.0);
    assert_eq!(agg.max_duration_ms, 100);
}

#[test]
fn test_query_pattern_unknown_returns_none() {
    let (_dir, store) = temp_store();
    assert!(store.query_pattern("missing", 24.0).unwrap().is_none());
}

#[test]
fn test_timeout_rate_counts_timed_out_rows() {
    let (_dir, store) = temp_store();
    let mut timed_out = obs("fp2", "t", -1);
    timed_out.timed_out = true;
    store.insert_observation(&timed_out).unwrap();
    store.insert_observation(&obs("fp2", "t", 0)).unwrap();

    let agg = store.query_pattern("fp2", 24.0).unwrap().unwrap();
    assert!((agg.timeout_rate - 0.5).abs() < 0.05);
    assert!((agg.success_rate - 0.5).abs() < 0.05);
}

// ---------------------------------------------------------------------------
// Recent outcomes by template
// ---------------------------------------------------------------------------

#[test]
fn test_recent_by_template_newest_first() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("a", "tar xf *", 0)).unwrap();
    store.insert_observation(&obs("b", "tar xf *", 2)).unwrap();
    store.insert_observation(&obs("c", "tar xf *", 3)).unwrap();

    let recent = store
        .query_recent_by_template("tar xf *", "test-session", 10)
        .unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].exit_code, 3);
    assert_eq!(recent[1].exit_code, 2);
    assert_eq!(recent[2].exit_code, 0);
}

#[test]
fn test_recent_by_template_scoped_to_session() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("a", "tar xf *", 2)).unwrap();

    let other = store
        .query_recent_by_template("tar xf *", "other-session", 10)
        .unwrap();
    assert!(other.is_empty());
}

#[test]
fn test_recent_by_template_respects_limit() {
    let (_dir, store) = temp_store();
    for _ in 0..5 {
        store.insert_observation(&obs("a", "t *", 1)).unwrap();
    }
    let recent = store.query_recent_by_template("t *", "test-session", 2).unwrap();
    assert_eq!(recent.len(), 2);
}

// ---------------------------------------------------------------------------
// Decay + prune
// ---------------------------------------------------------------------------

#[test]
fn test_decay_never_increases_weight() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("fp", "t", 0)).unwrap();
    store.apply_decay(24.0).unwrap();

    let agg = store.query_pattern("fp", 24.0).unwrap().unwrap();
    assert!(agg.weighted_observations <= 1.0);
    assert!(agg.weighted_observations > 0.9);
}

#[test]
fn test_prune_drops_rows_below_threshold() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("fp", "t", 0)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    // A vanishingly small half-life decays any nonzero age to ~0 weight.
    store.prune(1e-9, 0.01, 1000).unwrap();
    assert!(store.query_pattern("fp", 24.0).unwrap().is_none());
    assert_eq!(store.totals().unwrap().total_observations, 0);
}

#[test]
fn test_prune_caps_total_entries() {
    let (_dir, store) = temp_store();
    for i in 0..20 {
        store.insert_observation(&obs(&format!("fp{i}"), "t", 0)).unwrap();
    }
    store.prune(24.0, 0.0, 5).unwrap();
    assert_eq!(store.totals().unwrap().total_observations, 5);
}

#[test]
fn test_prune_keeps_fresh_rows() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("fp", "t", 0)).unwrap();
    store.prune(24.0, 0.01, 1000).unwrap();
    assert!(store.query_pattern("fp", 24.0).unwrap().is_some());
}

#[test]
fn test_prune_records_last_prune() {
    let (_dir, store) = temp_store();
    assert!(store.get_last_prune().unwrap().is_none());
    store.prune(24.0, 0.01, 1000).unwrap();
    let last = store.get_last_prune().unwrap().expect("last prune set");
    let age = chrono::Utc::now() - last;
    assert!(age.num_seconds() < 10);
}

#[test]
fn test_set_last_prune_round_trips() {
    let (_dir, store) = temp_store();
    let at = chrono::Utc::now();
    store.set_last_prune(at).unwrap();
    let read = store.get_last_prune().unwrap().unwrap();
    assert!((read - at).num_milliseconds().abs() < 1000);
}

// ---------------------------------------------------------------------------
// Manopt cache
// ---------------------------------------------------------------------------

#[test]
fn test_manopt_cache_miss() {
    let (_dir, store) = temp_store();
    assert!(store.get_manopt_cache("tar").unwrap().is_none());
}

#[test]
fn test_manopt_cache_round_trip() {
    let (_dir, store) = temp_store();
    store.upsert_manopt_cache("tar", "tar options table").unwrap();
    assert_eq!(
        store.get_manopt_cache("tar").unwrap().as_deref(),
        Some("tar options table")
    );
}

#[test]
fn test_manopt_cache_upsert_replaces() {
    let (_dir, store) = temp_store();
    store.upsert_manopt_cache("grep", "old").unwrap();
    store.upsert_manopt_cache("grep", "new").unwrap();
    assert_eq!(store.get_manopt_cache("grep").unwrap().as_deref(), Some("new"));
}

#[test]
fn test_manopt_cache_survives_prune() {
    let (_dir, store) = temp_store();
    store.upsert_manopt_cache("grep", "grep options").unwrap();
    store.prune(1e-9, 0.01, 1000).unwrap();
    assert_eq!(
        store.get_manopt_cache("grep").unwrap().as_deref(),
        Some("grep options")
    );
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

#[test]
fn test_totals_counts_rows_and_patterns() {
    let (_dir, store) = temp_store();
    store.insert_observation(&obs("fp1", "t", 0)).unwrap();
    store.insert_observation(&obs("fp1", "t", 0)).unwrap();
    store.insert_observation(&obs("fp2", "t", 0)).unwrap();

    let totals = store.totals().unwrap();
    assert_eq!(totals.total_observations, 3);
    assert_eq!(totals.total_patterns, 2);
}
