//! Integration tests for [`diffrate_core::rate_table`] and
//! [`diffrate_core::materialize`].
//!
//! Covers fixed-schedule lookup, the fail-fast path for absent entries and
//! byte-stable materialization.

use ndarray::{ArrayD, IxDyn};
use tempfile::tempdir;

use diffrate_core::budget::{KeptCandidates, Schedule};
use diffrate_core::error::{DiffRateError, RateTableError};
use diffrate_core::materialize::{merge_logits_key, prune_logits_key, Materializer};
use diffrate_core::rate_table::CompressionRateTable;
use diffrate_core::registry::ModelRegistry;
use diffrate_core::state_dict::StateDict;

const TABLE: &str = r#"{
  "ViT-B-DeiT": {
    "3.0": {
      "prune_kept_num": "[197]*2 + [180] + [172]*9",
      "merge_kept_num": "[197, 188] + [172]*10"
    }
  }
}"#;

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// A present entry evaluates to a valid chain for the model.
#[test]
fn present_entry_yields_chained_schedule() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("compression_rate.json");
    std::fs::write(&path, TABLE).unwrap();

    let spec = ModelRegistry::with_defaults().get("vit_deit_base_patch16_224").unwrap().clone();
    let table = CompressionRateTable::load(&path).unwrap();
    let schedule = table.lookup(&spec.display_name, 3.0).unwrap();
    assert_eq!(schedule.depth(), 12);
    let budgets = schedule.layer_budgets_for(spec.depth, spec.num_tokens()).unwrap();
    for b in &budgets {
        assert!(b.merge_kept_num <= b.prune_kept_num && b.prune_kept_num <= b.tokens_in);
    }
    assert_eq!(budgets[2].tokens_in, 188);
}

/// An absent `(model, target)` pair is reported as "not found".
#[test]
fn absent_entry_fails_fast() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("compression_rate.json");
    std::fs::write(&path, TABLE).unwrap();
    let table = CompressionRateTable::load(&path).unwrap();

    let err: DiffRateError = table.lookup("ViT-B-DeiT", 2.5).unwrap_err().into();
    assert!(err.to_string().contains("not found"), "{err}");
    assert!(matches!(table.lookup("ViT-L-MAE", 3.0), Err(RateTableError::EntryNotFound { .. })));
}

/// A missing table file surfaces as an I/O error rather than an empty table.
#[test]
fn missing_file_is_io_error() {
    let tmp = tempdir().unwrap();
    let err = CompressionRateTable::load(&tmp.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, RateTableError::Io { .. }));
}

/// Entries whose lists disagree in length are rejected at lookup.
#[test]
fn length_mismatch_is_invalid() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("t.json");
    std::fs::write(
        &path,
        r#"{"m": {"1.0": {"prune_kept_num": "[4, 4]", "merge_kept_num": "[4]"}}}"#,
    )
    .unwrap();
    let table = CompressionRateTable::load(&path).unwrap();
    assert!(matches!(table.lookup("m", 1.0), Err(RateTableError::InvalidSchedule { .. })));
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

fn converged_state_dict(cands: &KeptCandidates, depth: usize) -> StateDict {
    let mut sd = StateDict::new();
    for i in 0..depth {
        let mut prune = vec![0.0f32; cands.len()];
        let mut merge = vec![0.0f32; cands.len()];
        prune[(i * 3) % cands.len()] = 2.0;
        merge[(i * 5 + 1) % cands.len()] = 1.5;
        sd.insert(prune_logits_key(i), ArrayD::from_shape_vec(IxDyn(&[cands.len()]), prune).unwrap());
        sd.insert(merge_logits_key(i), ArrayD::from_shape_vec(IxDyn(&[cands.len()]), merge).unwrap());
    }
    sd
}

/// Materializing the same parameters twice leaves the file byte-identical.
#[test]
fn materialization_is_idempotent() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("compression_rate.json");
    std::fs::write(&path, TABLE).unwrap();

    let cands = KeptCandidates::new(197, 4, 1).unwrap();
    let sd = converged_state_dict(&cands, 12);
    let m = Materializer::new(cands, 12);

    let first = m.write_table(&sd, &path, "ViT-B-DeiT", 2.9).unwrap();
    let bytes_a = std::fs::read(&path).unwrap();
    let second = m.write_table(&sd, &path, "ViT-B-DeiT", 2.9).unwrap();
    let bytes_b = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(bytes_a, bytes_b);

    let table = CompressionRateTable::load(&path).unwrap();
    assert_eq!(table.lookup("ViT-B-DeiT", 2.9).unwrap(), first);
    assert!(table.lookup("ViT-B-DeiT", 3.0).is_ok(), "existing entries survive");
}

/// Materialized counts are candidates (or the chain bound) and chain correctly.
#[test]
fn materialized_counts_are_aligned_and_chained() {
    let cands = KeptCandidates::new(197, 8, 1).unwrap();
    let sd = converged_state_dict(&cands, 12);
    let schedule = Materializer::new(cands.clone(), 12).schedule_from_state_dict(&sd).unwrap();
    for (&p, &m) in schedule.prune_kept_num.iter().zip(&schedule.merge_kept_num) {
        assert!(cands.contains(p), "{p} is not a candidate");
        assert!(cands.contains(m), "{m} is not a candidate");
    }
    assert!(schedule.layer_budgets(197).is_ok());
}

/// A fresh table file is created when none exists.
#[test]
fn materialize_into_new_file() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("out").join("compression_rate.json");
    let cands = KeptCandidates::new(65, 4, 1).unwrap();
    let mut sd = StateDict::new();
    for i in 0..2 {
        sd.insert(prune_logits_key(i), ArrayD::zeros(IxDyn(&[cands.len()])));
        sd.insert(merge_logits_key(i), ArrayD::zeros(IxDyn(&[cands.len()])));
    }
    let s = Materializer::new(cands, 2).write_table(&sd, &path, "tiny", 0.5).unwrap();
    assert_eq!(s, Schedule::full(2, 65));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"0.5\""));
    assert!(text.contains("[65, 65]"));
}
