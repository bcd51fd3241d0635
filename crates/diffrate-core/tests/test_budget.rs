//! Property tests for kept-count candidates and schedule chaining.

use proptest::prelude::*;

use diffrate_core::budget::{KeptCandidates, Schedule};
use diffrate_core::flops::FlopsModel;
use diffrate_core::materialize::Materializer;
use diffrate_core::registry::ModelRegistry;

proptest! {
    /// Every candidate is the maximum, a multiple of the granularity, or the
    /// declared minimum; zero never appears.
    #[test]
    fn candidates_are_aligned(max in 1usize..400, g in 1usize..32, min_kept in 0usize..64) {
        let c = KeptCandidates::new(max, g, min_kept).unwrap();
        prop_assert_eq!(c.values()[0], max);
        for &v in c.values() {
            prop_assert!(v > 0);
            prop_assert!(v == max || v % g == 0 || v == min_kept.max(1));
            prop_assert!(v >= min_kept.clamp(1, max));
        }
        prop_assert!(c.values().windows(2).all(|w| w[0] > w[1]));
    }

    /// Materialized schedules satisfy the chain invariant for any logits.
    #[test]
    fn materialized_chain_holds(
        max in 2usize..260,
        g in 1usize..16,
        raw in proptest::collection::vec(proptest::collection::vec(-5.0f32..5.0, 64), 2..12),
    ) {
        let cands = KeptCandidates::new(max, g, 1).unwrap();
        let logits: Vec<(Vec<f32>, Vec<f32>)> = raw
            .chunks(2)
            .filter(|p| p.len() == 2)
            .map(|p| (p[0][..cands.len().min(64)].to_vec(), p[1][..cands.len().min(64)].to_vec()))
            .collect();
        let schedule = Materializer::new(cands, logits.len()).schedule_from_logits(&logits);
        prop_assert!(schedule.layer_budgets(max).is_ok());
    }

    /// Snapping never exceeds either the value or the bound.
    #[test]
    fn snap_down_is_bounded(max in 1usize..300, g in 1usize..20, value in 0usize..300, bound in 1usize..300) {
        let c = KeptCandidates::new(max, g, 1).unwrap();
        let s = c.snap_down(value.max(1), bound);
        prop_assert!(s <= bound && s <= value.max(1));
    }
}

/// Compressing never costs more than the uncompressed model.
#[test]
fn compressed_schedule_is_cheaper() {
    let spec = ModelRegistry::with_defaults().get("vit_deit_small_patch16_224").unwrap().clone();
    let flops = FlopsModel::new(&spec, 1000);
    let full = Schedule::full(spec.depth, spec.num_tokens());
    let half = Schedule { prune_kept_num: vec![120; spec.depth], merge_kept_num: vec![100; spec.depth] };
    let cost = |s: &Schedule| flops.schedule_gflops(&s.layer_budgets(spec.num_tokens()).unwrap());
    assert!(cost(&half) < cost(&full));
    assert!(cost(&full) > 4.0 && cost(&full) < 5.0, "DeiT-S is about 4.6 GFLOPs");
}
