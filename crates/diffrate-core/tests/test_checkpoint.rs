//! Integration tests for checkpoint persistence and load-time reconciliation.
//!
//! Exercises the resume path without a tensor backend: a checkpoint written
//! for a 1000-class head is reconciled against a 10-class model.

use ndarray::{ArrayD, IxDyn};
use tempfile::tempdir;

use diffrate_core::checkpoint::{Checkpoint, CheckpointManager, LossScalerState, OptimizerState};
use diffrate_core::config::DiffRateConfig;
use diffrate_core::schedule::CosineScheduler;
use diffrate_core::state_dict::{reconcile, ModelShapes, StateDict};

fn tiny_model_state(num_classes: usize, grid: usize) -> StateDict {
    let dim = 8;
    let mut sd = StateDict::new();
    sd.insert("cls_token", ArrayD::from_elem(IxDyn(&[1, 1, dim]), 0.1));
    sd.insert("pos_embed", ArrayD::from_elem(IxDyn(&[1, 1 + grid * grid, dim]), 0.2));
    sd.insert("patch_embed.proj.weight", ArrayD::from_elem(IxDyn(&[dim, 3, 4, 4]), 0.3));
    sd.insert("blocks.0.attn.qkv.weight", ArrayD::from_elem(IxDyn(&[3 * dim, dim]), 0.4));
    sd.insert("blocks.0.prune.logits", ArrayD::from_elem(IxDyn(&[5]), 0.5));
    sd.insert("blocks.0.merge.logits", ArrayD::from_elem(IxDyn(&[5]), 0.6));
    sd.insert("head.weight", ArrayD::from_elem(IxDyn(&[num_classes, dim]), 0.7));
    sd.insert("head.bias", ArrayD::from_elem(IxDyn(&[num_classes]), 0.8));
    sd
}

/// Full training state survives a save/load cycle unchanged.
#[test]
fn training_state_round_trip() {
    let tmp = tempdir().unwrap();
    let model = tiny_model_state(1000, 4);
    let logits = model.filter(|k| k.ends_with(".logits"));
    let mut ckpt = Checkpoint::model_only(4, model, DiffRateConfig::default());
    ckpt.optimizer = Some(OptimizerState { step: 80, lr: 0.004, exp_avg: logits.clone(), exp_avg_sq: logits });
    let mut sched = CosineScheduler::new(0.01, 0.001, 300).with_cycle_decay(0.1);
    sched.step(5);
    ckpt.scheduler = Some(sched);
    ckpt.scaler = Some(LossScalerState { scale: 1024.0, growth_tracker: 7, ..Default::default() });
    ckpt.min_loss = Some(0.75);

    let mgr = CheckpointManager::new(tmp.path());
    let path = mgr.save_latest(&ckpt).unwrap();
    let back = Checkpoint::load(&path).unwrap();
    assert_eq!(back, ckpt);
}

/// Resuming into a model with a different class count drops only the head
/// and continues from the recorded epoch + 1.
#[test]
fn resume_with_changed_head_drops_head_only() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("checkpoint.bin");
    Checkpoint::model_only(6, tiny_model_state(1000, 4), DiffRateConfig::default()).save(&path).unwrap();

    let model_shapes: ModelShapes = tiny_model_state(10, 4).shapes();
    let ckpt = Checkpoint::load(&path).unwrap();
    let start_epoch = ckpt.next_epoch();
    let (loaded, report) = reconcile(ckpt.model, &model_shapes, 1).unwrap();

    assert_eq!(start_epoch, 7);
    assert_eq!(report.dropped, vec!["head.weight", "head.bias"]);
    assert!(report.resized.is_empty());
    assert_eq!(report.missing, vec!["head.bias", "head.weight"]);
    assert_eq!(loaded.len(), model_shapes.len() - 2);
    assert_eq!(loaded.get("blocks.0.prune.logits").unwrap()[[0]], 0.5);
}

/// Finetuning at a higher resolution resamples the position grid.
#[test]
fn finetune_resizes_position_embedding() {
    let ckpt = tiny_model_state(10, 4);
    let model_shapes = tiny_model_state(10, 6).shapes();
    let (loaded, report) = reconcile(ckpt, &model_shapes, 1).unwrap();
    assert_eq!(report.resized, vec!["pos_embed"]);
    assert_eq!(loaded.shape("pos_embed"), Some(&[1, 37, 8][..]));
    assert!(report.missing.is_empty());
}
