//! Discretize converged controller parameters into a fixed schedule.
//!
//! ```text
//! blocks.{i}.prune.logits ──argmax──► candidate ──snap(≤ tokens_in)──► prune_kept_num[i]
//! blocks.{i}.merge.logits ──argmax──► candidate ──snap(≤ prune)─────► merge_kept_num[i]
//!                                                     tokens_in[i+1] = merge_kept_num[i]
//! ```
//!
//! The result is deterministic in the logits, so materializing the same
//! parameters twice writes byte-identical table entries.

use std::path::Path;
use tracing::info;

use crate::budget::{KeptCandidates, Schedule};
use crate::checkpoint::Checkpoint;
use crate::config::DiffRateConfig;
use crate::error::{ConfigError, DiffRateResult, StateDictError};
use crate::rate_table::{flops_key, CompressionRateTable};
use crate::registry::ModelRegistry;
use crate::state_dict::StateDict;

/// State-dict key of block `block`'s pruning logits.
pub fn prune_logits_key(block: usize) -> String {
    format!("blocks.{block}.prune.logits")
}

/// State-dict key of block `block`'s merging logits.
pub fn merge_logits_key(block: usize) -> String {
    format!("blocks.{block}.merge.logits")
}

/// Turns controller logits into integer kept counts.
#[derive(Debug, Clone)]
pub struct Materializer {
    candidates: KeptCandidates,
    depth: usize,
}

impl Materializer {
    /// Materializer for `depth` blocks sharing `candidates`.
    pub fn new(candidates: KeptCandidates, depth: usize) -> Self {
        Materializer { candidates, depth }
    }

    /// Candidate set in use.
    pub fn candidates(&self) -> &KeptCandidates {
        &self.candidates
    }

    /// Hard schedule from per-block `(prune, merge)` logit vectors.
    pub fn schedule_from_logits(&self, logits: &[(Vec<f32>, Vec<f32>)]) -> Schedule {
        let mut tokens_in = self.candidates.max_tokens();
        let mut schedule = Schedule { prune_kept_num: Vec::with_capacity(logits.len()), merge_kept_num: Vec::new() };
        for (prune_logits, merge_logits) in logits {
            let prune = self.candidates.hard_count(prune_logits, tokens_in);
            let merge = self.candidates.hard_count(merge_logits, prune);
            schedule.prune_kept_num.push(prune);
            schedule.merge_kept_num.push(merge);
            tokens_in = merge;
        }
        schedule
    }

    /// Hard schedule from the controller entries of `state_dict`.
    ///
    /// # Errors
    ///
    /// [`StateDictError::MissingKey`] when a block's logits are absent and
    /// [`StateDictError::InvalidTensor`] when their length differs from the
    /// candidate count.
    pub fn schedule_from_state_dict(&self, state_dict: &StateDict) -> Result<Schedule, StateDictError> {
        let fetch = |key: String| -> Result<Vec<f32>, StateDictError> {
            let t = state_dict.get(&key).ok_or_else(|| StateDictError::MissingKey(key.clone()))?;
            if t.len() != self.candidates.len() {
                return Err(StateDictError::invalid(
                    key,
                    format!("{} logits for {} candidates", t.len(), self.candidates.len()),
                ));
            }
            Ok(t.iter().copied().collect())
        };
        let logits = (0..self.depth)
            .map(|i| Ok((fetch(prune_logits_key(i))?, fetch(merge_logits_key(i))?)))
            .collect::<Result<Vec<_>, StateDictError>>()?;
        Ok(self.schedule_from_logits(&logits))
    }

    /// Materialize `state_dict` and upsert the schedule into the table at
    /// `table_path` under `(model, target_flops)`.
    pub fn write_table(
        &self,
        state_dict: &StateDict,
        table_path: &Path,
        model: &str,
        target_flops: f64,
    ) -> DiffRateResult<Schedule> {
        let schedule = self.schedule_from_state_dict(state_dict)?;
        schedule.layer_budgets(self.candidates.max_tokens())?;
        let mut table = CompressionRateTable::load_or_default(table_path)?;
        if table.upsert(model, target_flops, &schedule) {
            table.save(table_path)?;
            info!("wrote compression schedule for {model} @ {target_flops}G to {}", table_path.display());
        } else {
            info!("compression schedule for {model} @ {target_flops}G unchanged");
        }
        Ok(schedule)
    }
}

/// Write the schedule stored in `checkpoint` into `config`'s rate table.
///
/// The entry is keyed by the model and target of the run that produced the
/// checkpoint; `config` may only point at a different table.
///
/// # Errors
///
/// [`ConfigError::InvalidValue`] when `config` names another model or
/// target than the checkpoint's snapshot, plus any registry, budget or table
/// failure.
pub fn materialize_checkpoint(
    checkpoint: &Checkpoint,
    config: &DiffRateConfig,
    registry: &ModelRegistry,
) -> DiffRateResult<Schedule> {
    let snapshot = &checkpoint.config;
    if config.model != snapshot.model {
        return Err(ConfigError::invalid_value(
            "model",
            format!("checkpoint was searched for {}, not {}", snapshot.model, config.model),
        )
        .into());
    }
    if flops_key(config.target_flops) != flops_key(snapshot.target_flops) {
        return Err(ConfigError::invalid_value(
            "target_flops",
            format!("checkpoint was searched for {}G, not {}G", snapshot.target_flops, config.target_flops),
        )
        .into());
    }

    let spec = registry.get(&snapshot.model)?.clone().with_img_size(snapshot.input_size);
    let candidates = snapshot.global_budget()?.candidates(spec.num_tokens())?;
    let materializer = Materializer::new(candidates, spec.depth);
    let schedule = materializer.write_table(
        &checkpoint.model,
        &config.compression_rate_path,
        &spec.display_name,
        snapshot.target_flops,
    )?;
    info!("{} @ {}G from epoch {}", spec.display_name, snapshot.target_flops, checkpoint.epoch);
    Ok(schedule)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
