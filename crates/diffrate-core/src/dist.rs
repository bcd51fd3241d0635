//! Replica identity and gradient synchronisation.
//!
//! Process bootstrapping and the collective backend are external. A run
//! learns its place in the job from the launcher's environment variables and
//! reduces controller gradients through a [`GradientSync`] implementation.

use tracing::info;

use crate::error::{ConfigError, DiffRateResult};

/// Position of this process in a data-parallel job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistContext {
    /// Global rank.
    pub rank: usize,
    /// Number of replicas.
    pub world_size: usize,
    /// Rank on this host (selects the device).
    pub local_rank: usize,
}

impl Default for DistContext {
    fn default() -> Self {
        DistContext { rank: 0, world_size: 1, local_rank: 0 }
    }
}

impl DistContext {
    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_RANK`.
    ///
    /// Absent variables mean a single-process run.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for unparsable values or a rank outside
    /// the world.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &'static str, default: usize| -> Result<usize, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::invalid_value(key, format!("`{v}` is not a non-negative integer"))),
            }
        };
        let ctx = DistContext { rank: read("RANK", 0)?, world_size: read("WORLD_SIZE", 1)?, local_rank: read("LOCAL_RANK", 0)? };
        if ctx.world_size == 0 {
            return Err(ConfigError::invalid_value("WORLD_SIZE", "must be >= 1"));
        }
        if ctx.rank >= ctx.world_size {
            return Err(ConfigError::invalid_value(
                "RANK",
                format!("rank {} is outside a world of {}", ctx.rank, ctx.world_size),
            ));
        }
        if ctx.world_size > 1 {
            info!("distributed replica {}/{} (local rank {})", ctx.rank, ctx.world_size, ctx.local_rank);
        }
        Ok(ctx)
    }

    /// Whether this replica writes shared outputs (best checkpoint, `log.txt`).
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Whether more than one replica participates.
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// Collective reductions used by the training loop.
pub trait GradientSync: Send + Sync {
    /// Replace `values` with their mean across replicas.
    fn all_reduce_mean(&self, values: &mut [f32]) -> DiffRateResult<()>;

    /// Mean of `value` across replicas.
    fn mean_scalar(&self, value: f64) -> DiffRateResult<f64>;

    /// Block until every replica arrives.
    fn barrier(&self) -> DiffRateResult<()> {
        Ok(())
    }
}

/// Single-process synchronisation: every reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl LocalSync {
    /// Synchroniser for `ctx`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when `ctx` spans more than one replica;
    /// such a job needs a collective backend.
    pub fn for_context(ctx: &DistContext) -> Result<Self, ConfigError> {
        if ctx.is_distributed() {
            return Err(ConfigError::invalid_value(
                "WORLD_SIZE",
                format!("{} replicas requested but no collective backend is available", ctx.world_size),
            ));
        }
        Ok(LocalSync)
    }
}

impl GradientSync for LocalSync {
    fn all_reduce_mean(&self, _values: &mut [f32]) -> DiffRateResult<()> {
        Ok(())
    }

    fn mean_scalar(&self, value: f64) -> DiffRateResult<f64> {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_environment_is_single_process() {
        let ctx = DistContext::from_lookup(env(&[])).unwrap();
        assert_eq!(ctx, DistContext::default());
        assert!(ctx.is_main());
        assert!(LocalSync::for_context(&ctx).is_ok());
    }

    #[test]
    fn multi_replica_needs_a_backend() {
        let ctx = DistContext::from_lookup(env(&[("RANK", "1"), ("WORLD_SIZE", "4"), ("LOCAL_RANK", "1")])).unwrap();
        assert!(!ctx.is_main());
        assert!(LocalSync::for_context(&ctx).is_err());
    }

    #[test]
    fn bad_values_rejected() {
        assert!(DistContext::from_lookup(env(&[("WORLD_SIZE", "two")])).is_err());
        assert!(DistContext::from_lookup(env(&[("RANK", "2"), ("WORLD_SIZE", "2")])).is_err());
    }

    #[test]
    fn local_sync_is_identity() {
        let mut v = [1.0f32, -2.0];
        LocalSync.all_reduce_mean(&mut v).unwrap();
        assert_eq!(v, [1.0, -2.0]);
        assert_eq!(LocalSync.mean_scalar(3.5).unwrap(), 3.5);
    }
}
