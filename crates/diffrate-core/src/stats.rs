//! Running metric averages and the per-epoch JSON log.
//!
//! Each finished epoch appends one line to `output_dir/log.txt`:
//!
//! ```text
//! {"epoch":3,"n_parameters":2412,"test_loss":1.93,"train_flops":3.02,"train_loss":2.11,...}
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::CheckpointError;

/// Count-weighted running mean of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Average {
    sum: f64,
    count: usize,
    last: f64,
}

impl Average {
    /// Add `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
        self.last = value;
    }

    /// Mean over all updates (0 when empty).
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Most recent value.
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Total sample count.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Named running averages for one phase (train or test) of an epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, Average>,
}

impl MetricLogger {
    /// Empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `name`, weighted by `n` samples.
    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        self.meters.entry(name.to_string()).or_default().update(value, n);
    }

    /// Meter for `name`.
    pub fn get(&self, name: &str) -> Option<&Average> {
        self.meters.get(name)
    }

    /// Epoch means by metric name.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        self.meters.iter().map(|(k, v)| (k.clone(), v.mean())).collect()
    }

    /// Compact `name: last (mean)` rendering for progress lines.
    pub fn render(&self) -> String {
        self.meters
            .iter()
            .map(|(k, v)| format!("{k}: {:.4} ({:.4})", v.last(), v.mean()))
            .collect::<Vec<_>>()
            .join("  ")
    }
}

/// One `log.txt` record.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    /// Epoch index.
    pub epoch: usize,
    /// Trainable parameter count (controller logits).
    pub n_parameters: usize,
    /// Training means, written with a `train_` prefix.
    pub train: BTreeMap<String, f64>,
    /// Evaluation means, written with a `test_` prefix.
    pub test: BTreeMap<String, f64>,
}

impl EpochRecord {
    /// Flattened JSON object.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.train {
            map.insert(format!("train_{k}"), Value::from(*v));
        }
        for (k, v) in &self.test {
            map.insert(format!("test_{k}"), Value::from(*v));
        }
        map.insert("epoch".into(), Value::from(self.epoch));
        map.insert("n_parameters".into(), Value::from(self.n_parameters));
        Value::Object(map)
    }

    /// Append the record as one line to `path`.
    pub fn append_to(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CheckpointError::io(path, e))?;
        writeln!(file, "{}", self.to_json()).map_err(|e| CheckpointError::io(path, e))
    }
}
