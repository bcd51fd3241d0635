//! Conversions between libtorch tensors and the host-side [`StateDict`].

use ndarray::{ArrayD, IxDyn};
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info};

use diffrate_core::state_dict::{reconcile, LoadReport, ModelShapes, StateDict};

use crate::error::{TrainError, TrainResult};
use crate::model::DiffRateModel;

/// Copy `tensor` to the host as an `f32` array of the same shape.
pub fn tensor_to_array(tensor: &Tensor) -> TrainResult<ArrayD<f32>> {
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let host = tensor.detach().to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
    let data = Vec::<f32>::try_from(&host)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| TrainError::training_step(e.to_string()))
}

/// Build a tensor on `device` from `array`.
pub fn array_to_tensor(array: &ArrayD<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape.as_slice()).to_device(device)
}

/// Every variable of `vs`, keyed by its dotted name.
pub fn var_store_state_dict(vs: &nn::VarStore) -> TrainResult<StateDict> {
    vs.variables().iter().map(|(name, t)| Ok((name.clone(), tensor_to_array(t)?))).collect()
}

/// Variable shapes of `vs`.
pub fn var_store_shapes(vs: &nn::VarStore) -> ModelShapes {
    vs.variables()
        .iter()
        .map(|(name, t)| (name.clone(), t.size().iter().map(|&d| d as usize).collect()))
        .collect()
}

/// Copy the entries of `state_dict` that name a variable of `vs`.
///
/// Returns the number of variables written.
///
/// # Errors
///
/// [`TrainError::ShapeMismatch`] when an entry's shape differs from its variable.
pub fn load_into(vs: &nn::VarStore, state_dict: &StateDict) -> TrainResult<usize> {
    let device = vs.device();
    let mut loaded = 0;
    for (name, mut var) in vs.variables() {
        let Some(array) = state_dict.get(&name) else { continue };
        let src = array_to_tensor(array, device).to_kind(var.kind());
        if src.size() != var.size() {
            return Err(TrainError::shape_mismatch(name, var.size(), src.size()));
        }
        tch::no_grad(|| var.copy_(&src));
        loaded += 1;
    }
    Ok(loaded)
}

impl DiffRateModel {
    /// Backbone and controller parameters in one state dict.
    pub fn state_dict(&self) -> TrainResult<StateDict> {
        let mut sd = var_store_state_dict(&self.model_vs)?;
        for (name, array) in var_store_state_dict(&self.arch_vs)?.iter() {
            sd.insert(name, array.clone());
        }
        Ok(sd)
    }

    /// Shapes of every backbone and controller parameter.
    pub fn shapes(&self) -> ModelShapes {
        let mut shapes = var_store_shapes(&self.model_vs);
        shapes.extend(var_store_shapes(&self.arch_vs));
        shapes
    }

    /// Non-strict load: head and position-embedding mismatches are
    /// reconciled, missing and unexpected keys are reported.
    pub fn load_state_dict(&mut self, checkpoint: StateDict) -> TrainResult<LoadReport> {
        let (sd, report) = reconcile(checkpoint, &self.shapes(), self.spec().num_prefix_tokens)?;
        let backbone = load_into(&self.model_vs, &sd)?;
        let controllers = load_into(&self.arch_vs, &sd)?;
        info!("loaded {backbone} backbone and {controllers} controller tensors");
        if !report.unexpected.is_empty() {
            debug!("unexpected keys: {:?}", report.unexpected);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn tensor_array_conversion_keeps_layout() {
        let a = Array::from_shape_fn(IxDyn(&[2, 3]), |ix| (ix[0] * 3 + ix[1]) as f32);
        let t = array_to_tensor(&a, Device::Cpu);
        assert_eq!(t.size(), vec![2, 3]);
        assert_eq!(t.double_value(&[1, 2]), 5.0);
        assert_eq!(tensor_to_array(&t).unwrap(), a);
    }

    #[test]
    fn scalar_tensor_becomes_zero_dim_array() {
        let t = Tensor::scalar_tensor(1.5, (Kind::Float, Device::Cpu));
        let a = tensor_to_array(&t).unwrap();
        assert_eq!(a.ndim(), 0);
        assert_eq!(a.iter().next().copied(), Some(1.5));
    }

    #[test]
    fn load_into_rejects_wrong_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().zeros("w", &[2, 2]);
        let mut sd = StateDict::new();
        sd.insert("w", ArrayD::ones(IxDyn(&[2, 2])));
        assert_eq!(load_into(&vs, &sd).unwrap(), 1);
        assert_eq!(vs.variables()["w"].sum(Kind::Float).double_value(&[]), 4.0);

        sd.insert("w", ArrayD::ones(IxDyn(&[3])));
        assert!(matches!(load_into(&vs, &sd), Err(TrainError::ShapeMismatch { .. })));
    }
}
