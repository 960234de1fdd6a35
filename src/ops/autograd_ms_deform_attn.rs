//! Autograd integration for multi-scale deformable attention
//!
//! Wraps MsDeformAttnOps (Tensor-level) into a Var-level operation so the
//! sampler participates in numr's autograd graph.

use crate::error::Result;
use crate::ops::traits::deformable::{MsDeformAttnOps, SpatialShapes};
use numr::autograd::{GradFn, TensorId, Var};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::sync::Arc;

/// Configuration saved from forward pass for backward.
struct MsDeformAttnConfig {
    spatial_shapes: SpatialShapes,
    level_start_index: Vec<usize>,
    im2col_step: usize,
}

/// Backward function for multi-scale deformable attention.
///
/// Saved state: value, sampling locations and attention weights.
struct MsDeformAttnBackward<R: Runtime> {
    input_ids: [TensorId; 3],      // value, sampling_locations, attention_weights
    saved_tensors: Vec<Tensor<R>>, // [value, sampling_locations, attention_weights]
    input_grad_fns: [Option<Arc<dyn GradFn<R>>>; 3],
    config: MsDeformAttnConfig,
}

impl<R: Runtime> GradFn<R> for MsDeformAttnBackward<R>
where
    R::Client: MsDeformAttnOps<R>,
{
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        let client = R::default_client(grad_output.device());
        let cfg = &self.config;

        let (grad_value, grad_locations, grad_weights) = client
            .ms_deform_attn_bwd(
                &grad_output.contiguous(),
                &self.saved_tensors[0],
                &cfg.spatial_shapes,
                &cfg.level_start_index,
                &self.saved_tensors[1],
                &self.saved_tensors[2],
                cfg.im2col_step,
            )
            .map_err(|e| numr::error::Error::Internal(format!("ms_deform_attn_bwd failed: {}", e)))?;

        Ok(vec![
            Some(grad_value),
            Some(grad_locations),
            Some(grad_weights),
        ])
    }

    fn backward_var(&self, grad_output: &Var<R>) -> numr::error::Result<Vec<Option<Var<R>>>> {
        // First-order only
        let grads = self.backward(grad_output.tensor())?;
        Ok(grads
            .into_iter()
            .map(|g| g.map(|t| Var::new(t, false)))
            .collect())
    }

    fn inputs(&self) -> &[TensorId] {
        &self.input_ids
    }

    fn input_grad_fns(&self) -> Vec<Option<Arc<dyn GradFn<R>>>> {
        self.input_grad_fns.to_vec()
    }

    fn saved_tensors(&self) -> &[Tensor<R>] {
        &self.saved_tensors
    }

    fn name(&self) -> &'static str {
        "MsDeformAttnBackward"
    }
}

/// Multi-scale deformable attention forward with autograd tracking.
///
/// Wraps `MsDeformAttnOps::ms_deform_attn_fwd` into a `Var`-level operation.
/// When any of value, sampling locations or attention weights requires grad,
/// the backward pass is registered and yields gradients for all three.
pub fn var_ms_deform_attn<R>(
    value: &Var<R>,
    spatial_shapes: &SpatialShapes,
    level_start_index: &[usize],
    sampling_locations: &Var<R>,
    attention_weights: &Var<R>,
    im2col_step: usize,
) -> Result<Var<R>>
where
    R: Runtime,
    R::Client: MsDeformAttnOps<R>,
{
    let client = R::default_client(value.tensor().device());

    // Inputs often arrive as views (permute/reshape); the kernels read dense memory
    let v = value.tensor().contiguous();
    let loc = sampling_locations.tensor().contiguous();
    let w = attention_weights.tensor().contiguous();

    let output = client.ms_deform_attn_fwd(
        &v,
        spatial_shapes,
        level_start_index,
        &loc,
        &w,
        im2col_step,
    )?;

    if value.requires_grad()
        || sampling_locations.requires_grad()
        || attention_weights.requires_grad()
    {
        let grad_fn = MsDeformAttnBackward {
            input_ids: [value.id(), sampling_locations.id(), attention_weights.id()],
            saved_tensors: vec![v, loc, w],
            input_grad_fns: [
                value.grad_fn().cloned(),
                sampling_locations.grad_fn().cloned(),
                attention_weights.grad_fn().cloned(),
            ],
            config: MsDeformAttnConfig {
                spatial_shapes: spatial_shapes.clone(),
                level_start_index: level_start_index.to_vec(),
                im2col_step,
            },
        };
        Ok(Var::from_op(output, Arc::new(grad_fn)))
    } else {
        Ok(Var::new(output, false))
    }
}
