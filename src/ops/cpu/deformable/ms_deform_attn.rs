//! CPU implementation of MsDeformAttnOps
//!
//! Reads the inputs as host slices, runs the fused kernels and wraps the
//! results back into tensors on the input's device. The same staging path
//! backs the GPU runtimes until they ship native kernels.

use super::kernels::{fused_backward, fused_forward};
use crate::error::Result;
use crate::ops::impl_generic::deformable::{
    MsDeformAttnDims, check_grad_output, dispatch_float, read_host, write_host,
};
use crate::ops::traits::deformable::{MsDeformAttnOps, SpatialShapes};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

/// Validate everything the accelerated entry point receives.
fn prepare<R: Runtime<DType = DType>>(
    value: &Tensor<R>,
    spatial_shapes: &SpatialShapes,
    level_start_index: &[usize],
    sampling_locations: &Tensor<R>,
    attention_weights: &Tensor<R>,
    im2col_step: usize,
) -> Result<(MsDeformAttnDims, DType, usize)> {
    spatial_shapes.validate_level_start_index(level_start_index)?;
    let (dims, dtype) =
        MsDeformAttnDims::from_inputs(value, spatial_shapes, sampling_locations, attention_weights)?;
    let chunk = dims.im2col_chunk(im2col_step)?;
    Ok((dims, dtype, chunk))
}

/// Fused forward on any runtime, staged through host memory.
pub(crate) fn ms_deform_attn_fwd_host<R: Runtime<DType = DType>>(
    value: &Tensor<R>,
    spatial_shapes: &SpatialShapes,
    level_start_index: &[usize],
    sampling_locations: &Tensor<R>,
    attention_weights: &Tensor<R>,
    im2col_step: usize,
) -> Result<Tensor<R>> {
    let (dims, dtype, chunk) = prepare(
        value,
        spatial_shapes,
        level_start_index,
        sampling_locations,
        attention_weights,
        im2col_step,
    )?;
    tracing::debug!(?dtype, ?dims, chunk, "ms_deform_attn_fwd");

    dispatch_float!(dtype, "ms_deform_attn_fwd", E => {
        let v = read_host::<R, E>(value)?;
        let loc = read_host::<R, E>(sampling_locations)?;
        let w = read_host::<R, E>(attention_weights)?;
        let out = fused_forward::<E>(&dims, spatial_shapes, &v, &loc, &w, chunk);
        write_host::<R, E>(&out, dtype, &dims.output_shape(), value.device())
    })
}

/// Fused backward on any runtime, staged through host memory.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ms_deform_attn_bwd_host<R: Runtime<DType = DType>>(
    grad_output: &Tensor<R>,
    value: &Tensor<R>,
    spatial_shapes: &SpatialShapes,
    level_start_index: &[usize],
    sampling_locations: &Tensor<R>,
    attention_weights: &Tensor<R>,
    im2col_step: usize,
) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)> {
    let (dims, dtype, chunk) = prepare(
        value,
        spatial_shapes,
        level_start_index,
        sampling_locations,
        attention_weights,
        im2col_step,
    )?;
    check_grad_output(grad_output, &dims, dtype)?;
    tracing::debug!(?dtype, ?dims, chunk, "ms_deform_attn_bwd");

    dispatch_float!(dtype, "ms_deform_attn_bwd", E => {
        let g = read_host::<R, E>(grad_output)?;
        let v = read_host::<R, E>(value)?;
        let loc = read_host::<R, E>(sampling_locations)?;
        let w = read_host::<R, E>(attention_weights)?;
        let (gv, gl, gw) = fused_backward::<E>(&dims, spatial_shapes, &g, &v, &loc, &w, chunk);
        let device = value.device();
        Ok((
            write_host::<R, E>(&gv, dtype, &dims.value_shape(), device)?,
            write_host::<R, E>(&gl, dtype, &dims.locations_shape(), device)?,
            write_host::<R, E>(&gw, dtype, &dims.weights_shape(), device)?,
        ))
    })
}

impl MsDeformAttnOps<CpuRuntime> for CpuClient {
    fn ms_deform_attn_fwd(
        &self,
        value: &Tensor<CpuRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<CpuRuntime>,
        attention_weights: &Tensor<CpuRuntime>,
        im2col_step: usize,
    ) -> Result<Tensor<CpuRuntime>> {
        ms_deform_attn_fwd_host(
            value,
            spatial_shapes,
            level_start_index,
            sampling_locations,
            attention_weights,
            im2col_step,
        )
    }

    fn ms_deform_attn_bwd(
        &self,
        grad_output: &Tensor<CpuRuntime>,
        value: &Tensor<CpuRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<CpuRuntime>,
        attention_weights: &Tensor<CpuRuntime>,
        im2col_step: usize,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        ms_deform_attn_bwd_host(
            grad_output,
            value,
            spatial_shapes,
            level_start_index,
            sampling_locations,
            attention_weights,
            im2col_step,
        )
    }
}
