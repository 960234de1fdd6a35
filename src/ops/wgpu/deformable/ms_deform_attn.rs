//! WebGPU implementation of MsDeformAttnOps
//!
//! F32 only (WebGPU limitation). Staged through the host kernels.

use crate::error::{Error, Result};
use crate::ops::cpu::deformable::ms_deform_attn::{ms_deform_attn_bwd_host, ms_deform_attn_fwd_host};
use crate::ops::traits::deformable::{MsDeformAttnOps, SpatialShapes};
use numr::dtype::DType;
use numr::runtime::wgpu::{WgpuClient, WgpuRuntime};
use numr::tensor::Tensor;

fn validate_f32(t: &Tensor<WgpuRuntime>, op: &'static str) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::UnsupportedDType {
            op,
            dtype: t.dtype(),
        });
    }
    Ok(())
}

impl MsDeformAttnOps<WgpuRuntime> for WgpuClient {
    fn ms_deform_attn_fwd(
        &self,
        value: &Tensor<WgpuRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<WgpuRuntime>,
        attention_weights: &Tensor<WgpuRuntime>,
        im2col_step: usize,
    ) -> Result<Tensor<WgpuRuntime>> {
        validate_f32(value, "ms_deform_attn_fwd")?;
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
        grad_output: &Tensor<WgpuRuntime>,
        value: &Tensor<WgpuRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<WgpuRuntime>,
        attention_weights: &Tensor<WgpuRuntime>,
        im2col_step: usize,
    ) -> Result<(Tensor<WgpuRuntime>, Tensor<WgpuRuntime>, Tensor<WgpuRuntime>)> {
        validate_f32(value, "ms_deform_attn_bwd")?;
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
