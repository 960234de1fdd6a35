//! CUDA implementation of MsDeformAttnOps
//!
//! No native kernel yet: inputs are copied to the host, run through the
//! fused CPU kernels, and the results uploaded back to the input's device.

use crate::error::Result;
use crate::ops::cpu::deformable::ms_deform_attn::{ms_deform_attn_bwd_host, ms_deform_attn_fwd_host};
use crate::ops::traits::deformable::{MsDeformAttnOps, SpatialShapes};
use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::tensor::Tensor;

impl MsDeformAttnOps<CudaRuntime> for CudaClient {
    fn ms_deform_attn_fwd(
        &self,
        value: &Tensor<CudaRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<CudaRuntime>,
        attention_weights: &Tensor<CudaRuntime>,
        im2col_step: usize,
    ) -> Result<Tensor<CudaRuntime>> {
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
        grad_output: &Tensor<CudaRuntime>,
        value: &Tensor<CudaRuntime>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<CudaRuntime>,
        attention_weights: &Tensor<CudaRuntime>,
        im2col_step: usize,
    ) -> Result<(Tensor<CudaRuntime>, Tensor<CudaRuntime>, Tensor<CudaRuntime>)> {
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
