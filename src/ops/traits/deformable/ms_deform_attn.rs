//! Multi-scale deformable attention traits
//!
//! Each query samples `P` points per pyramid level per head, bilinearly
//! interpolates the value grid at those points and sums the samples with
//! per-point attention weights:
//!
//! ```text
//! out[n, q, m·D + d] = Σ_l Σ_p  w[n, q, m, l, p] · bilinear(V_l[n, :, :, m, d], G[n, q, m, l, p])
//! ```
//!
//! Used by Deformable-DETR style encoders and decoders.

use super::SpatialShapes;
use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Multi-scale deformable attention kernels.
///
/// A PRIMITIVE op: each backend supplies its own fused kernel. The generic
/// reference in `impl_generic::deformable` is the correctness oracle every
/// implementation must agree with.
///
/// # Layout contract
///
/// - `value`: `[N, S, M, D]` with `S = spatial_shapes.total_positions()`
/// - `level_start_index`: must equal `spatial_shapes.level_start_index()`
/// - `sampling_locations`: `[N, Q, M, L, P, 2]`, normalized `(x, y)`; values
///   outside `[0, 1]` read zero padding
/// - `attention_weights`: `[N, Q, M, L, P]`, used as given (never renormalized)
/// - Output: `[N, Q, M·D]`
///
/// # im2col step
///
/// The batch is processed in chunks of `min(N, im2col_step)` elements; `N`
/// must be divisible by the effective step. The step only affects scheduling,
/// never the result.
#[allow(clippy::too_many_arguments)]
pub trait MsDeformAttnOps<R: Runtime> {
    /// Forward pass. Computes in the input dtype (F64, F32 or F16) and
    /// returns it.
    fn ms_deform_attn_fwd(
        &self,
        value: &Tensor<R>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<R>,
        attention_weights: &Tensor<R>,
        im2col_step: usize,
    ) -> Result<Tensor<R>>;

    /// Backward pass.
    ///
    /// `grad_output` is `[N, Q, M·D]`. Returns
    /// `(grad_value, grad_sampling_locations, grad_attention_weights)`, each
    /// shaped like the corresponding forward input.
    fn ms_deform_attn_bwd(
        &self,
        grad_output: &Tensor<R>,
        value: &Tensor<R>,
        spatial_shapes: &SpatialShapes,
        level_start_index: &[usize],
        sampling_locations: &Tensor<R>,
        attention_weights: &Tensor<R>,
        im2col_step: usize,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>;
}
