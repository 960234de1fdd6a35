//! Fused host kernels for multi-scale deformable attention.
//!
//! Forward: one pass per output row, sampling and weighting on the fly (no
//! staging buffer), rows of an im2col chunk processed in parallel.
//!
//! Backward: each batch element owns a disjoint slice of every gradient, so
//! batch elements run in parallel while the scatter into `grad_value` stays
//! sequential inside one element. Results are deterministic.

use super::sampling::{BilinearTap, pixel_coord};
use crate::ops::impl_generic::deformable::{KernelFloat, MsDeformAttnDims};
use crate::ops::traits::deformable::SpatialShapes;
use rayon::prelude::*;

/// `(height, width, offset)` per level.
fn level_table(spatial_shapes: &SpatialShapes) -> Vec<(usize, usize, usize)> {
    spatial_shapes
        .iter()
        .zip(spatial_shapes.level_start_index())
        .map(|((h, w), offset)| (h, w, offset))
        .collect()
}

/// Fused forward. `chunk` is the effective im2col step (divides `dims.batch`).
pub fn fused_forward<T: KernelFloat>(
    dims: &MsDeformAttnDims,
    spatial_shapes: &SpatialShapes,
    value: &[T],
    sampling_locations: &[T],
    attention_weights: &[T],
    chunk: usize,
) -> Vec<T> {
    let levels = level_table(spatial_shapes);
    let row_len = dims.output_row();
    let d_len = dims.head_dim;
    let np = dims.num_points;
    let mut output = vec![T::ZERO; dims.batch * dims.num_query * row_len];
    if output.is_empty() {
        return output;
    }

    for (c, out_chunk) in output
        .chunks_mut(chunk * dims.num_query * row_len)
        .enumerate()
    {
        let n0 = c * chunk;
        out_chunk
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(i, out_row)| {
                let n = n0 + i / dims.num_query;
                let q = i % dims.num_query;
                for m in 0..dims.num_heads {
                    let out_head = &mut out_row[m * d_len..(m + 1) * d_len];
                    let w_at = dims.weight_index(n, q, m);
                    let loc_at = dims.location_index(n, q, m);
                    for (l, &(height, width, offset)) in levels.iter().enumerate() {
                        let row = |cell: usize| dims.value_index(n, offset + cell, m);
                        for p in 0..np {
                            let k = l * np + p;
                            let wk = attention_weights[w_at + k];
                            let px = pixel_coord(sampling_locations[loc_at + 2 * k], width);
                            let py = pixel_coord(sampling_locations[loc_at + 2 * k + 1], height);
                            // Entirely off-grid taps contribute nothing
                            let Some(tap) = BilinearTap::locate(px, py, height, width) else {
                                continue;
                            };
                            for (d, acc) in out_head.iter_mut().enumerate() {
                                *acc = *acc + wk * tap.sample(value, row, d);
                            }
                        }
                    }
                }
            });
    }
    output
}

/// Fused backward. Returns `(grad_value, grad_sampling_locations, grad_attention_weights)`.
#[allow(clippy::type_complexity)]
pub fn fused_backward<T: KernelFloat>(
    dims: &MsDeformAttnDims,
    spatial_shapes: &SpatialShapes,
    grad_output: &[T],
    value: &[T],
    sampling_locations: &[T],
    attention_weights: &[T],
    chunk: usize,
) -> (Vec<T>, Vec<T>, Vec<T>) {
    let levels = level_table(spatial_shapes);
    let value_stride = dims.value_batch_stride();
    let weight_stride = dims.num_query * dims.num_heads * dims.points_per_head();
    let loc_stride = weight_stride * 2;

    let mut grad_value = vec![T::ZERO; value.len()];
    let mut grad_locations = vec![T::ZERO; sampling_locations.len()];
    let mut grad_weights = vec![T::ZERO; attention_weights.len()];
    if value_stride == 0 || weight_stride == 0 {
        return (grad_value, grad_locations, grad_weights);
    }

    let chunks = grad_value
        .chunks_mut(chunk * value_stride)
        .zip(grad_locations.chunks_mut(chunk * loc_stride))
        .zip(grad_weights.chunks_mut(chunk * weight_stride));

    for (c, ((gv_chunk, gl_chunk), gw_chunk)) in chunks.enumerate() {
        let n0 = c * chunk;
        gv_chunk
            .par_chunks_mut(value_stride)
            .zip(gl_chunk.par_chunks_mut(loc_stride))
            .zip(gw_chunk.par_chunks_mut(weight_stride))
            .enumerate()
            .for_each(|(i, ((gv, gl), gw))| {
                backward_batch_element(
                    dims,
                    &levels,
                    n0 + i,
                    grad_output,
                    value,
                    sampling_locations,
                    attention_weights,
                    gv,
                    gl,
                    gw,
                );
            });
    }

    (grad_value, grad_locations, grad_weights)
}

/// Backward for batch element `n`; `gv`, `gl`, `gw` are that element's gradient slices.
#[allow(clippy::too_many_arguments)]
fn backward_batch_element<T: KernelFloat>(
    dims: &MsDeformAttnDims,
    levels: &[(usize, usize, usize)],
    n: usize,
    grad_output: &[T],
    value: &[T],
    sampling_locations: &[T],
    attention_weights: &[T],
    gv: &mut [T],
    gl: &mut [T],
    gw: &mut [T],
) {
    let np = dims.num_points;
    let d_len = dims.head_dim;
    let value_base = n * dims.value_batch_stride();
    let weight_base = dims.weight_index(n, 0, 0);
    let loc_base = dims.location_index(n, 0, 0);

    for q in 0..dims.num_query {
        for m in 0..dims.num_heads {
            let g = &grad_output[dims.output_index(n, q, m)..][..d_len];
            let w_at = dims.weight_index(n, q, m);
            let loc_at = dims.location_index(n, q, m);
            for (l, &(height, width, offset)) in levels.iter().enumerate() {
                let row = |cell: usize| dims.value_index(n, offset + cell, m);
                for p in 0..np {
                    let k = l * np + p;
                    let wk = attention_weights[w_at + k];
                    let px = pixel_coord(sampling_locations[loc_at + 2 * k], width);
                    let py = pixel_coord(sampling_locations[loc_at + 2 * k + 1], height);
                    let Some(tap) = BilinearTap::locate(px, py, height, width) else {
                        continue;
                    };

                    let mut grad_w = T::ZERO;
                    let mut gx = T::ZERO;
                    let mut gy = T::ZERO;
                    for (d, &gd) in g.iter().enumerate() {
                        grad_w = grad_w + gd * tap.sample(value, row, d);
                        let (sx, sy) = tap.sample_grad(value, row, d);
                        gx = gx + gd * sx;
                        gy = gy + gd * sy;

                        let wg = wk * gd;
                        for (cell, cw) in tap.cells.iter().zip(tap.weights.iter()) {
                            if let Some(cell) = cell {
                                let at = row(*cell) - value_base + d;
                                gv[at] = gv[at] + *cw * wg;
                            }
                        }
                    }

                    gw[w_at - weight_base + k] = grad_w;
                    // d pixel / d location = size
                    let at = loc_at - loc_base + 2 * k;
                    gl[at] = wk * gx * T::from_usize(width);
                    gl[at + 1] = wk * gy * T::from_usize(height);
                }
            }
        }
    }
}
