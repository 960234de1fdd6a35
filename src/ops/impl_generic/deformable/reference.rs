//! Reference multi-scale deformable attention.
//!
//! THE algorithm, composed from numr autograd primitives and nothing else:
//! every `(level, point)` tap maps its normalized location to a pixel
//! coordinate, splits it into four corner weights, picks each corner's
//! feature vector with a one-hot mask over the level's cells and reduces the
//! weighted samples. Backends are checked against this implementation; it is
//! not meant to be fast.
//!
//! The backward pass is numr's autograd run over the same graph, so neither
//! direction shares code with the fused kernels.
//!
//! Rounding follows the fused kernels operation for operation (pixel mapping,
//! corner weights, north-west → south-east corner sum, `(level, point)` tap
//! order), so on identical inputs the two agree bit for bit.

use super::layout::MsDeformAttnDims;
use crate::error::{Error, Result};
use crate::ops::traits::deformable::SpatialShapes;
use numr::autograd::{
    Var, backward, var_add, var_add_scalar, var_mul, var_mul_scalar, var_narrow, var_permute,
    var_reshape, var_sub, var_sum,
};
use numr::dtype::DType;
use numr::ops::{CompareOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// `(dx, dy)` of the corners relative to the floor cell, north-west first.
const CORNERS: [(f64, f64); 4] = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)];

/// Dense copy of `x` that stays on the autograd graph.
fn dense<R, C>(client: &C, x: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R>,
    R::Client: TensorOps<R>,
{
    let zero = Var::new(
        Tensor::<R>::zeros(x.shape(), x.tensor().dtype(), x.tensor().device()),
        false,
    );
    var_add(x, &zero, client).map_err(Error::Numr)
}

/// `x[.., i, j, ..]` for two consecutive axes starting at `dim`, densified
/// and reshaped to `shape`.
fn pick<R, C>(
    client: &C,
    x: &Var<R>,
    dim: isize,
    i: usize,
    j: usize,
    shape: &[usize],
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R>,
    R::Client: TensorOps<R>,
{
    let v = var_narrow(x, dim, i, 1).map_err(Error::Numr)?;
    let v = var_narrow(&v, dim + 1, j, 1).map_err(Error::Numr)?;
    let v = dense(client, &v)?;
    var_reshape(&v, shape).map_err(Error::Numr)
}

/// Normalized coordinate `c` to pixel space of an axis with `size` cells:
/// grid `g = 2c − 1`, then `((g + 1)·size − 1) / 2`.
fn to_pixel<R, C>(client: &C, c: &Var<R>, size: usize) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ScalarOps<R>,
    R::Client: ScalarOps<R>,
{
    let g = var_mul_scalar(c, 2.0, client).map_err(Error::Numr)?;
    let g = var_add_scalar(&g, -1.0, client).map_err(Error::Numr)?;
    let p = var_add_scalar(&g, 1.0, client).map_err(Error::Numr)?;
    let p = var_mul_scalar(&p, size as f64, client).map_err(Error::Numr)?;
    let p = var_add_scalar(&p, -1.0, client).map_err(Error::Numr)?;
    var_mul_scalar(&p, 0.5, client).map_err(Error::Numr)
}

/// Linear interpolation weights along one axis: `(toward floor, toward floor + 1)`.
///
/// The floor is a constant of the graph; gradients flow through `p` only.
fn axis_weights<R, C>(client: &C, p: &Var<R>) -> Result<(Var<R>, Var<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R>,
    R::Client: TensorOps<R>,
{
    let floor = client.floor(p.tensor())?;
    let next = client.add_scalar(&floor, 1.0)?;
    let toward_next = var_sub(p, &Var::new(floor.clone(), false), client).map_err(Error::Numr)?;
    let toward_floor = var_sub(&Var::new(next, false), p, client).map_err(Error::Numr)?;
    Ok((toward_floor, toward_next, floor))
}

/// One-hot selector `[.., cells, 1]` of the corner at `floor + offset`, all
/// zero when that corner lies outside the `height × width` grid.
///
/// Cell arithmetic runs in f64 so indices stay exact for any level size and
/// any value dtype.
#[allow(clippy::too_many_arguments)]
fn corner_selector<R, C>(
    client: &C,
    x_floor: &Tensor<R>,
    y_floor: &Tensor<R>,
    (dx, dy): (f64, f64),
    (height, width): (usize, usize),
    cells: &Tensor<R>,
    shape: &[usize],
    dtype: DType,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + CompareOps<R>,
{
    let xi = client.add_scalar(&client.cast(x_floor, DType::F64)?, dx)?;
    let yi = client.add_scalar(&client.cast(y_floor, DType::F64)?, dy)?;
    let cx = client.clamp(&xi, 0.0, width as f64 - 1.0)?;
    let cy = client.clamp(&yi, 0.0, height as f64 - 1.0)?;
    let inside = client.mul(&client.eq(&cx, &xi)?, &client.eq(&cy, &yi)?)?;

    // inside ? y·W + x : −1
    let flat = client.add(&client.mul_scalar(&cy, width as f64)?, &cx)?;
    let flat = client.mul(&inside, &client.add_scalar(&flat, 1.0)?)?;
    let flat = client.add_scalar(&flat, -1.0)?.reshape(shape)?;

    let onehot = client.eq(&flat, cells)?;
    Ok(client.cast(&onehot, dtype)?)
}

/// Multi-scale deformable attention as a graph of numr autograd ops.
///
/// - `value`: `[N, S, M, D]`, `S = Σ H_l·W_l`
/// - `sampling_locations`: `[N, Q, M, L, P, 2]`, normalized `(x, y)`
/// - `attention_weights`: `[N, Q, M, L, P]`, used as given
/// - Output: `[N, Q, M·D]`
///
/// Every float dtype computes in its own precision. Gradients reach all three
/// inputs through numr's autograd.
pub fn ms_deform_attn_impl<R, C>(
    client: &C,
    value: &Var<R>,
    spatial_shapes: &SpatialShapes,
    sampling_locations: &Var<R>,
    attention_weights: &Var<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + CompareOps<R>,
    R::Client: TensorOps<R> + ScalarOps<R> + CompareOps<R>,
{
    let (dims, dtype) = MsDeformAttnDims::from_inputs(
        value.tensor(),
        spatial_shapes,
        sampling_locations.tensor(),
        attention_weights.tensor(),
    )?;
    if !matches!(dtype, DType::F64 | DType::F32 | DType::F16) {
        return Err(Error::UnsupportedDType {
            op: "ms_deform_attn_impl",
            dtype,
        });
    }
    let device = value.tensor().device();
    let output_shape = dims.output_shape();
    if output_shape.iter().product::<usize>() == 0 || dims.points_per_head() == 0 {
        return Ok(Var::new(
            Tensor::<R>::zeros(&output_shape, dtype, device),
            false,
        ));
    }

    let MsDeformAttnDims {
        batch: n,
        num_heads: m,
        head_dim: d,
        num_query: q,
        ..
    } = dims;
    let tap_shape = [n, q, m, 1];
    let selector_shape = [n, q, m, 1, 1];

    let mut acc: Option<Var<R>> = None;
    for (l, level @ (height, width)) in spatial_shapes.iter().enumerate() {
        let hw = height * width;

        // [N, H·W, M, D] → [N, 1, M, H·W, D]
        let grid = var_narrow(value, 1, spatial_shapes.level_offset(l), hw).map_err(Error::Numr)?;
        let grid = var_permute(&grid, &[0, 2, 1, 3]).map_err(Error::Numr)?;
        let grid = dense(client, &grid)?;
        let grid = var_reshape(&grid, &[n, 1, m, hw, d]).map_err(Error::Numr)?;

        let cells = client
            .arange(0.0, hw as f64, 1.0, DType::F64)?
            .reshape(&[hw, 1])?;

        for p in 0..dims.num_points {
            let loc = var_narrow(sampling_locations, 3, l, 1).map_err(Error::Numr)?;
            let x = pick(client, &loc, 4, p, 0, &tap_shape)?;
            let y = pick(client, &loc, 4, p, 1, &tap_shape)?;
            let weight = pick(client, attention_weights, 3, l, p, &tap_shape)?;

            let (west, east, x_floor) = axis_weights(client, &to_pixel(client, &x, width)?)?;
            let (north, south, y_floor) = axis_weights(client, &to_pixel(client, &y, height)?)?;
            let corner_weights = [(&west, &north), (&east, &north), (&west, &south), (&east, &south)];

            let corner = |i: usize| -> Result<Var<R>> {
                let selector = corner_selector(
                    client,
                    &x_floor,
                    &y_floor,
                    CORNERS[i],
                    level,
                    &cells,
                    &selector_shape,
                    dtype,
                )?;
                // [N, Q, M, H·W, D] summed over cells; one term survives
                let picked = var_mul(&grid, &Var::new(selector, false), client).map_err(Error::Numr)?;
                let picked = var_sum(&picked, &[3], false, client).map_err(Error::Numr)?;

                let (wx, wy) = corner_weights[i];
                let cw = var_mul(wx, wy, client).map_err(Error::Numr)?;
                var_mul(&cw, &picked, client).map_err(Error::Numr)
            };
            let mut sample = corner(0)?;
            for i in 1..CORNERS.len() {
                sample = var_add(&sample, &corner(i)?, client).map_err(Error::Numr)?;
            }

            let term = var_mul(&weight, &sample, client).map_err(Error::Numr)?;
            acc = Some(match acc {
                Some(a) => var_add(&a, &term, client).map_err(Error::Numr)?,
                None => term,
            });
        }
    }

    match acc {
        Some(acc) => var_reshape(&acc, &output_shape).map_err(Error::Numr),
        None => Ok(Var::new(Tensor::<R>::zeros(&output_shape, dtype, device), false)),
    }
}

/// Reference multi-scale deformable attention on any runtime.
///
/// Implements `aggregate(V, L, G, W) -> O` with the layout of
/// [`ms_deform_attn_impl`]. The weights are not required to be normalized:
/// the output is the literal weighted sum.
pub fn multi_scale_deformable_attn_reference<R, C>(
    client: &C,
    value: &Tensor<R>,
    spatial_shapes: &SpatialShapes,
    sampling_locations: &Tensor<R>,
    attention_weights: &Tensor<R>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + CompareOps<R>,
    R::Client: TensorOps<R> + ScalarOps<R> + CompareOps<R>,
{
    let out = ms_deform_attn_impl(
        client,
        &Var::new(value.clone(), false),
        spatial_shapes,
        &Var::new(sampling_locations.clone(), false),
        &Var::new(attention_weights.clone(), false),
    )?;
    Ok(out.tensor().clone())
}

/// Gradients of [`multi_scale_deformable_attn_reference`] by backpropagating
/// `Σ grad_output ⊙ output` through the autograd graph.
///
/// Returns `(grad_value, grad_sampling_locations, grad_attention_weights)`.
pub fn multi_scale_deformable_attn_reference_backward<R, C>(
    client: &C,
    grad_output: &Tensor<R>,
    value: &Tensor<R>,
    spatial_shapes: &SpatialShapes,
    sampling_locations: &Tensor<R>,
    attention_weights: &Tensor<R>,
) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + CompareOps<R>,
    R::Client: TensorOps<R> + ScalarOps<R> + CompareOps<R>,
{
    let (dims, dtype) =
        MsDeformAttnDims::from_inputs(value, spatial_shapes, sampling_locations, attention_weights)?;
    super::check_grad_output(grad_output, &dims, dtype)?;

    let v = Var::new(value.clone(), true);
    let loc = Var::new(sampling_locations.clone(), true);
    let w = Var::new(attention_weights.clone(), true);
    let out = ms_deform_attn_impl(client, &v, spatial_shapes, &loc, &w)?;

    let grad_of = |var: &Var<R>, grads: Option<&numr::autograd::GradStore<R>>| {
        grads
            .and_then(|g| g.get(var.tensor().id()))
            .cloned()
            .unwrap_or_else(|| Tensor::<R>::zeros(var.shape(), dtype, value.device()))
    };
    if !out.requires_grad() {
        // Empty problem: nothing was recorded
        return Ok((grad_of(&v, None), grad_of(&loc, None), grad_of(&w, None)));
    }

    let weighted = var_mul(&out, &Var::new(grad_output.clone(), false), client).map_err(Error::Numr)?;
    let loss = var_sum(&weighted, &[0, 1, 2], false, client).map_err(Error::Numr)?;
    let grads = backward(&loss, client).map_err(Error::Numr)?;

    Ok((
        grad_of(&v, Some(&grads)),
        grad_of(&loc, Some(&grads)),
        grad_of(&w, Some(&grads)),
    ))
}
