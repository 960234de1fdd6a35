//! Multi-scale deformable attention module
//!
//! Deformable-DETR style attention over a feature pyramid. Each query predicts
//! `P` sampling offsets per head and level around its reference point plus a
//! softmax-normalized weight per sample; the sampler reads the projected value
//! pyramid at those locations.
//!
//! Pipeline:
//! - value: `value_proj` → zero padded positions → split heads `[N, S, M, V_p/M]`
//! - offsets: `sampling_offsets(query + pos)` → `[N, Q, M, L, P, 2]`
//! - weights: `attention_weights(query + pos)` → softmax over `L·P`
//! - locations: reference point + offset normalized by the level extent
//! - `var_ms_deform_attn` → `output_proj` → dropout → residual add

use crate::error::{Error, Result};
use crate::nn::module::{Module, TrainMode};
use crate::nn::{Dropout, Linear, VarBuilder};
use crate::ops::autograd_ms_deform_attn::var_ms_deform_attn;
use crate::ops::impl_generic::deformable::write_host;
use crate::ops::traits::deformable::{MsDeformAttnOps, SpatialShapes};
use numr::autograd::{
    Var, var_add, var_add_scalar, var_mul, var_mul_scalar, var_narrow, var_permute, var_reshape,
    var_softmax,
};
use numr::dtype::DType;
use numr::ops::{BinaryOps, RandomOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Multi-scale deformable attention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsDeformAttnConfig {
    /// Query / output embedding dimension
    pub embed_dims: usize,
    pub num_heads: usize,
    /// Pyramid levels sampled per query
    pub num_levels: usize,
    /// Sampling points per head per level
    pub num_points: usize,
    /// Batch chunk size handed to the sampler
    pub im2col_step: usize,
    /// Dropout on the projected output
    pub dropout: f64,
    /// Inputs are `[N, Q, E]` when true, `[Q, N, E]` otherwise
    pub batch_first: bool,
    /// Value projection width as a fraction of `embed_dims`
    pub value_proj_ratio: f64,
}

impl Default for MsDeformAttnConfig {
    fn default() -> Self {
        Self {
            embed_dims: 256,
            num_heads: 8,
            num_levels: 4,
            num_points: 4,
            im2col_step: 64,
            dropout: 0.1,
            batch_first: false,
            value_proj_ratio: 1.0,
        }
    }
}

impl MsDeformAttnConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| Error::ConfigError {
            reason: format!("failed to parse deformable attention config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error reading {}: {e}", path.as_ref().display()),
        })?;
        Self::from_json_str(&content)
    }

    /// `floor(embed_dims · value_proj_ratio)`
    pub fn value_proj_size(&self) -> usize {
        (self.embed_dims as f64 * self.value_proj_ratio).floor() as usize
    }

    /// Number of `(level, point)` samples per head.
    pub fn points_per_head(&self) -> usize {
        self.num_levels * self.num_points
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.num_levels == 0 || self.num_points == 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "num_heads, num_levels and num_points must be > 0 (got {}, {}, {})",
                    self.num_heads, self.num_levels, self.num_points
                ),
            });
        }
        if self.im2col_step == 0 {
            return Err(Error::ConfigError {
                reason: "im2col_step must be > 0".into(),
            });
        }
        if self.embed_dims == 0 || self.embed_dims % self.num_heads != 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "embed_dims must be divisible by num_heads, but got {} and {}",
                    self.embed_dims, self.num_heads
                ),
            });
        }
        let value_proj_size = self.value_proj_size();
        if !self.value_proj_ratio.is_finite()
            || value_proj_size == 0
            || value_proj_size % self.num_heads != 0
        {
            return Err(Error::ConfigError {
                reason: format!(
                    "value projection size {value_proj_size} (ratio {}) must be positive and divisible by num_heads ({})",
                    self.value_proj_ratio, self.num_heads
                ),
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::ConfigError {
                reason: format!("dropout must be in [0, 1), got {}", self.dropout),
            });
        }

        let dim_per_head = self.embed_dims / self.num_heads;
        if !dim_per_head.is_power_of_two() {
            tracing::warn!(
                dim_per_head,
                "deformable attention is more efficient when embed_dims / num_heads is a power of 2"
            );
        }
        Ok(())
    }
}

/// Per-call inputs besides the query.
///
/// `value` and `identity` default to the query (before `query_pos` is added).
pub struct MsDeformAttnInputs<'a, R: Runtime> {
    /// `[S, N, E]` (or `[N, S, E]` batch-first)
    pub value: Option<&'a Var<R>>,
    /// Residual added to the output; same layout as the query
    pub identity: Option<&'a Var<R>>,
    /// Positional encoding added to the query
    pub query_pos: Option<&'a Var<R>>,
    /// `[N, S]` in the value dtype, 1 marks a padded position
    pub key_padding_mask: Option<&'a Tensor<R>>,
    /// `[N, Q, L, 2]` normalized points or `[N, Q, L, 4]` boxes `(cx, cy, w, h)`
    pub reference_points: &'a Var<R>,
    pub spatial_shapes: &'a SpatialShapes,
    pub level_start_index: &'a [usize],
}

impl<'a, R: Runtime> MsDeformAttnInputs<'a, R> {
    pub fn new(
        reference_points: &'a Var<R>,
        spatial_shapes: &'a SpatialShapes,
        level_start_index: &'a [usize],
    ) -> Self {
        Self {
            value: None,
            identity: None,
            query_pos: None,
            key_padding_mask: None,
            reference_points,
            spatial_shapes,
            level_start_index,
        }
    }
}

/// Multi-scale deformable attention layer.
pub struct MultiScaleDeformableAttention<R: Runtime> {
    value_proj: Linear<R>,
    sampling_offsets: Linear<R>,
    attention_weights: Linear<R>,
    output_proj: Linear<R>,
    dropout: Dropout,
    embed_dims: usize,
    num_heads: usize,
    num_levels: usize,
    num_points: usize,
    im2col_step: usize,
    batch_first: bool,
    value_proj_size: usize,
}

impl<R: Runtime<DType = DType>> MultiScaleDeformableAttention<R> {
    /// Build a trainable F32 layer with the standard initialization:
    /// direction-grid offset bias, zeroed offset and attention heads,
    /// Xavier-uniform value/output projections drawn from the thread RNG.
    pub fn from_config(config: &MsDeformAttnConfig, device: &R::Device) -> Result<Self> {
        Self::from_config_with_rng(config, &mut rand::thread_rng(), device)
    }

    /// [`from_config`](Self::from_config) with the projections drawn from
    /// `rng`; a seeded generator gives reproducible weights.
    pub fn from_config_with_rng<G: Rng + ?Sized>(
        config: &MsDeformAttnConfig,
        rng: &mut G,
        device: &R::Device,
    ) -> Result<Self> {
        config.validate()?;

        let e = config.embed_dims;
        let offsets_out = config.num_heads * config.points_per_head() * 2;
        let weights_out = config.num_heads * config.points_per_head();
        let dt = DType::F32;

        let grid = sampling_offset_grid(config.num_heads, config.num_levels, config.num_points);
        let sampling_offsets = Linear::new(
            Tensor::<R>::zeros(&[offsets_out, e], dt, device),
            Some(Tensor::<R>::from_slice(&grid, &[offsets_out], device)),
            true,
        );
        let attention_weights = Linear::new(
            Tensor::<R>::zeros(&[weights_out, e], dt, device),
            Some(Tensor::<R>::zeros(&[weights_out], dt, device)),
            true,
        );
        let value_proj = Linear::xavier_uniform(e, config.value_proj_size(), &mut *rng, device);
        let output_proj = Linear::xavier_uniform(config.value_proj_size(), e, &mut *rng, device);

        Self::assemble(
            config,
            value_proj,
            sampling_offsets,
            attention_weights,
            output_proj,
        )
    }

    /// Load pretrained weights: `value_proj`, `sampling_offsets`,
    /// `attention_weights`, `output_proj`, each with `weight` and `bias`.
    pub fn from_varbuilder(vb: &mut VarBuilder<R>, config: &MsDeformAttnConfig) -> Result<Self> {
        config.validate()?;

        let e = config.embed_dims;
        let vp = config.value_proj_size();
        let offsets_out = config.num_heads * config.points_per_head() * 2;
        let weights_out = config.num_heads * config.points_per_head();

        let value_proj = load_linear(vb, "value_proj", vp, e)?;
        let sampling_offsets = load_linear(vb, "sampling_offsets", offsets_out, e)?;
        let attention_weights = load_linear(vb, "attention_weights", weights_out, e)?;
        let output_proj = load_linear(vb, "output_proj", e, vp)?;

        Self::assemble(
            config,
            value_proj,
            sampling_offsets,
            attention_weights,
            output_proj,
        )
    }

    fn assemble(
        config: &MsDeformAttnConfig,
        value_proj: Linear<R>,
        sampling_offsets: Linear<R>,
        attention_weights: Linear<R>,
        output_proj: Linear<R>,
    ) -> Result<Self> {
        Ok(Self {
            value_proj,
            sampling_offsets,
            attention_weights,
            output_proj,
            dropout: Dropout::new(config.dropout)?,
            embed_dims: config.embed_dims,
            num_heads: config.num_heads,
            num_levels: config.num_levels,
            num_points: config.num_points,
            im2col_step: config.im2col_step,
            batch_first: config.batch_first,
            value_proj_size: config.value_proj_size(),
        })
    }

    /// Forward pass.
    ///
    /// `query`: `[Q, N, E]` (or `[N, Q, E]` batch-first). Output has the
    /// query's layout.
    pub fn forward<C>(
        &self,
        client: &C,
        query: &Var<R>,
        inputs: MsDeformAttnInputs<'_, R>,
    ) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + RandomOps<R> + ScalarOps<R> + BinaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + BinaryOps<R> + MsDeformAttnOps<R>,
    {
        let value = inputs.value.unwrap_or(query);
        let identity = inputs.identity.unwrap_or(query);
        let query = match inputs.query_pos {
            Some(pos) => var_add(query, pos, client).map_err(Error::Numr)?,
            None => query.clone(),
        };

        let (query, value) = if self.batch_first {
            (query, value.clone())
        } else {
            (swap_leading(client, &query)?, swap_leading(client, value)?)
        };

        let (n, num_query) = self.check_embedded("query", &query)?;
        let (n_value, num_value) = self.check_embedded("value", &value)?;
        let shapes = inputs.spatial_shapes;
        if n_value != n || num_value != shapes.total_positions() {
            return Err(Error::ShapeMismatch {
                arg: "value",
                expected: format!("[{n}, {}, {}]", shapes.total_positions(), self.embed_dims),
                got: format!("{:?}", value.shape()),
            });
        }
        if shapes.num_levels() != self.num_levels {
            return Err(Error::ShapeMismatch {
                arg: "spatial_shapes",
                expected: format!("{} levels", self.num_levels),
                got: format!("{} levels", shapes.num_levels()),
            });
        }

        let (m, l, p) = (self.num_heads, self.num_levels, self.num_points);

        let mut value = self.value_proj.forward(client, &value)?;
        if let Some(mask) = inputs.key_padding_mask {
            if mask.shape() != [n, num_value].as_slice() {
                return Err(Error::ShapeMismatch {
                    arg: "key_padding_mask",
                    expected: format!("[{n}, {num_value}]"),
                    got: format!("{:?}", mask.shape()),
                });
            }
            let mask = Var::new(mask.clone(), false);
            let keep = var_mul_scalar(&mask, -1.0, client).map_err(Error::Numr)?;
            let keep = var_add_scalar(&keep, 1.0, client).map_err(Error::Numr)?;
            let keep = var_reshape(&keep, &[n, num_value, 1]).map_err(Error::Numr)?;
            value = var_mul(&value, &keep, client).map_err(Error::Numr)?;
        }
        let value = var_reshape(&value, &[n, num_value, m, self.value_proj_size / m])
            .map_err(Error::Numr)?;

        let offsets = self.sampling_offsets.forward(client, &query)?;
        let offsets =
            var_reshape(&offsets, &[n, num_query, m, l, p, 2]).map_err(Error::Numr)?;

        let weights = self.attention_weights.forward(client, &query)?;
        let weights = var_reshape(&weights, &[n, num_query, m, l * p]).map_err(Error::Numr)?;
        let weights = var_softmax(&weights, -1, client).map_err(Error::Numr)?;
        let weights = var_reshape(&weights, &[n, num_query, m, l, p]).map_err(Error::Numr)?;

        let locations =
            self.sampling_locations(client, inputs.reference_points, &offsets, shapes)?;

        let output = var_ms_deform_attn(
            &value,
            shapes,
            inputs.level_start_index,
            &locations,
            &weights,
            self.im2col_step,
        )?;
        let output = self.output_proj.forward(client, &output)?;
        let output = if self.batch_first {
            output
        } else {
            swap_leading(client, &output)?
        };
        let output = self.dropout.forward(client, &output)?;
        var_add(&output, identity, client).map_err(Error::Numr)
    }

    /// `[N, Q, E]` shape check, returns `(N, Q)`.
    fn check_embedded(&self, arg: &'static str, x: &Var<R>) -> Result<(usize, usize)> {
        let shape = x.shape();
        if shape.len() != 3 || shape[2] != self.embed_dims {
            return Err(Error::ShapeMismatch {
                arg,
                expected: format!("[_, _, {}]", self.embed_dims),
                got: format!("{shape:?}"),
            });
        }
        Ok((shape[0], shape[1]))
    }

    /// Offsets `[N, Q, M, L, P, 2]` → normalized sampling locations.
    fn sampling_locations<C>(
        &self,
        client: &C,
        reference_points: &Var<R>,
        offsets: &Var<R>,
        shapes: &SpatialShapes,
    ) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + BinaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + BinaryOps<R>,
    {
        let os = offsets.shape();
        let (n, num_query, l) = (os[0], os[1], os[3]);
        let rs = reference_points.shape();
        if rs.len() != 4 || rs[0] != n || rs[1] != num_query || rs[2] != l {
            return Err(Error::ShapeMismatch {
                arg: "reference_points",
                expected: format!("[{n}, {num_query}, {l}, 2 | 4]"),
                got: format!("{rs:?}"),
            });
        }
        let anchor_shape = [n, num_query, 1, l, 1, 2];

        match rs[3] {
            2 => {
                // offset / (W_l, H_l)
                let inv_extent: Vec<f64> = shapes
                    .iter()
                    .flat_map(|(h, w)| [1.0 / w as f64, 1.0 / h as f64])
                    .collect();
                let normalizer = write_host::<R, f64>(
                    &inv_extent,
                    offsets.tensor().dtype(),
                    &[l, 1, 2],
                    offsets.tensor().device(),
                )?;
                let scaled = var_mul(offsets, &Var::new(normalizer, false), client)
                    .map_err(Error::Numr)?;
                let anchor = var_reshape(reference_points, &anchor_shape).map_err(Error::Numr)?;
                var_add(&anchor, &scaled, client).map_err(Error::Numr)
            }
            4 => {
                // center + offset / P · extent · 0.5
                let center = materialize(
                    client,
                    &var_narrow(reference_points, 3, 0, 2).map_err(Error::Numr)?,
                )?;
                let extent = materialize(
                    client,
                    &var_narrow(reference_points, 3, 2, 2).map_err(Error::Numr)?,
                )?;
                let center = var_reshape(&center, &anchor_shape).map_err(Error::Numr)?;
                let extent = var_reshape(&extent, &anchor_shape).map_err(Error::Numr)?;
                let half_step = var_mul_scalar(&extent, 0.5 / self.num_points as f64, client)
                    .map_err(Error::Numr)?;
                let scaled = var_mul(offsets, &half_step, client).map_err(Error::Numr)?;
                var_add(&center, &scaled, client).map_err(Error::Numr)
            }
            d => Err(Error::InvalidArgument {
                arg: "reference_points",
                reason: format!("last dim of reference_points must be 2 or 4, but got {d}"),
            }),
        }
    }

    pub fn sampling_offsets(&self) -> &Linear<R> {
        &self.sampling_offsets
    }

    pub fn attention_weights(&self) -> &Linear<R> {
        &self.attention_weights
    }

    pub fn value_proj(&self) -> &Linear<R> {
        &self.value_proj
    }

    pub fn output_proj(&self) -> &Linear<R> {
        &self.output_proj
    }
}

impl<R: Runtime> Module<R> for MultiScaleDeformableAttention<R> {
    fn parameters(&self) -> Vec<&Var<R>> {
        [
            &self.value_proj,
            &self.sampling_offsets,
            &self.attention_weights,
            &self.output_proj,
        ]
        .into_iter()
        .flat_map(|layer| layer.parameters())
        .collect()
    }

    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        [
            ("value_proj", &self.value_proj),
            ("sampling_offsets", &self.sampling_offsets),
            ("attention_weights", &self.attention_weights),
            ("output_proj", &self.output_proj),
        ]
        .into_iter()
        .flat_map(|(prefix, layer)| {
            layer
                .named_parameters()
                .into_iter()
                .map(move |(name, var)| (format!("{prefix}.{name}"), var))
        })
        .collect()
    }
}

impl<R: Runtime> TrainMode for MultiScaleDeformableAttention<R> {
    fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

/// Initial `sampling_offsets` bias, laid out `[M, L, P, 2]`.
///
/// Head `h` points along `θ = 2πh/M`, scaled so the larger of `|cos|`, `|sin|`
/// is 1; point `i` sits at `i + 1` times that direction on every level.
pub fn sampling_offset_grid(num_heads: usize, num_levels: usize, num_points: usize) -> Vec<f32> {
    let mut grid = Vec::with_capacity(num_heads * num_levels * num_points * 2);
    for h in 0..num_heads {
        let theta = h as f64 * (2.0 * std::f64::consts::PI / num_heads as f64);
        let (sin, cos) = theta.sin_cos();
        let norm = cos.abs().max(sin.abs());
        let (dx, dy) = (cos / norm, sin / norm);
        for _ in 0..num_levels {
            for i in 0..num_points {
                let scale = (i + 1) as f64;
                grid.push((dx * scale) as f32);
                grid.push((dy * scale) as f32);
            }
        }
    }
    grid
}

fn load_linear<R: Runtime>(
    vb: &mut VarBuilder<R>,
    name: &str,
    out_features: usize,
    in_features: usize,
) -> Result<Linear<R>> {
    let mut layer = vb.pp(name);
    let weight = layer.take_with_shape("weight", &[out_features, in_features])?;
    let bias = layer.take_with_shape("bias", &[out_features])?;
    Ok(Linear::new(weight, Some(bias), false))
}

/// `[Q, N, E]` ↔ `[N, Q, E]`, materialized so later reshapes see dense memory.
fn swap_leading<R, C>(client: &C, x: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + BinaryOps<R>,
    R::Client: TensorOps<R> + BinaryOps<R>,
{
    let swapped = var_permute(x, &[1, 0, 2]).map_err(Error::Numr)?;
    materialize(client, &swapped)
}

/// Force a dense copy while keeping the autograd graph (add a zero constant).
fn materialize<R, C>(client: &C, x: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + BinaryOps<R>,
    R::Client: TensorOps<R> + BinaryOps<R>,
{
    let zero = Var::new(
        Tensor::<R>::zeros(x.shape(), x.tensor().dtype(), x.tensor().device()),
        false,
    );
    var_add(x, &zero, client).map_err(Error::Numr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::VarMap;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{backward, var_sum};
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rand_var(rng: &mut StdRng, shape: &[usize], device: &CpuDevice) -> Var<CpuRuntime> {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = (0..numel).map(|_| rng.r#gen::<f32>()).collect();
        Var::new(Tensor::<CpuRuntime>::from_slice(&data, shape, device), false)
    }

    fn small_config(embed_dims: usize, value_proj_ratio: f64) -> MsDeformAttnConfig {
        MsDeformAttnConfig {
            embed_dims,
            num_heads: 3,
            num_levels: 2,
            value_proj_ratio,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = MsDeformAttnConfig::default();
        assert_eq!(config.embed_dims, 256);
        assert_eq!(config.num_heads, 8);
        assert_eq!(config.num_levels, 4);
        assert_eq!(config.num_points, 4);
        assert_eq!(config.im2col_step, 64);
        assert!(!config.batch_first);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_indivisible_heads() {
        let config = MsDeformAttnConfig {
            num_heads: 7,
            ..Default::default()
        };
        let (_client, device) = cpu_setup();
        let err = MultiScaleDeformableAttention::<CpuRuntime>::from_config(&config, &device)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn test_config_rejects_bad_value_proj_and_dropout() {
        assert!(small_config(6, 0.1).validate().is_err()); // floor(0.6) = 0
        assert!(small_config(6, 0.5).validate().is_ok()); // 3 % 3 == 0
        assert!(small_config(6, 2.0 / 3.0).validate().is_err()); // 4 % 3 != 0
        let config = MsDeformAttnConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = MsDeformAttnConfig {
            im2col_step: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json_partial() {
        let config =
            MsDeformAttnConfig::from_json_str(r#"{"embed_dims": 6, "num_heads": 3, "num_levels": 2}"#)
                .unwrap();
        assert_eq!(config.embed_dims, 6);
        assert_eq!(config.num_points, 4);
        assert_eq!(config.value_proj_ratio, 1.0);

        assert!(MsDeformAttnConfig::from_json_str(r#"{"embed_dims": 256, "num_heads": 7}"#).is_err());
        assert!(MsDeformAttnConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_config_from_json_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"embed_dims": 32, "num_heads": 4, "batch_first": true}}"#).unwrap();
        file.flush().unwrap();

        let config = MsDeformAttnConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.embed_dims, 32);
        assert!(config.batch_first);
        assert!(MsDeformAttnConfig::from_json_file("/nonexistent/config.json").is_err());
    }

    #[test]
    fn test_sampling_offset_grid() {
        // 4 heads: east, north, west, south
        let grid = sampling_offset_grid(4, 1, 2);
        assert_eq!(grid.len(), 4 * 2 * 2);
        let expected = [
            (1.0, 0.0),
            (2.0, 0.0),
            (0.0, 1.0),
            (0.0, 2.0),
            (-1.0, 0.0),
            (-2.0, 0.0),
            (0.0, -1.0),
            (0.0, -2.0),
        ];
        for (i, (x, y)) in expected.iter().enumerate() {
            assert!((grid[2 * i] - x).abs() < 1e-6, "x[{i}] = {}", grid[2 * i]);
            assert!((grid[2 * i + 1] - y).abs() < 1e-6, "y[{i}] = {}", grid[2 * i + 1]);
        }

        // repeated across levels; head 1 is the diagonal, normalized by its max-abs component
        let grid = sampling_offset_grid(8, 2, 1);
        assert_eq!(grid[0..2], grid[2..4]);
        assert!((grid[4] - 1.0).abs() < 1e-6 && (grid[5] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_forward_shape_query_first() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(0);
        let mut attn =
            MultiScaleDeformableAttention::<CpuRuntime>::from_config(&small_config(3, 1.0), &device)
                .unwrap();
        attn.set_training(false);

        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 3], &device);
        let key = rand_var(&mut rng, &[5, 1, 3], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);

        let inputs = MsDeformAttnInputs {
            value: Some(&key),
            ..MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4])
        };
        let out = attn.forward(&client, &query, inputs).unwrap();
        assert_eq!(out.shape(), &[5, 1, 3]);
        assert!(out.tensor().to_vec::<f32>().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let (client, device) = cpu_setup();
        let config = small_config(6, 0.5);
        let build = |seed: u64| {
            let mut init = StdRng::seed_from_u64(seed);
            let mut attn =
                MultiScaleDeformableAttention::<CpuRuntime>::from_config_with_rng(&config, &mut init, &device)
                    .unwrap();
            attn.set_training(false);
            attn
        };
        let (a, b, c) = (build(7), build(7), build(8));
        let weights = |attn: &MultiScaleDeformableAttention<CpuRuntime>| -> Vec<Vec<f32>> {
            attn.named_parameters()
                .into_iter()
                .map(|(_, v)| v.tensor().to_vec::<f32>())
                .collect()
        };
        assert_eq!(weights(&a), weights(&b));
        assert_ne!(weights(&a), weights(&c));

        // Query-first layout goes through the [Q, N, E] <-> [N, Q, E] swap
        let mut rng = StdRng::seed_from_u64(9);
        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 6], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);
        let run = |attn: &MultiScaleDeformableAttention<CpuRuntime>| {
            let inputs = MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4]);
            attn.forward(&client, &query, inputs).unwrap().tensor().to_vec::<f32>()
        };
        let out = run(&a);
        assert_eq!(out.len(), 5 * 6);
        assert_eq!(out, run(&b));
    }

    #[test]
    fn test_forward_value_proj_ratio() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(1);
        let attn =
            MultiScaleDeformableAttention::<CpuRuntime>::from_config(&small_config(6, 0.5), &device)
                .unwrap();
        assert_eq!(attn.value_proj().shape(), (3, 6));
        assert_eq!(attn.output_proj().shape(), (6, 3));

        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 6], &device);
        let key = rand_var(&mut rng, &[5, 1, 6], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);

        let inputs = MsDeformAttnInputs {
            value: Some(&key),
            ..MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4])
        };
        let out = attn.forward(&client, &query, inputs).unwrap();
        assert_eq!(out.shape(), &[5, 1, 6]);
    }

    #[test]
    fn test_forward_batch_first_with_boxes() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(2);
        let config = MsDeformAttnConfig {
            embed_dims: 8,
            num_heads: 2,
            num_levels: 2,
            num_points: 2,
            batch_first: true,
            dropout: 0.0,
            ..Default::default()
        };
        let attn = MultiScaleDeformableAttention::<CpuRuntime>::from_config(&config, &device).unwrap();

        let shapes = SpatialShapes::new(&[(3, 2), (1, 2)]).unwrap();
        let query = rand_var(&mut rng, &[2, 4, 8], &device);
        let value = rand_var(&mut rng, &[2, 8, 8], &device);
        let pos = rand_var(&mut rng, &[2, 4, 8], &device);
        let boxes = rand_var(&mut rng, &[2, 4, 2, 4], &device);

        let inputs = MsDeformAttnInputs {
            value: Some(&value),
            query_pos: Some(&pos),
            ..MsDeformAttnInputs::new(&boxes, &shapes, &[0, 6])
        };
        let out = attn.forward(&client, &query, inputs).unwrap();
        assert_eq!(out.shape(), &[2, 4, 8]);
    }

    #[test]
    fn test_fully_padded_value_returns_identity() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(3);
        let mut attn =
            MultiScaleDeformableAttention::<CpuRuntime>::from_config(&small_config(3, 1.0), &device)
                .unwrap();
        attn.set_training(false);

        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 3], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);
        let mask = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 5], &[1, 5], &device);

        let inputs = MsDeformAttnInputs {
            key_padding_mask: Some(&mask),
            ..MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4])
        };
        // all values zeroed and zero output bias leave only the residual
        let out = attn.forward(&client, &query, inputs).unwrap();
        let got = out.tensor().to_vec::<f32>();
        let expected = query.tensor().to_vec::<f32>();
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_forward_rejects_bad_inputs() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(4);
        let attn =
            MultiScaleDeformableAttention::<CpuRuntime>::from_config(&small_config(3, 1.0), &device)
                .unwrap();
        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 3], &device);

        let bad_ref = rand_var(&mut rng, &[1, 5, 2, 3], &device);
        let err = attn
            .forward(&client, &query, MsDeformAttnInputs::new(&bad_ref, &shapes, &[0, 4]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument { arg: "reference_points", .. }));

        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);
        let short_value = rand_var(&mut rng, &[4, 1, 3], &device);
        let inputs = MsDeformAttnInputs {
            value: Some(&short_value),
            ..MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4])
        };
        let err = attn.forward(&client, &query, inputs).err().unwrap();
        assert!(matches!(err, Error::ShapeMismatch { arg: "value", .. }));
    }

    #[test]
    fn test_gradients_reach_every_parameter() {
        let (client, device) = cpu_setup();
        let mut rng = StdRng::seed_from_u64(5);
        let config = MsDeformAttnConfig {
            dropout: 0.0,
            ..small_config(6, 1.0)
        };
        let attn = MultiScaleDeformableAttention::<CpuRuntime>::from_config(&config, &device).unwrap();

        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 6], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);
        let out = attn
            .forward(&client, &query, MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4]))
            .unwrap();

        let loss = var_sum(&out, &[0, 1, 2], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();
        for (name, param) in attn.named_parameters() {
            assert!(grads.get(param.tensor().id()).is_some(), "no gradient for {name}");
        }
    }

    #[test]
    fn test_named_parameters_and_varbuilder_roundtrip() {
        let (client, device) = cpu_setup();
        let config = MsDeformAttnConfig {
            dropout: 0.0,
            ..small_config(6, 1.0)
        };
        let attn = MultiScaleDeformableAttention::<CpuRuntime>::from_config(&config, &device).unwrap();
        let names: Vec<String> = attn.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "value_proj.weight",
                "value_proj.bias",
                "sampling_offsets.weight",
                "sampling_offsets.bias",
                "attention_weights.weight",
                "attention_weights.bias",
                "output_proj.weight",
                "output_proj.bias",
            ]
        );
        // value/output (6·6+6)·2, offsets 48·6+48, weights 24·6+24
        assert_eq!(attn.num_parameters(), 84 + 336 + 168);

        let mut map = VarMap::<CpuRuntime>::new();
        for (name, tensor) in attn.state_dict() {
            map.insert(format!("encoder.attn.{name}"), tensor);
        }
        let mut vb = VarBuilder::new(&mut map, &device);
        let mut vb = vb.pp("encoder");
        let mut vb = vb.pp("attn");
        let loaded = MultiScaleDeformableAttention::<CpuRuntime>::from_varbuilder(&mut vb, &config)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(6);
        let shapes = SpatialShapes::new(&[(2, 2), (1, 1)]).unwrap();
        let query = rand_var(&mut rng, &[5, 1, 6], &device);
        let reference_points = rand_var(&mut rng, &[1, 5, 2, 2], &device);
        let a = attn
            .forward(&client, &query, MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4]))
            .unwrap();
        let b = loaded
            .forward(&client, &query, MsDeformAttnInputs::new(&reference_points, &shapes, &[0, 4]))
            .unwrap();
        assert_eq!(a.tensor().to_vec::<f32>(), b.tensor().to_vec::<f32>());
    }

    #[test]
    fn test_from_varbuilder_missing_weight() {
        let (_client, device) = cpu_setup();
        let mut map = VarMap::<CpuRuntime>::new();
        let mut vb = VarBuilder::new(&mut map, &device);
        let err =
            MultiScaleDeformableAttention::<CpuRuntime>::from_varbuilder(&mut vb, &small_config(3, 1.0))
                .err()
                .unwrap();
        assert!(matches!(err, Error::WeightNotFound { name } if name == "value_proj.weight"));
    }
}
