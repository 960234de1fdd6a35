//! Shape validation and flat indexing for the deformable attention tensors.

use crate::error::{Error, Result};
use crate::ops::traits::deformable::SpatialShapes;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Problem sizes shared by every deformable attention kernel.
///
/// - `batch` (N), `num_value` (S), `num_heads` (M), `head_dim` (D)
/// - `num_query` (Q), `num_levels` (L), `num_points` (P)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsDeformAttnDims {
    pub batch: usize,
    pub num_value: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub num_query: usize,
    pub num_levels: usize,
    pub num_points: usize,
}

impl MsDeformAttnDims {
    /// Validate the forward inputs against each other and against `spatial_shapes`.
    ///
    /// Returns the common dtype alongside the sizes.
    pub fn from_inputs<R: Runtime<DType = DType>>(
        value: &Tensor<R>,
        spatial_shapes: &SpatialShapes,
        sampling_locations: &Tensor<R>,
        attention_weights: &Tensor<R>,
    ) -> Result<(Self, DType)> {
        let v = value.shape();
        if v.len() != 4 {
            return Err(Error::ShapeMismatch {
                arg: "value",
                expected: "4D [N, S, M, D]".into(),
                got: format!("{:?}", v),
            });
        }
        let (batch, num_value, num_heads, head_dim) = (v[0], v[1], v[2], v[3]);

        let total = spatial_shapes.total_positions();
        if num_value != total {
            return Err(Error::ShapeMismatch {
                arg: "value",
                expected: format!("spatial extent {} (sum of H*W over levels)", total),
                got: format!("{} in {:?}", num_value, v),
            });
        }

        let loc = sampling_locations.shape();
        if loc.len() != 6 || loc[5] != 2 {
            return Err(Error::ShapeMismatch {
                arg: "sampling_locations",
                expected: "6D [N, Q, M, L, P, 2]".into(),
                got: format!("{:?}", loc),
            });
        }
        let (num_query, num_levels, num_points) = (loc[1], loc[3], loc[4]);
        if loc[0] != batch || loc[2] != num_heads {
            return Err(Error::ShapeMismatch {
                arg: "sampling_locations",
                expected: format!("[{batch}, Q, {num_heads}, L, P, 2]"),
                got: format!("{:?}", loc),
            });
        }
        if num_levels != spatial_shapes.num_levels() {
            return Err(Error::ShapeMismatch {
                arg: "sampling_locations",
                expected: format!("{} levels", spatial_shapes.num_levels()),
                got: format!("{} levels in {:?}", num_levels, loc),
            });
        }

        let w = attention_weights.shape();
        if w != &loc[..5] {
            return Err(Error::ShapeMismatch {
                arg: "attention_weights",
                expected: format!("{:?}", &loc[..5]),
                got: format!("{:?}", w),
            });
        }

        let dtype = value.dtype();
        for other in [sampling_locations.dtype(), attention_weights.dtype()] {
            if other != dtype {
                return Err(Error::DTypeMismatch {
                    expected: dtype,
                    got: other,
                });
            }
        }

        Ok((
            Self {
                batch,
                num_value,
                num_heads,
                head_dim,
                num_query,
                num_levels,
                num_points,
            },
            dtype,
        ))
    }

    pub fn value_shape(&self) -> [usize; 4] {
        [self.batch, self.num_value, self.num_heads, self.head_dim]
    }

    pub fn output_shape(&self) -> [usize; 3] {
        [self.batch, self.num_query, self.num_heads * self.head_dim]
    }

    pub fn locations_shape(&self) -> [usize; 6] {
        [
            self.batch,
            self.num_query,
            self.num_heads,
            self.num_levels,
            self.num_points,
            2,
        ]
    }

    pub fn weights_shape(&self) -> [usize; 5] {
        [
            self.batch,
            self.num_query,
            self.num_heads,
            self.num_levels,
            self.num_points,
        ]
    }

    /// Elements in one batch element of `value`: `S·M·D`.
    pub fn value_batch_stride(&self) -> usize {
        self.num_value * self.num_heads * self.head_dim
    }

    /// Elements in one output row: `M·D`.
    pub fn output_row(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Sampling points per `(n, q, m)`: `L·P`.
    pub fn points_per_head(&self) -> usize {
        self.num_levels * self.num_points
    }

    /// Flat offset of `value[n, s, m, 0]`.
    #[inline]
    pub fn value_index(&self, n: usize, s: usize, m: usize) -> usize {
        ((n * self.num_value + s) * self.num_heads + m) * self.head_dim
    }

    /// Flat offset of `attention_weights[n, q, m, 0, 0]`.
    #[inline]
    pub fn weight_index(&self, n: usize, q: usize, m: usize) -> usize {
        ((n * self.num_query + q) * self.num_heads + m) * self.points_per_head()
    }

    /// Flat offset of `sampling_locations[n, q, m, 0, 0, 0]`.
    #[inline]
    pub fn location_index(&self, n: usize, q: usize, m: usize) -> usize {
        self.weight_index(n, q, m) * 2
    }

    /// Flat offset of `output[n, q, m·D]`.
    #[inline]
    pub fn output_index(&self, n: usize, q: usize, m: usize) -> usize {
        (n * self.num_query + q) * self.output_row() + m * self.head_dim
    }

    /// Effective batch chunk: `min(N, im2col_step)`, which must divide `N`.
    pub fn im2col_chunk(&self, im2col_step: usize) -> Result<usize> {
        if im2col_step == 0 {
            return Err(Error::InvalidArgument {
                arg: "im2col_step",
                reason: "must be > 0".into(),
            });
        }
        let step = im2col_step.min(self.batch).max(1);
        if self.batch % step != 0 {
            return Err(Error::InvalidArgument {
                arg: "im2col_step",
                reason: format!("batch size {} must be divisible by im2col_step {}", self.batch, step),
            });
        }
        Ok(step)
    }
}
