//! Pyramid level geometry for multi-scale deformable attention.
//!
//! The value tensor stores every level's `H_l × W_l` grid back to back along
//! its spatial axis. `SpatialShapes` owns the `(H_l, W_l)` list and derives
//! the per-level start offsets from it.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Ordered `(height, width)` pairs, one per pyramid level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialShapes {
    levels: Vec<(usize, usize)>,
}

impl SpatialShapes {
    /// Build from `(H, W)` pairs. Empty lists and zero-sized levels are rejected.
    pub fn new(levels: &[(usize, usize)]) -> Result<Self> {
        if levels.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "spatial_shapes",
                reason: "at least one level is required".into(),
            });
        }
        if let Some(l) = levels.iter().position(|&(h, w)| h == 0 || w == 0) {
            return Err(Error::InvalidArgument {
                arg: "spatial_shapes",
                reason: format!("level {l} has empty extent {:?}", levels[l]),
            });
        }
        Ok(Self {
            levels: levels.to_vec(),
        })
    }

    /// Build from an integer `[L, 2]` tensor holding `(H, W)` rows (I32 or I64).
    pub fn from_tensor<R: Runtime<DType = DType>>(shapes: &Tensor<R>) -> Result<Self> {
        let dims = shapes.shape();
        if dims.len() != 2 || dims[1] != 2 {
            return Err(Error::ShapeMismatch {
                arg: "spatial_shapes",
                expected: "[L, 2]".into(),
                got: format!("{:?}", dims),
            });
        }

        let raw: Vec<i64> = match shapes.dtype() {
            DType::I64 => shapes.to_vec::<i64>(),
            DType::I32 => shapes
                .to_vec::<i32>()
                .into_iter()
                .map(i64::from)
                .collect(),
            dtype => {
                return Err(Error::UnsupportedDType {
                    op: "SpatialShapes::from_tensor",
                    dtype,
                });
            }
        };

        let mut levels = Vec::with_capacity(dims[0]);
        for pair in raw.chunks_exact(2) {
            let (h, w) = (pair[0], pair[1]);
            if h < 0 || w < 0 {
                return Err(Error::InvalidArgument {
                    arg: "spatial_shapes",
                    reason: format!("negative extent ({h}, {w})"),
                });
            }
            levels.push((h as usize, w as usize));
        }
        Self::new(&levels)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// `(H_l, W_l)` of level `l`.
    pub fn level(&self, l: usize) -> (usize, usize) {
        self.levels[l]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.levels.iter().copied()
    }

    /// `Σ H_l·W_l`, the spatial extent the value tensor must have.
    pub fn total_positions(&self) -> usize {
        self.levels.iter().map(|&(h, w)| h * w).sum()
    }

    /// Offset of level `l` inside the flattened spatial axis.
    pub fn level_offset(&self, l: usize) -> usize {
        self.levels[..l].iter().map(|&(h, w)| h * w).sum()
    }

    /// Exclusive prefix sum of level sizes: `[0, H_0·W_0, H_0·W_0 + H_1·W_1, ...]`.
    pub fn level_start_index(&self) -> Vec<usize> {
        let mut start = 0;
        self.levels
            .iter()
            .map(|&(h, w)| {
                let offset = start;
                start += h * w;
                offset
            })
            .collect()
    }

    /// Check a caller-supplied start index against the derived one.
    pub fn validate_level_start_index(&self, level_start_index: &[usize]) -> Result<()> {
        let expected = self.level_start_index();
        if level_start_index != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                arg: "level_start_index",
                expected: format!("{:?}", expected),
                got: format!("{:?}", level_start_index),
            });
        }
        Ok(())
    }
}
