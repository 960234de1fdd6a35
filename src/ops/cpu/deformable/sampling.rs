//! Bilinear sampling with zero padding (align-corners = false).
//!
//! A normalized coordinate `c ∈ [0, 1]` is first moved to grid space
//! `g = 2c − 1 ∈ [-1, 1]` and then unnormalized to a pixel coordinate
//! `((g + 1)·size − 1) / 2`, so pixel centers sit at `(i + 0.5) / size`.
//! Corners outside the level grid contribute zero.

use crate::ops::impl_generic::deformable::KernelFloat;

/// Map a normalized location to grid space `[-1, 1]`.
#[inline]
pub fn to_grid<T: KernelFloat>(loc: T) -> T {
    loc * T::from_f64(2.0) - T::ONE
}

/// Unnormalize a grid-space coordinate to pixel space for an axis of `size` cells.
#[inline]
pub fn unnormalize<T: KernelFloat>(grid: T, size: usize) -> T {
    ((grid + T::ONE) * T::from_usize(size) - T::ONE) / T::from_f64(2.0)
}

/// `unnormalize(to_grid(loc), size)`.
#[inline]
pub fn pixel_coord<T: KernelFloat>(loc: T, size: usize) -> T {
    unnormalize(to_grid(loc), size)
}

/// One bilinear tap: the four neighbouring cells of a fractional position,
/// their interpolation weights and the weights' spatial derivatives.
///
/// Corner order is north-west, north-east, south-west, south-east.
/// `cells[i]` is the row-major cell index `y·W + x` inside the level, or
/// `None` when that corner falls outside the grid.
#[derive(Debug, Clone, Copy)]
pub struct BilinearTap<T> {
    pub cells: [Option<usize>; 4],
    pub weights: [T; 4],
    /// `∂weights[i] / ∂x` in pixel units
    pub dx: [T; 4],
    /// `∂weights[i] / ∂y` in pixel units
    pub dy: [T; 4],
}

impl<T: KernelFloat> BilinearTap<T> {
    /// Locate pixel position `(px, py)` inside an `height × width` grid.
    ///
    /// Returns `None` when no corner is inside the grid (including NaN input).
    pub fn locate(px: T, py: T, height: usize, width: usize) -> Option<Self> {
        let x0 = px.floor();
        let y0 = py.floor();
        let x0_f = x0.to_f64();
        let y0_f = y0.to_f64();
        if !(x0_f >= -1.0 && x0_f < width as f64 && y0_f >= -1.0 && y0_f < height as f64) {
            return None;
        }
        let (xi, yi) = (x0_f as isize, y0_f as isize);
        let x1 = x0 + T::ONE;
        let y1 = y0 + T::ONE;

        let east = px - x0;
        let west = x1 - px;
        let south = py - y0;
        let north = y1 - py;

        let cell = |x: isize, y: isize| -> Option<usize> {
            if x >= 0 && (x as usize) < width && y >= 0 && (y as usize) < height {
                Some(y as usize * width + x as usize)
            } else {
                None
            }
        };

        let zero = T::ZERO;
        Some(Self {
            cells: [
                cell(xi, yi),
                cell(xi + 1, yi),
                cell(xi, yi + 1),
                cell(xi + 1, yi + 1),
            ],
            weights: [west * north, east * north, west * south, east * south],
            dx: [zero - north, north, zero - south, south],
            dy: [zero - west, zero - east, west, east],
        })
    }

    /// Interpolate channel `d`; `row(cell)` gives the flat offset of that
    /// cell's channel vector in `data`.
    #[inline]
    pub fn sample(&self, data: &[T], row: impl Fn(usize) -> usize, d: usize) -> T {
        let mut val = T::ZERO;
        for (cell, w) in self.cells.iter().zip(self.weights.iter()) {
            if let Some(c) = cell {
                val = val + *w * data[row(*c) + d];
            }
        }
        val
    }

    /// Spatial gradient of the interpolated channel `d`: `(∂/∂x, ∂/∂y)`.
    #[inline]
    pub fn sample_grad(&self, data: &[T], row: impl Fn(usize) -> usize, d: usize) -> (T, T) {
        let mut gx = T::ZERO;
        let mut gy = T::ZERO;
        for i in 0..4 {
            if let Some(c) = self.cells[i] {
                let v = data[row(c) + d];
                gx = gx + self.dx[i] * v;
                gy = gy + self.dy[i] * v;
            }
        }
        (gx, gy)
    }
}
