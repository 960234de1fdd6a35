//! Compute element types for the host kernels, and the staging between a
//! tensor's storage dtype and its compute type.
//!
//! Every float dtype computes in its own precision: F64 in `f64`, F32 in
//! `f32`, F16 in `half::f16`. Staging converts between identical types, so
//! values cross the host boundary unchanged.

use crate::error::{Error, Result};
use half::f16;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::ops::{Add, Div, Mul, Sub};

/// Floating-point element usable by the deformable attention kernels.
pub trait KernelFloat:
    Copy
    + Send
    + Sync
    + PartialOrd
    + std::fmt::Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + 'static
{
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
    fn floor(self) -> Self;

    fn from_usize(v: usize) -> Self {
        Self::from_f64(v as f64)
    }
}

impl KernelFloat for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as f64
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn floor(self) -> Self {
        f64::floor(self)
    }
}

impl KernelFloat for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn floor(self) -> Self {
        f32::floor(self)
    }
}

impl KernelFloat for f16 {
    const ZERO: Self = f16::ZERO;
    const ONE: Self = f16::ONE;

    #[inline]
    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    // Exact: every f16 is representable in f32, and so is its floor.
    #[inline]
    fn floor(self) -> Self {
        f16::from_f32(f16::to_f32(self).floor())
    }
}

/// Host copy of `t` in compute type `T`.
pub fn read_host<R, T>(t: &Tensor<R>) -> Result<Vec<T>>
where
    R: Runtime<DType = DType>,
    T: KernelFloat,
{
    let t = t.contiguous();
    Ok(match t.dtype() {
        DType::F64 => t.to_vec::<f64>().into_iter().map(T::from_f64).collect(),
        DType::F32 => t.to_vec::<f32>().into_iter().map(T::from_f32).collect(),
        DType::F16 => t
            .to_vec::<f16>()
            .into_iter()
            .map(|v| T::from_f64(v.to_f64()))
            .collect(),
        dtype => {
            return Err(Error::UnsupportedDType {
                op: "read_host",
                dtype,
            });
        }
    })
}

/// Tensor with storage `dtype` built from compute-type host data.
pub fn write_host<R, T>(
    data: &[T],
    dtype: DType,
    shape: &[usize],
    device: &R::Device,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    T: KernelFloat,
{
    Ok(match dtype {
        DType::F64 => {
            let v: Vec<f64> = data.iter().map(|x| x.to_f64()).collect();
            Tensor::<R>::from_slice(&v, shape, device)
        }
        DType::F32 => {
            let v: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
            Tensor::<R>::from_slice(&v, shape, device)
        }
        DType::F16 => {
            let v: Vec<f16> = data.iter().map(|x| f16::from_f64(x.to_f64())).collect();
            Tensor::<R>::from_slice(&v, shape, device)
        }
        dtype => {
            return Err(Error::UnsupportedDType {
                op: "write_host",
                dtype,
            });
        }
    })
}
