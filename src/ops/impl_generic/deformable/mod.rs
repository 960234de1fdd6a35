//! Generic multi-scale deformable attention: the reference composed from
//! numr ops, plus the element types and layout checks the fused backends
//! build on.

pub mod element;
pub mod layout;
pub mod reference;

pub use element::{KernelFloat, read_host, write_host};
pub use layout::MsDeformAttnDims;
pub use reference::{
    ms_deform_attn_impl, multi_scale_deformable_attn_reference,
    multi_scale_deformable_attn_reference_backward,
};

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Run `$body` with `$t` aliased to the compute type of `$dtype`.
///
/// F64 → `f64`, F32 → `f32`, F16 → `half::f16`. Any other dtype returns
/// `Error::UnsupportedDType` tagged with `$op`.
macro_rules! dispatch_float {
    ($dtype:expr, $op:expr, $t:ident => $body:block) => {
        match $dtype {
            numr::dtype::DType::F64 => {
                type $t = f64;
                $body
            }
            numr::dtype::DType::F32 => {
                type $t = f32;
                $body
            }
            numr::dtype::DType::F16 => {
                type $t = half::f16;
                $body
            }
            dtype => Err($crate::error::Error::UnsupportedDType { op: $op, dtype }),
        }
    };
}
pub(crate) use dispatch_float;

/// `grad_output` must be `[N, Q, M·D]` in the forward dtype.
pub(crate) fn check_grad_output<R: Runtime<DType = DType>>(
    grad_output: &Tensor<R>,
    dims: &MsDeformAttnDims,
    dtype: DType,
) -> Result<()> {
    if grad_output.shape() != dims.output_shape().as_slice() {
        return Err(Error::ShapeMismatch {
            arg: "grad_output",
            expected: format!("{:?}", dims.output_shape()),
            got: format!("{:?}", grad_output.shape()),
        });
    }
    if grad_output.dtype() != dtype {
        return Err(Error::DTypeMismatch {
            expected: dtype,
            got: grad_output.dtype(),
        });
    }
    Ok(())
}
