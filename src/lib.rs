//! # deformr
//!
//! **Multi-scale deformable attention on numr.**
//!
//! deformr provides the Deformable-DETR sampling operator and the attention
//! module built around it. It uses numr's runtime, tensors, autograd and ops
//! directly.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        deformr                           │
//! │   (MsDeformAttnOps, var_ms_deform_attn, nn module)       │
//! └──────────────────────────┬──────────────────────────────┘
//! │                      numr                                │
//! │     (tensors, ops, runtime, autograd)                    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Extension trait**: `MsDeformAttnOps` implemented on numr's clients
//! - **impl_generic**: reference composed from numr autograd ops, the correctness oracle
//! - **cpu**: fused single-pass kernel, rayon-parallel, owns the bilinear tap math
//! - **autograd**: `var_ms_deform_attn` registers the analytic backward

pub mod error;
pub mod nn;
pub mod ops;

pub use nn::{MsDeformAttnConfig, MsDeformAttnInputs, MultiScaleDeformableAttention};
pub use ops::{MsDeformAttnOps, SpatialShapes, var_ms_deform_attn};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
