pub mod autograd_ms_deform_attn;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod impl_generic;
pub mod traits;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use autograd_ms_deform_attn::var_ms_deform_attn;
pub use impl_generic::{
    multi_scale_deformable_attn_reference, multi_scale_deformable_attn_reference_backward,
};
pub use traits::{MsDeformAttnOps, SpatialShapes};
