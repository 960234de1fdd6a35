pub mod kernels;
pub mod ms_deform_attn;
pub mod sampling;
