pub mod deformable;

pub use deformable::{
    ms_deform_attn_impl, multi_scale_deformable_attn_reference,
    multi_scale_deformable_attn_reference_backward,
};
