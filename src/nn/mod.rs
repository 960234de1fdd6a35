pub mod dropout;
pub mod linear;
pub mod module;
pub mod ms_deform_attn;
pub mod var_builder;
pub mod varmap;

pub use dropout::Dropout;
pub use linear::Linear;
pub use module::{Module, TrainMode};
pub use ms_deform_attn::{
    MsDeformAttnConfig, MsDeformAttnInputs, MultiScaleDeformableAttention, sampling_offset_grid,
};
pub use var_builder::VarBuilder;
pub use varmap::VarMap;
