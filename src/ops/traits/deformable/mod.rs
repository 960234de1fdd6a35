pub mod ms_deform_attn;
pub mod spatial_shapes;

pub use ms_deform_attn::MsDeformAttnOps;
pub use spatial_shapes::SpatialShapes;
