pub mod deformable;

pub use deformable::{MsDeformAttnOps, SpatialShapes};
