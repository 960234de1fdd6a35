pub mod deformable;
