pub mod helpers;

pub mod ms_deform_attn;
