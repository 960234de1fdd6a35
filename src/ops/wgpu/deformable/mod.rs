pub mod ms_deform_attn;
