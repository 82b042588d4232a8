//! Quantization primitives used by the fused MoE kernel.
//!
//! - **FP8 E4M3**: exact decode, round-to-nearest-even encode
//! - **Block scaling**: per-token groups of 128 columns for activations,
//!   per-channel groups of 64 or 128 columns for expert weights

pub mod fp8;

pub use fp8::{
    dequantize_fp8, f32_to_fp8_e4m3, fp8_e4m3_table, fp8_e4m3_to_f32,
    quantize_fp8_per_channel_group, quantize_fp8_per_token_group, ACTIVATION_GROUP_SIZE,
    FP8_E4M3_MAX,
};
