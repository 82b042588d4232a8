//! FP8 block-quantized fused MoE grouped GEMM.
//!
//! - [`quantization`]: E4M3 codec and block scaling helpers
//! - [`moe::fused`]: token alignment, the kernel and its dispatch wrapper
//! - [`graph`]: launch capture/replay used for timing

pub mod graph;
pub mod moe;
pub mod quantization;
