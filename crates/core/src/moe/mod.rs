//! Mixture of Experts (MoE) kernels.
//!
//! ## Submodules
//!
//! - [`fused`]: Fused FP8 grouped GEMM over expert-sorted tokens
//!
//! ## Feature Flags
//!
//! - `cuda-kernels`: Build and launch the CUDA kernel

pub mod fused;

pub use fused::{
    fused_moe_fp8_gemm, moe_align_block_size, ComputeType, FusedMoEBlockConfig, Fp8GemmParams,
    Fp8MoeInputs, LaunchOptions, MoeAlignOutput, QuantGroupSize,
};
