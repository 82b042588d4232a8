//! Fused FP8 MoE grouped GEMM.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  topk_ids ──▶ moe_align_block_size ──▶ sorted ids / expert ids   │
//! │                                               │                  │
//! │  A (fp8) + a_scale ─┐                         ▼                  │
//! │                     ├──▶  fused_moe_fp8_gemm (one program/tile)  │
//! │  B (fp8) + b_scale ─┘                         │                  │
//! │                                               ▼                  │
//! │                               C [num_tokens, top_k, N] f16/bf16  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`config`]: Tile sizes, specialization record, launch options
//! - [`token_grouper`]: Token alignment by expert for batched execution
//! - [`schedule`]: Launch grid and grouped program ordering
//! - [`compiled`]: Kernel specialization, images and listings
//! - [`kernel_wrapper`]: Operand checks and dispatch
//! - [`reference`]: Untiled dequantize-then-multiply oracle
//!
//! ## Algorithm
//!
//! 1. **Token-to-Expert Alignment:** Sort ids by expert, pad to row-block boundaries
//! 2. **Tiled GEMM:** Each program decodes FP8 chunks of A and B, applies the
//!    activation and weight block scales and accumulates in f32
//! 3. **Epilogue:** Optional routing weight, cast, masked store

pub mod compiled;
pub mod config;
mod fp8_kernel;
mod fp8_op;
pub mod kernel_wrapper;
pub mod reference;
pub mod schedule;
pub mod token_grouper;

pub use compiled::{compile_kernel, CompiledKernel, KernelBackend};
pub use config::{
    ComputeType, FusedMoEBlockConfig, KernelSpecialization, LaunchOptions, QuantGroupSize,
};
pub use kernel_wrapper::{
    fused_moe_fp8_gemm, moe_align_block_size, Fp8GemmParams, Fp8MoeInputs, MoeAlignOutput,
};
pub use reference::fused_moe_fp8_reference;
pub use schedule::{launch_geometry, LaunchGeometry};
pub use token_grouper::{AlignedTokens, MoETokenGrouper};
