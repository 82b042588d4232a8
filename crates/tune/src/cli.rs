//! Command-line interface of `fused-moe-tune`.

use std::path::PathBuf;

use candle_core::Device;
use clap::{ArgAction, Parser, ValueEnum};
use fused_moe_core::moe::fused::{
    ComputeType, Fp8GemmParams, FusedMoEBlockConfig, LaunchOptions, QuantGroupSize,
};

use crate::error::{Result, TuneError};
use crate::inputs::ProblemShape;

/// Parse a boolean the way shell scripts spell it.
pub fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" => Ok(false),
        _ => Err(format!("Invalid boolean value: {value}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ComputeTypeArg {
    #[value(name = "FP16")]
    Fp16,
    #[value(name = "BF16")]
    Bf16,
}

impl From<ComputeTypeArg> for ComputeType {
    fn from(arg: ComputeTypeArg) -> Self {
        match arg {
            ComputeTypeArg::Fp16 => ComputeType::F16,
            ComputeTypeArg::Bf16 => ComputeType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GroupSizeArg {
    #[value(name = "64")]
    G64,
    #[value(name = "128")]
    G128,
}

impl From<GroupSizeArg> for QuantGroupSize {
    fn from(arg: GroupSizeArg) -> Self {
        match arg {
            GroupSizeArg::G64 => QuantGroupSize::G64,
            GroupSizeArg::G128 => QuantGroupSize::G128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    Cpu,
    Cuda,
}

#[derive(Debug, Parser)]
#[command(
    name = "fused-moe-tune",
    about = "Benchmark, tune and dump the fused FP8 MoE GEMM kernel"
)]
pub struct TuneArgs {
    #[arg(long = "BLOCK_SIZE_M")]
    pub block_size_m: usize,

    #[arg(long = "BLOCK_SIZE_N")]
    pub block_size_n: usize,

    #[arg(long = "BLOCK_SIZE_K")]
    pub block_size_k: usize,

    #[arg(long = "GROUP_SIZE_M")]
    pub group_size_m: usize,

    /// Multiply each output row by its routing weight
    #[arg(long = "MUL_ROUTED_WEIGHT", action = ArgAction::Set, required = true, value_parser = parse_bool)]
    pub mul_routed_weight: bool,

    /// Experts per token
    #[arg(long = "top_k")]
    pub top_k: usize,

    /// Output element type
    #[arg(long = "compute_type", value_enum)]
    pub compute_type: ComputeTypeArg,

    /// Columns per weight scale group
    #[arg(long = "group_size", value_enum)]
    pub group_size: GroupSizeArg,

    /// Number of tokens
    #[arg(long)]
    pub m: usize,

    /// Hidden size (reduction dimension)
    #[arg(long)]
    pub k: usize,

    /// Output features per expert
    #[arg(long)]
    pub n: usize,

    #[arg(long = "num_experts")]
    pub num_experts: usize,

    /// Directory receiving the .bin/.json/.txt artifacts
    #[arg(long = "output_dir")]
    pub output_dir: PathBuf,

    /// Dump the best swept launch configuration when it beats the default
    #[arg(long)]
    pub tune: bool,

    /// Device to benchmark on
    #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
    pub device: DeviceArg,

    /// TOML file overriding the sweep grid and replay counts
    #[arg(long = "sweep-config")]
    pub sweep_config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Seed for the synthetic inputs
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl TuneArgs {
    pub fn block_config(&self) -> FusedMoEBlockConfig {
        FusedMoEBlockConfig::new(
            self.block_size_m,
            self.block_size_n,
            self.block_size_k,
            self.group_size_m,
        )
    }

    pub fn problem_shape(&self) -> ProblemShape {
        ProblemShape {
            m: self.m,
            k: self.k,
            n: self.n,
            num_experts: self.num_experts,
            top_k: self.top_k,
            block_size_m: self.block_size_m,
            group_size: self.group_size.into(),
            compute_type: self.compute_type.into(),
        }
    }

    /// Kernel parameters with the given launch options.
    pub fn gemm_params(&self, launch: Option<LaunchOptions>) -> Fp8GemmParams {
        Fp8GemmParams {
            block: self.block_config(),
            group_size: self.group_size.into(),
            mul_routed_weight: self.mul_routed_weight,
            top_k: self.top_k,
            compute_type: self.compute_type.into(),
            launch,
        }
    }

    pub fn device(&self) -> Result<Device> {
        match self.device {
            DeviceArg::Cpu => Ok(Device::Cpu),
            DeviceArg::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if !device.is_cuda() {
                    return Err(TuneError::InvalidProblem(
                        "--device cuda requested but no CUDA device is available".to_string(),
                    ));
                }
                Ok(device)
            }
        }
    }
}
