//! Benchmarking, autotuning and dump harness for the fused FP8 MoE kernel.
//!
//! A run generates seeded synthetic operands, times the default launch
//! configuration and a `num_warps` x `num_stages` sweep through a captured
//! launch graph, picks a configuration and dumps its compiled artifacts.

pub mod artifact;
pub mod bench;
pub mod cli;
pub mod config;
pub mod error;
pub mod inputs;
pub mod logging;
pub mod runner;
pub mod search;

pub use error::{Result, TuneError};
