//! Sweep configuration.
//!
//! Values are resolved with the following priority:
//! 1. TOML sweep file passed with `--sweep-config`
//! 2. Built-in defaults
//!
//! ```toml
//! num_warps = [4, 8]
//! num_stages = [2, 3, 4, 5]
//! capture_launches = 10
//! warmup_iters = 5
//! timed_iters = 20
//! ```

use std::fs;
use std::path::Path;

use fused_moe_core::moe::fused::LaunchOptions;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

pub const DEFAULT_NUM_WARPS: [usize; 2] = [4, 8];
pub const DEFAULT_NUM_STAGES: [usize; 4] = [2, 3, 4, 5];
pub const DEFAULT_CAPTURE_LAUNCHES: usize = 10;
pub const DEFAULT_WARMUP_ITERS: usize = 5;
pub const DEFAULT_TIMED_ITERS: usize = 20;

/// Sweep overrides stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Worker widths to try.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_warps: Option<Vec<usize>>,

    /// Pipeline depths to try.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_stages: Option<Vec<usize>>,

    /// Launches recorded into one launch graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_launches: Option<usize>,

    /// Untimed replays before measuring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_iters: Option<usize>,

    /// Timed replays averaged into the reported latency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_iters: Option<usize>,
}

/// Replay counts for one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    pub capture_launches: usize,
    pub warmup_iters: usize,
    pub timed_iters: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            capture_launches: DEFAULT_CAPTURE_LAUNCHES,
            warmup_iters: DEFAULT_WARMUP_ITERS,
            timed_iters: DEFAULT_TIMED_ITERS,
        }
    }
}

impl SweepConfig {
    /// Load and validate a sweep file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, values) in [("num_warps", &self.num_warps), ("num_stages", &self.num_stages)] {
            match values {
                Some(v) if v.is_empty() => {
                    return Err(TuneError::InvalidSweep(format!("{field} is empty")));
                }
                Some(v) if v.contains(&0) => {
                    return Err(TuneError::InvalidSweep(format!("{field} contains 0")));
                }
                _ => {}
            }
        }
        let counts = [
            ("capture_launches", self.capture_launches),
            ("timed_iters", self.timed_iters),
        ];
        for (field, value) in counts {
            if value == Some(0) {
                return Err(TuneError::InvalidSweep(format!("{field} must be > 0")));
            }
        }
        Ok(())
    }

    /// Every (num_warps, num_stages) pair, warps-major.
    pub fn candidates(&self) -> Vec<LaunchOptions> {
        let warps = self.num_warps.as_deref().unwrap_or(&DEFAULT_NUM_WARPS);
        let stages = self.num_stages.as_deref().unwrap_or(&DEFAULT_NUM_STAGES);
        warps
            .iter()
            .flat_map(|&w| stages.iter().map(move |&s| LaunchOptions::new(w, s)))
            .collect()
    }

    pub fn timing(&self) -> TimingConfig {
        let defaults = TimingConfig::default();
        TimingConfig {
            capture_launches: self.capture_launches.unwrap_or(defaults.capture_launches),
            warmup_iters: self.warmup_iters.unwrap_or(defaults.warmup_iters),
            timed_iters: self.timed_iters.unwrap_or(defaults.timed_iters),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_grid() {
        let candidates = SweepConfig::default().candidates();
        assert_eq!(candidates.len(), 8);
        assert_eq!(candidates[0], LaunchOptions::new(4, 2));
        assert_eq!(candidates[3], LaunchOptions::new(4, 5));
        assert_eq!(candidates[4], LaunchOptions::new(8, 2));
        assert_eq!(candidates[7], LaunchOptions::new(8, 5));
    }

    #[test]
    fn test_default_timing() {
        let timing = SweepConfig::default().timing();
        assert_eq!(timing.capture_launches, 10);
        assert_eq!(timing.warmup_iters, 5);
        assert_eq!(timing.timed_iters, 20);
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.toml");
        fs::write(&path, "num_warps = [2]\ntimed_iters = 3\n").unwrap();

        let config = SweepConfig::load_from(&path).unwrap();
        assert_eq!(
            config.candidates(),
            vec![
                LaunchOptions::new(2, 2),
                LaunchOptions::new(2, 3),
                LaunchOptions::new(2, 4),
                LaunchOptions::new(2, 5),
            ]
        );
        let timing = config.timing();
        assert_eq!(timing.timed_iters, 3);
        assert_eq!(timing.capture_launches, 10); // Unchanged
    }

    #[test]
    fn test_round_trip_skips_unset_fields() {
        let config = SweepConfig {
            num_stages: Some(vec![3]),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(text.trim(), "num_stages = [3]");
        assert_eq!(toml::from_str::<SweepConfig>(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.toml");

        fs::write(&path, "num_warps = []\n").unwrap();
        assert!(matches!(
            SweepConfig::load_from(&path),
            Err(TuneError::InvalidSweep(_))
        ));

        fs::write(&path, "timed_iters = 0\n").unwrap();
        assert!(matches!(
            SweepConfig::load_from(&path),
            Err(TuneError::InvalidSweep(_))
        ));

        fs::write(&path, "num_wraps = [4]\n").unwrap();
        assert!(matches!(
            SweepConfig::load_from(&path),
            Err(TuneError::Config(_))
        ));

        assert!(matches!(
            SweepConfig::load_from(&dir.path().join("missing.toml")),
            Err(TuneError::Io(_))
        ));
    }
}
