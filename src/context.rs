//! Run context
//!
//! Everything a run needs before the data is touched: a concrete seed, the
//! run directory on disk and the compute device.

use crate::config::RunConfig;
use crate::error::Result;
use rand::Rng;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Range a seed is drawn from when the config leaves it unset
pub const SEED_RANGE: std::ops::RangeInclusive<u64> = 1..=10_000;

/// Compute device a run executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    /// Pick the device from what was requested and what the host offers.
    ///
    /// Returns a warning when the two disagree.
    pub fn resolve(requested: bool, available: bool) -> (Device, Option<String>) {
        match (requested, available) {
            (true, true) => (Device::Cuda, None),
            (true, false) => (
                Device::Cpu,
                Some("cuda requested but no accelerator is available; running on cpu".to_string()),
            ),
            (false, true) => (
                Device::Cpu,
                Some("an accelerator is available; set cuda: true to use it".to_string()),
            ),
            (false, false) => (Device::Cpu, None),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda => write!(f, "cuda"),
        }
    }
}

/// Whether an accelerator backend is compiled in. The dense backend is
/// cpu-only.
pub fn accelerator_available() -> bool {
    false
}

/// Prepared run: seeded config, run directory, device
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: RunConfig,
    pub run_dir: PathBuf,
    pub device: Device,
    pub seed: u64,
}

impl RunContext {
    /// Assign a seed if absent, create the run directory and settle the
    /// device. The returned config has `random_seed` set and `cuda` matching
    /// the chosen device.
    pub fn prepare(config: &RunConfig) -> Result<Self> {
        Self::prepare_with(config, accelerator_available())
    }

    fn prepare_with(config: &RunConfig, available: bool) -> Result<Self> {
        let mut config = config.clone();
        let seed = match config.random_seed {
            Some(seed) => seed,
            None => {
                let seed = rand::rng().random_range(SEED_RANGE);
                info!(seed, "no random_seed configured, drew one");
                seed
            }
        };
        config.random_seed = Some(seed);

        let run_dir = config.run_dir();
        fs::create_dir_all(&run_dir)?;

        let (device, warning) = Device::resolve(config.cuda, available);
        if let Some(msg) = warning {
            warn!("{msg}");
        }
        config.cuda = device == Device::Cuda;

        info!(run_dir = %run_dir.display(), %device, seed, "run context ready");
        Ok(Self {
            config,
            run_dir,
            device,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_device_combinations() {
        assert_eq!(Device::resolve(true, true), (Device::Cuda, None));
        assert_eq!(Device::resolve(false, false), (Device::Cpu, None));

        let (device, warning) = Device::resolve(true, false);
        assert_eq!(device, Device::Cpu);
        assert!(warning.unwrap().contains("requested"));

        let (device, warning) = Device::resolve(false, true);
        assert_eq!(device, Device::Cpu);
        assert!(warning.is_some());
    }

    #[test]
    fn test_prepare_assigns_seed_and_creates_dir() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("biased_mnist", dir.path(), dir.path(), "exp");
        let ctx = RunContext::prepare(&config).unwrap();
        assert!(SEED_RANGE.contains(&ctx.seed));
        assert_eq!(ctx.config.random_seed, Some(ctx.seed));
        assert!(ctx.run_dir.is_dir());
        assert_eq!(ctx.run_dir, dir.path().join("exp"));
    }

    #[test]
    fn test_prepare_keeps_seed_and_downgrades_cuda() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfig::new("celeba", dir.path(), dir.path(), "exp");
        config.random_seed = Some(42);
        config.cuda = true;
        let ctx = RunContext::prepare_with(&config, false).unwrap();
        assert_eq!(ctx.seed, 42);
        assert_eq!(ctx.device, Device::Cpu);
        assert!(!ctx.config.cuda);

        let ctx = RunContext::prepare_with(&config, true).unwrap();
        assert_eq!(ctx.device, Device::Cuda);
    }
}
