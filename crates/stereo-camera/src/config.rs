use crate::{DeviceIdentity, Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exposure used when the caller does not pick one, seconds.
pub const DEFAULT_SHUTTER_S: f32 = 0.0105;

/// Above this the matcher shows a constant offset in its output.
pub const RECOMMENDED_MAX_DISPARITY: i32 = 240;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DisparityRange {
    pub min: i32,
    pub max: i32,
}

impl DisparityRange {
    pub fn new(min: i32, max: i32) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min < 0 || self.min >= self.max {
            return Err(Error::InvalidConfig(format!(
                "disparity range [{}, {}] must satisfy 0 <= min < max",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn contains(&self, disparity: f32) -> bool {
        disparity >= self.min as f32 && disparity <= self.max as f32
    }
}

impl Default for DisparityRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: RECOMMENDED_MAX_DISPARITY,
        }
    }
}

/// Capture settings bound to a session at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Divides the rectified and disparity resolution. Raw images keep sensor resolution.
    pub downscale: u32,
    pub color: bool,
    pub disparity: DisparityRange,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            downscale: 2,
            color: false,
            disparity: DisparityRange::default(),
        }
    }
}

impl CaptureConfig {
    pub fn new(downscale: u32, color: bool) -> Self {
        Self {
            downscale,
            color,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.downscale < 1 {
            return Err(Error::InvalidConfig("downscale must be >= 1".into()));
        }
        self.disparity.validate()
    }
}

/// Bounds the throwaway captures performed at the end of initialization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            retry_delay_ms: 10,
        }
    }
}

impl WarmupPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// On-disk session description.
///
/// ```yaml
/// device_id: 6021014
/// calibration_dir: /etc/stereo
/// shutter_s: 0.0105
/// capture:
///   downscale: 2
///   color: false
///   disparity: { min: 0, max: 240 }
/// warmup:
///   max_attempts: 200
///   retry_delay_ms: 10
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub device_id: u32,
    #[serde(default = "default_calibration_dir")]
    pub calibration_dir: PathBuf,
    #[serde(default = "default_shutter")]
    pub shutter_s: f32,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub warmup: WarmupPolicy,
}

fn default_calibration_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_shutter() -> f32 {
    DEFAULT_SHUTTER_S
}

impl SessionConfig {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            calibration_dir: default_calibration_dir(),
            shutter_s: DEFAULT_SHUTTER_S,
            capture: CaptureConfig::default(),
            warmup: WarmupPolicy::default(),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::with_calibration_dir(self.device_id, &self.calibration_dir)
    }
}

pub fn load_session_config(path: impl AsRef<Path>) -> anyhow::Result<SessionConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading session config: {}", path.display()))?;
    let cfg: SessionConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing yaml: {}", path.display()))?;
    cfg.capture
        .validate()
        .with_context(|| format!("validating capture config: {}", path.display()))?;
    Ok(cfg)
}
