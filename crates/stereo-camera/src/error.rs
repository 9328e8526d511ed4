use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure reported by a bus or stereo backend implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type BackendResult<T> = core::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "unable to look for cameras: {0}\n\
         please check\n  \
         - that the ieee1394 / raw1394 / ohci1394 (or firewire-core) kernel modules are loaded\n  \
         - that you have read/write access to the bus device nodes"
    )]
    DeviceEnumeration(BackendError),
    #[error("no cameras found on the bus")]
    NoDeviceFound,
    #[error("camera {0} not found or not a stereo camera")]
    DeviceNotFound(u32),
    #[error("device bring-up failed after {attempts} attempts: {last}")]
    DeviceBringUp { attempts: u32, last: BackendError },
    #[error("cannot load calibration context from {path}: {source}")]
    CalibrationLoad {
        path: PathBuf,
        source: BackendError,
    },
    #[error("backend configuration failed in {op}: {source}")]
    BackendConfiguration {
        op: &'static str,
        source: BackendError,
    },
    #[error("buffer allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
    #[error("no successful capture after {attempts} warm-up attempts")]
    WarmupExhausted { attempts: u32 },
    #[error("no frame available")]
    NoFrameAvailable,
    #[error("frame acquisition failed: {0}")]
    Acquisition(String),
    #[error("bayer demosaicing failed: {0}")]
    Demosaic(String),
    #[error("stereo pipeline failed in {stage}: {source}")]
    StereoPipeline {
        stage: &'static str,
        source: BackendError,
    },
    #[error("color images unavailable: {0}")]
    ColorUnavailable(&'static str),
    #[error("triangulation failed: {0}")]
    Triangulation(BackendError),
    #[error("no {0} available from the last capture")]
    ProductUnavailable(&'static str),
    #[error("pixel ({row}, {col}) outside {rows}x{cols} image")]
    OutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("destination buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("session not initialized")]
    NotInitialized,
    #[error("session already initialized")]
    AlreadyInitialized,
    #[error("record format error: {0}")]
    Record(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Per-frame failures after which the session remains usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoFrameAvailable
                | Error::Acquisition(_)
                | Error::Demosaic(_)
                | Error::StereoPipeline { .. }
                | Error::Triangulation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::NoFrameAvailable.is_transient());
        assert!(Error::StereoPipeline {
            stage: "stereo",
            source: BackendError::new("x")
        }
        .is_transient());
        assert!(!Error::NoDeviceFound.is_transient());
        assert!(!Error::Allocation { bytes: 1 }.is_transient());
    }

    #[test]
    fn enumeration_error_suggests_remediation() {
        let msg = Error::DeviceEnumeration(BackendError::new("bus down")).to_string();
        assert!(msg.contains("kernel modules"));
        assert!(msg.contains("access"));
    }
}
