//! stereo-camera: session driver for packed-pixel stereo cameras

mod types;
pub use types::{
    BayerTile, Camera, CaptureInfo, CaptureKind, ColorPlanes, ColorView, DeviceIdentity, Frame,
    GeometryModel, ImageView, PixelFormat, Point3, RawFrame, SensorGeometry, StereoInput,
};

mod error;
pub use error::{BackendError, BackendResult, Error, Result};

mod config;
pub use config::{
    load_session_config, CaptureConfig, DisparityRange, SessionConfig, WarmupPolicy,
    DEFAULT_SHUTTER_S, RECOMMENDED_MAX_DISPARITY,
};

mod traits;
pub use traits::{BusDevice, StereoBackend, StereoContext, TransportBackend};

mod demosaic;
pub use demosaic::RawImage;

mod metrics;
pub use metrics::{CaptureCounters, CaptureMetrics};

/// Binary frame-pair records and record log files.
pub mod record;
pub use record::{RecordReader, RecordWriter, StereoImageRecord, RECORD_SIZE, RECORD_VERSION};

mod session;
pub use session::{field_of_view, StereoCameraSession, BRING_UP_ATTEMPTS};

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::{
    MockBusState, MockCalibration, MockContext, MockDevice, MockDeviceSpec, MockStereo,
    MockStereoState, MockTransport, INVALID_DISPARITY, SUBPIXEL_SCALE,
};
