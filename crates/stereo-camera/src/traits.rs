use crate::{
    BackendResult, Camera, ColorPlanes, ColorView, DisparityRange, ImageView, Point3, RawFrame,
    SensorGeometry, StereoInput,
};
use std::path::Path;

/// Bus transport: device discovery.
pub trait TransportBackend {
    type Device: BusDevice;

    /// Enumerate every camera currently attached to the bus.
    fn enumerate(&mut self) -> BackendResult<Vec<Self::Device>>;
}

/// An enumerated camera. Dropping without [`BusDevice::release`] leaks the bus claim.
pub trait BusDevice {
    fn serial_number(&self) -> u32;

    fn is_stereo_camera(&self) -> bool;

    /// Free isochronous channels and bandwidth left locked by an unclean shutdown.
    fn cleanup_iso_channels(&mut self) -> BackendResult<()>;

    fn query_stereo_camera(&mut self) -> BackendResult<SensorGeometry>;

    fn set_stereo_video_mode(&mut self, sensor: &SensorGeometry) -> BackendResult<()>;

    fn set_gain_auto(&mut self) -> BackendResult<()>;

    /// Switch the shutter to manual, absolute control and apply `seconds`.
    fn set_shutter_manual(&mut self, seconds: f32) -> BackendResult<()>;

    fn start_transmission(&mut self) -> BackendResult<()>;

    fn stop_capture(&mut self) -> BackendResult<()>;

    fn stop_transmission(&mut self) -> BackendResult<()>;

    /// Non-blocking dequeue; `Ok(None)` once the queue is empty.
    fn poll_frame(&mut self) -> BackendResult<Option<RawFrame>>;

    /// Hand a dequeued frame back to the device pool.
    fn requeue(&mut self, frame: RawFrame);

    fn shutter(&self) -> BackendResult<f32>;

    fn gain(&self) -> BackendResult<f32>;

    /// Give the device back to the bus.
    fn release(self)
    where
        Self: Sized;
}

/// Stereo geometry engine: creates calibrated contexts.
pub trait StereoBackend {
    type Context: StereoContext;

    fn load_context(&mut self, calibration: &Path) -> BackendResult<Self::Context>;
}

/// A calibrated rectification and matching context. Dropping it destroys it.
///
/// Products returned by the accessors refer to the most recent
/// [`rectify`](StereoContext::rectify), [`rectify_color`](StereoContext::rectify_color)
/// and [`stereo`](StereoContext::stereo) calls.
pub trait StereoContext {
    fn set_subpixel_interpolation(&mut self, enabled: bool) -> BackendResult<()>;

    /// Output resolution of rectified and disparity images.
    fn set_resolution(&mut self, rows: u32, cols: u32) -> BackendResult<()>;

    fn set_disparity(&mut self, range: DisparityRange) -> BackendResult<()>;

    fn set_lowpass(&mut self, enabled: bool) -> BackendResult<()>;

    /// Focal length in pixels at the configured output resolution.
    fn focal_length(&self) -> BackendResult<f32>;

    /// `(row, col)` of the principal point at the configured output resolution.
    fn image_center(&self) -> BackendResult<(f32, f32)>;

    fn baseline(&self) -> BackendResult<f32>;

    fn preprocess(&mut self, input: &StereoInput<'_>) -> BackendResult<()>;

    fn rectify(&mut self, input: &StereoInput<'_>) -> BackendResult<()>;

    fn rectify_color(&mut self, camera: Camera, planes: &ColorPlanes<'_>) -> BackendResult<()>;

    fn stereo(&mut self) -> BackendResult<()>;

    fn rectified(&self, camera: Camera) -> BackendResult<ImageView<'_, u8>>;

    fn rectified_color(&self, camera: Camera) -> BackendResult<ColorView<'_>>;

    /// Sub-pixel disparity of the reference camera.
    fn disparity(&self) -> BackendResult<ImageView<'_, u16>>;

    fn rcd16_to_xyz(&self, row: i32, col: i32, disparity: u16) -> BackendResult<Point3>;

    fn rcd_to_xyz(&self, row: f32, col: f32, disparity: f32) -> BackendResult<Point3>;
}
