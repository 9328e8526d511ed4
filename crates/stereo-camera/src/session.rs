//! The stereo camera session: device lifecycle, capture pipeline and accessors.

use crate::demosaic::{ColorPath, FrameBuffers, RawImage};
use crate::{
    BackendError, BusDevice, Camera, CaptureConfig, CaptureInfo, CaptureKind, CaptureMetrics,
    ColorView, DeviceIdentity, DisparityRange, Error, Frame, GeometryModel, ImageView,
    PixelFormat, Point3, Result, SensorGeometry, SessionConfig, StereoBackend, StereoContext,
    StereoImageRecord, TransportBackend, WarmupPolicy, RECOMMENDED_MAX_DISPARITY,
};
use std::thread;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Bring-up attempts before initialization gives up.
pub const BRING_UP_ATTEMPTS: u32 = 5;

/// Products the last capture left in the stereo context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Products {
    rectified: bool,
    color: bool,
    disparity: bool,
}

struct Live<D, C> {
    device: D,
    context: C,
    sensor: SensorGeometry,
    geometry: GeometryModel,
    buffers: FrameBuffers,
    products: Products,
    host_time: Option<OffsetDateTime>,
}

enum State<D, C> {
    Configured,
    Live(Box<Live<D, C>>),
    Closed,
}

/// Owns one stereo camera from initialization to teardown.
///
/// Image views returned by the accessors borrow the session, so they cannot
/// be held across the next capture.
pub struct StereoCameraSession<T: TransportBackend, S: StereoBackend> {
    identity: DeviceIdentity,
    config: CaptureConfig,
    warmup: WarmupPolicy,
    transport: T,
    stereo: S,
    state: State<T::Device, S::Context>,
    next_frame_id: i32,
    metrics: Option<CaptureMetrics>,
}

/// Stop the device and hand it back to the bus.
fn shutdown_device<D: BusDevice>(mut device: D) {
    if let Err(e) = device.stop_capture() {
        debug!(error = %e, "stop capture failed during shutdown");
    }
    if let Err(e) = device.stop_transmission() {
        warn!(error = %e, "couldn't stop the camera");
    }
    device.release();
}

fn configure<C: StereoContext>(
    context: &mut C,
    sensor: &SensorGeometry,
    config: &CaptureConfig,
) -> Result<GeometryModel> {
    let cfg_err =
        |op: &'static str| move |source: BackendError| Error::BackendConfiguration { op, source };

    context
        .set_subpixel_interpolation(true)
        .map_err(cfg_err("set_subpixel_interpolation"))?;
    // integer division keeps the sensor aspect ratio for the usual even downscales
    let rows = sensor.rows / config.downscale;
    let cols = sensor.cols / config.downscale;
    context
        .set_resolution(rows, cols)
        .map_err(cfg_err("set_resolution"))?;
    let focal_length = context.focal_length().map_err(cfg_err("focal_length"))?;
    let (center_row, center_col) = context.image_center().map_err(cfg_err("image_center"))?;
    context
        .set_disparity(config.disparity)
        .map_err(cfg_err("set_disparity"))?;
    let baseline = context.baseline().map_err(cfg_err("baseline"))?;

    let (hfov, vfov) = field_of_view(cols as f32, rows as f32, focal_length);
    Ok(GeometryModel {
        focal_length,
        center_row,
        center_col,
        hfov,
        vfov,
        baseline,
    })
}

/// Horizontal and vertical field of view in radians for a `width` x `height` output.
pub fn field_of_view(width: f32, height: f32, focal_length: f32) -> (f32, f32) {
    (
        2.0 * width.atan2(2.0 * focal_length),
        2.0 * height.atan2(2.0 * focal_length),
    )
}

impl<T: TransportBackend, S: StereoBackend> StereoCameraSession<T, S> {
    pub fn new(identity: DeviceIdentity, config: CaptureConfig, transport: T, stereo: S) -> Self {
        Self {
            identity,
            config,
            warmup: WarmupPolicy::default(),
            transport,
            stereo,
            state: State::Configured,
            next_frame_id: 0,
            metrics: None,
        }
    }

    /// Session described by a loaded [`SessionConfig`]. The shutter is still passed to `initialize`.
    pub fn from_config(config: &SessionConfig, transport: T, stereo: S) -> Self {
        Self::new(config.identity(), config.capture, transport, stereo).with_warmup(config.warmup)
    }

    pub fn with_warmup(mut self, warmup: WarmupPolicy) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_metrics(mut self, metrics: CaptureMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&CaptureMetrics> {
        self.metrics.as_ref()
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, State::Live(_))
    }

    fn live(&self) -> Result<&Live<T::Device, S::Context>> {
        match &self.state {
            State::Live(live) => Ok(live),
            _ => Err(Error::NotInitialized),
        }
    }

    fn live_mut(&mut self) -> Result<&mut Live<T::Device, S::Context>> {
        match &mut self.state {
            State::Live(live) => Ok(live),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Claim the camera, bring it up, load calibration and warm the pipeline.
    ///
    /// Every error path releases the device and the stereo context.
    pub fn initialize(&mut self, shutter_s: f32) -> Result<()> {
        if self.is_live() {
            return Err(Error::AlreadyInitialized);
        }
        self.config.validate()?;
        if self.config.disparity.max >= RECOMMENDED_MAX_DISPARITY {
            debug!(
                max = self.config.disparity.max,
                "max disparity at or above {RECOMMENDED_MAX_DISPARITY} may show an offset"
            );
        }

        let mut device = self.select_device()?;

        if let Err(e) = device.cleanup_iso_channels() {
            warn!(error = %e, "isochronous cleanup failed; continuing");
        }
        info!(camera = self.identity.id(), "using camera");

        let sensor = match Self::bring_up(&mut device, shutter_s) {
            Ok(sensor) => sensor,
            Err(e) => {
                shutdown_device(device);
                return Err(e);
            }
        };

        let path = self.identity.calibration_file();
        let mut context = match self.stereo.load_context(path) {
            Ok(ctx) => ctx,
            Err(source) => {
                shutdown_device(device);
                return Err(Error::CalibrationLoad {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let setup = configure(&mut context, &sensor, &self.config)
            .and_then(|geometry| Ok((geometry, FrameBuffers::allocate(sensor)?)));
        let (geometry, buffers) = match setup {
            Ok(v) => v,
            Err(e) => {
                drop(context);
                shutdown_device(device);
                return Err(e);
            }
        };
        info!(
            hfov_deg = geometry.hfov.to_degrees(),
            vfov_deg = geometry.vfov.to_degrees(),
            baseline = geometry.baseline,
            "stereo context ready"
        );

        self.state = State::Live(Box::new(Live {
            device,
            context,
            sensor,
            geometry,
            buffers,
            products: Products::default(),
            host_time: None,
        }));
        if let Some(m) = &self.metrics {
            m.capture.session_live.set(1);
        }

        if let Err(e) = self.warm_up() {
            self.release_live();
            return Err(e);
        }
        Ok(())
    }

    /// Enumerate the bus and keep the matching stereo camera; every other device is released.
    fn select_device(&mut self) -> Result<T::Device> {
        let devices = self
            .transport
            .enumerate()
            .map_err(Error::DeviceEnumeration)?;
        if devices.is_empty() {
            return Err(Error::NoDeviceFound);
        }
        let total = devices.len();
        let mut selected = None;
        for device in devices {
            if selected.is_none()
                && device.serial_number() == self.identity.id()
                && device.is_stereo_camera()
            {
                selected = Some(device);
            } else {
                device.release();
            }
        }
        selected.ok_or_else(|| {
            warn!(camera = self.identity.id(), total, "camera not found");
            Error::DeviceNotFound(self.identity.id())
        })
    }

    fn bring_up(device: &mut T::Device, shutter_s: f32) -> Result<SensorGeometry> {
        let mut last = BackendError::new("no attempt made");
        for attempt in 1..=BRING_UP_ATTEMPTS {
            match Self::try_bring_up(device, shutter_s) {
                Ok(sensor) => {
                    let shutter = device.shutter().unwrap_or(f32::NAN);
                    let gain = device.gain().unwrap_or(f32::NAN);
                    info!(attempt, shutter, gain, "transmission started");
                    return Ok(sensor);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "bring-up attempt failed");
                    if let Err(stop) = device.stop_capture() {
                        debug!(attempt, error = %stop, "stop capture after failed bring-up");
                    }
                    if let Err(stop) = device.stop_transmission() {
                        warn!(attempt, error = %stop, "stop transmission after failed bring-up");
                    }
                    last = e;
                }
            }
        }
        Err(Error::DeviceBringUp {
            attempts: BRING_UP_ATTEMPTS,
            last,
        })
    }

    fn try_bring_up(device: &mut T::Device, shutter_s: f32) -> Result<SensorGeometry, BackendError> {
        let sensor = device.query_stereo_camera()?;
        device.set_stereo_video_mode(&sensor)?;
        device.set_gain_auto()?;
        device.set_shutter_manual(shutter_s)?;
        device.start_transmission()?;
        Ok(sensor)
    }

    fn warm_up(&mut self) -> Result<()> {
        let policy = self.warmup;
        for attempt in 1..=policy.max_attempts {
            match self.capture() {
                Ok(_) => {
                    debug!(attempt, "warm-up capture succeeded");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    if attempt < policy.max_attempts {
                        thread::sleep(policy.retry_delay());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::WarmupExhausted {
            attempts: policy.max_attempts,
        })
    }

    fn release_live(&mut self) {
        if let State::Live(live) = std::mem::replace(&mut self.state, State::Closed) {
            let Live {
                device, context, ..
            } = *live;
            drop(context);
            shutdown_device(device);
            if let Some(m) = &self.metrics {
                m.capture.session_live.set(0);
            }
        }
    }

    /// Stop transmission and release the device, context and buffers.
    ///
    /// Calling it again after a successful teardown is a no-op.
    pub fn teardown(&mut self) -> Result<()> {
        match self.state {
            State::Configured => Err(Error::NotInitialized),
            State::Closed => {
                debug!("teardown on a closed session");
                Ok(())
            }
            State::Live(_) => {
                self.release_live();
                info!(camera = self.identity.id(), "camera released");
                Ok(())
            }
        }
    }

    fn count_failure(&self, e: &Error) {
        if let Some(m) = &self.metrics {
            match e {
                Error::NoFrameAvailable => m.capture.empty_polls.inc(),
                e if e.is_transient() => m.capture.pipeline_failures.inc(),
                _ => {}
            }
        }
    }

    /// Drain the frame queue, keep the newest frame and de-interlace it into the buffers.
    fn acquire(&mut self, path: ColorPath) -> Result<(u64, usize)> {
        let live = self.live_mut()?;
        live.products = Products::default();
        live.buffers.invalidate();

        let mut latest = None;
        let mut dropped = 0usize;
        loop {
            match live.device.poll_frame() {
                Ok(Some(frame)) => {
                    if let Some(older) = latest.replace(frame) {
                        live.device.requeue(older);
                        dropped += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if let Some(frame) = latest.take() {
                        live.device.requeue(frame);
                    }
                    return Err(Error::Acquisition(e.to_string()));
                }
            }
        }
        let frame = latest.ok_or(Error::NoFrameAvailable)?;
        let loaded = live.buffers.load(&frame.data, frame.timestamp, path);
        let timestamp = frame.timestamp;
        live.device.requeue(frame);
        loaded?;
        live.host_time = Some(OffsetDateTime::now_utc());

        if let Some(m) = &self.metrics {
            m.capture.frames_dropped.inc_by(dropped as u64);
        }
        Ok((timestamp, dropped))
    }

    fn color_active(&self, live: &Live<T::Device, S::Context>) -> bool {
        self.config.color && live.sensor.is_color()
    }

    /// Rectify the grayscale pair and, when enabled, both color images.
    fn rectify_live(
        live: &mut Live<T::Device, S::Context>,
        color: bool,
        lowpass: bool,
    ) -> Result<bool> {
        let stage =
            |stage: &'static str| move |source: BackendError| Error::StereoPipeline { stage, source };
        let input = live
            .buffers
            .stereo_input()
            .ok_or(Error::ProductUnavailable("stereo input"))?;
        live.context
            .set_lowpass(lowpass)
            .map_err(stage("set_lowpass"))?;
        if lowpass {
            live.context.preprocess(&input).map_err(stage("preprocess"))?;
        }
        live.context.rectify(&input).map_err(stage("rectify"))?;
        live.products.rectified = true;

        if !color {
            return Ok(false);
        }
        for camera in [Camera::Reference, Camera::Left] {
            let planes = live
                .buffers
                .color_planes(camera)
                .ok_or(Error::ProductUnavailable("color planes"))?;
            live.context
                .rectify_color(camera, &planes)
                .map_err(stage("rectify_color"))?;
        }
        live.products.color = true;
        Ok(true)
    }

    fn finish(&self, kind: CaptureKind, timestamp: u64, dropped: usize, color: bool) -> CaptureInfo {
        if let Some(m) = &self.metrics {
            m.capture.frames_captured.inc();
        }
        CaptureInfo {
            kind,
            timestamp,
            host_time: self
                .live()
                .ok()
                .and_then(|l| l.host_time)
                .unwrap_or_else(OffsetDateTime::now_utc),
            dropped,
            color,
        }
    }

    fn run_capture(&mut self, kind: CaptureKind) -> Result<CaptureInfo> {
        let (timestamp, dropped) = self.acquire(ColorPath::Planar)?;
        let live = self.live()?;
        let color = self.color_active(live);
        let live = self.live_mut()?;
        let color = match kind {
            CaptureKind::Raw => false,
            CaptureKind::Rectified => Self::rectify_live(live, color, true)?,
            CaptureKind::Stereo => {
                let color = Self::rectify_live(live, color, false)?;
                live.context.stereo().map_err(|source| Error::StereoPipeline {
                    stage: "stereo",
                    source,
                })?;
                live.products.disparity = true;
                color
            }
        };
        Ok(self.finish(kind, timestamp, dropped, color))
    }

    fn tracked(&mut self, kind: CaptureKind) -> Result<CaptureInfo> {
        let result = self.run_capture(kind);
        if let Err(e) = &result {
            self.count_failure(e);
        }
        result
    }

    /// Acquire a frame, rectify it and compute disparity.
    pub fn capture(&mut self) -> Result<CaptureInfo> {
        self.tracked(CaptureKind::Stereo)
    }

    /// Acquire and rectify without stereo matching; a low-pass pass runs before rectification.
    pub fn capture_rectified(&mut self) -> Result<CaptureInfo> {
        self.tracked(CaptureKind::Rectified)
    }

    /// Acquire and de-interlace only.
    pub fn capture_raw(&mut self) -> Result<CaptureInfo> {
        self.tracked(CaptureKind::Raw)
    }

    /// Capture raw images straight into `record` and stamp it with the next frame id.
    pub fn capture_record(&mut self, record: &mut StereoImageRecord) -> Result<CaptureInfo> {
        let result = self.fill_record(record);
        if let Err(e) = &result {
            self.count_failure(e);
        }
        result
    }

    fn fill_record(&mut self, record: &mut StereoImageRecord) -> Result<CaptureInfo> {
        let last = self.next_frame_id;
        let frame_id = last
            .checked_add(1)
            .ok_or_else(|| Error::Record(format!("frame id {last} cannot advance")))?;
        let (timestamp, dropped) = self.acquire(ColorPath::GreenOnly)?;
        let live = self.live()?;
        // grayscale pair; green channel on color sensors
        let input = live
            .buffers
            .stereo_input()
            .ok_or(Error::ProductUnavailable("stereo input"))?;
        let read = |e: BackendError| Error::Acquisition(format!("camera settings: {e}"));
        let shutter = live.device.shutter().map_err(read)?;
        let gain = live.device.gain().map_err(read)?;
        record.set_images(input.rows, input.cols, 1, input.left, input.right)?;
        record.timestamp = timestamp;
        record.shutter = shutter;
        record.gain = gain;
        record.frame_id = frame_id;
        self.next_frame_id = frame_id;
        Ok(self.finish(CaptureKind::Raw, timestamp, dropped, false))
    }

    /// Change the disparity search range on the live context.
    ///
    /// A backend rejection leaves the previous range in force and the session usable.
    pub fn set_disparity(&mut self, min: i32, max: i32) -> Result<()> {
        let range = DisparityRange::new(min, max)?;
        let live = self.live_mut()?;
        live.context
            .set_disparity(range)
            .map_err(|source| Error::BackendConfiguration {
                op: "set_disparity",
                source,
            })?;
        self.config.disparity = range;
        debug!(min, max, "disparity range updated");
        Ok(())
    }

    /// Toggle color rectification for subsequent captures.
    pub fn set_color_enabled(&mut self, enabled: bool) -> Result<()> {
        if let Ok(live) = self.live() {
            if enabled && !live.sensor.is_color() {
                return Err(Error::ColorUnavailable("camera has a monochrome sensor"));
            }
        }
        self.config.color = enabled;
        Ok(())
    }

    /// Replace the configuration. Once live, only the disparity range and color flag may change.
    ///
    /// A failed call leaves both the backend and the stored configuration untouched.
    pub fn reconfigure(&mut self, config: CaptureConfig) -> Result<()> {
        config.validate()?;
        if !self.is_live() {
            self.config = config;
            return Ok(());
        }
        if config.downscale != self.config.downscale {
            return Err(Error::InvalidConfig(
                "downscale is fixed once the session is initialized".into(),
            ));
        }
        if config.color && !self.live()?.sensor.is_color() {
            return Err(Error::ColorUnavailable("camera has a monochrome sensor"));
        }
        if config.disparity != self.config.disparity {
            self.set_disparity(config.disparity.min, config.disparity.max)?;
        }
        self.config.color = config.color;
        Ok(())
    }

    pub fn sensor(&self) -> Result<SensorGeometry> {
        Ok(self.live()?.sensor)
    }

    pub fn geometry(&self) -> Result<GeometryModel> {
        Ok(self.live()?.geometry)
    }

    pub fn focal_length(&self) -> Result<f32> {
        Ok(self.live()?.geometry.focal_length)
    }

    /// `(row, col)` of the rectified image center.
    pub fn image_center(&self) -> Result<(f32, f32)> {
        let g = self.live()?.geometry;
        Ok((g.center_row, g.center_col))
    }

    /// `(horizontal, vertical)` field of view in radians.
    pub fn field_of_view(&self) -> Result<(f32, f32)> {
        let g = self.live()?.geometry;
        Ok((g.hfov, g.vfov))
    }

    pub fn baseline(&self) -> Result<f32> {
        Ok(self.live()?.geometry.baseline)
    }

    pub fn shutter(&self) -> Result<f32> {
        self.live()?
            .device
            .shutter()
            .map_err(|e| Error::Acquisition(e.to_string()))
    }

    pub fn gain(&self) -> Result<f32> {
        self.live()?
            .device
            .gain()
            .map_err(|e| Error::Acquisition(e.to_string()))
    }

    /// Whether the camera has a color sensor.
    pub fn is_color(&self) -> Result<bool> {
        Ok(self.live()?.sensor.is_color())
    }

    pub fn scale(&self) -> u32 {
        self.config.downscale
    }

    /// `(width, height)` of the raw sensor images.
    pub fn image_size(&self) -> Result<(u32, u32)> {
        let s = self.live()?.sensor;
        Ok((s.cols, s.rows))
    }

    /// `(width, height)` of the stereo input handed to the backend.
    pub fn input_size(&self) -> Result<(usize, usize)> {
        let input = self
            .live()?
            .buffers
            .stereo_input()
            .ok_or(Error::ProductUnavailable("stereo input"))?;
        Ok((input.cols, input.rows))
    }

    /// `(width, height)` of the rectified images.
    pub fn rectified_size(&self) -> Result<(usize, usize)> {
        let view = self.rectified_image(Camera::Reference)?;
        Ok((view.cols, view.rows))
    }

    /// `(width, height)` of the disparity image.
    pub fn disparity_size(&self) -> Result<(usize, usize)> {
        let view = self.disparity_image()?;
        Ok((view.cols, view.rows))
    }

    pub fn raw_image(&self, camera: Camera) -> Result<RawImage<'_>> {
        self.live()?
            .buffers
            .raw_image(camera)
            .ok_or(Error::ProductUnavailable("raw image"))
    }

    /// Center imager on a trinocular head, the left imager otherwise.
    pub fn center_image(&self) -> Result<RawImage<'_>> {
        self.live()?
            .buffers
            .center_image()
            .ok_or(Error::ProductUnavailable("raw image"))
    }

    pub fn left_image(&self) -> Result<RawImage<'_>> {
        self.raw_image(Camera::Left)
    }

    pub fn right_image(&self) -> Result<RawImage<'_>> {
        self.raw_image(Camera::Right)
    }

    /// Copy a raw image into `out`, returning the bytes written.
    pub fn copy_raw_image(&self, camera: Camera, out: &mut [u8]) -> Result<usize> {
        let img = self.raw_image(camera)?;
        let n = img.len();
        if out.len() < n {
            return Err(Error::BufferTooSmall {
                needed: n,
                got: out.len(),
            });
        }
        out[..n].copy_from_slice(&img.data[..n]);
        Ok(n)
    }

    /// Owned copy of a raw image.
    pub fn raw_frame(&self, camera: Camera) -> Result<Frame> {
        let img = self.raw_image(camera)?;
        Ok(Frame {
            width: img.cols as u32,
            height: img.rows as u32,
            pixel_format: img.pixel_format,
            data: img.data.to_vec(),
            ts: self.live()?.host_time,
        })
    }

    pub fn rectified_image(&self, camera: Camera) -> Result<ImageView<'_, u8>> {
        let live = self.live()?;
        if !live.products.rectified {
            return Err(Error::ProductUnavailable("rectified image"));
        }
        live.context
            .rectified(camera)
            .map_err(|source| Error::StereoPipeline {
                stage: "rectified",
                source,
            })
    }

    pub fn rectified_pixel(&self, row: usize, col: usize, camera: Camera) -> Result<u8> {
        self.rectified_image(camera)?.get(row, col)
    }

    pub fn copy_rectified_image(&self, camera: Camera, out: &mut [u8]) -> Result<usize> {
        self.rectified_image(camera)?.copy_to(out)
    }

    /// Owned copy of a rectified grayscale image.
    pub fn rectified_frame(&self, camera: Camera) -> Result<Frame> {
        let view = self.rectified_image(camera)?;
        Ok(Frame {
            width: view.cols as u32,
            height: view.rows as u32,
            pixel_format: PixelFormat::Gray8,
            data: view.to_vec(),
            ts: self.live()?.host_time,
        })
    }

    pub fn rectified_color(&self, camera: Camera) -> Result<ColorView<'_>> {
        let live = self.live()?;
        if !live.sensor.is_color() {
            return Err(Error::ColorUnavailable("camera has a monochrome sensor"));
        }
        if !self.config.color {
            return Err(Error::ColorUnavailable("color capture is disabled"));
        }
        if !live.products.color {
            return Err(Error::ColorUnavailable("last capture produced no color images"));
        }
        live.context
            .rectified_color(camera)
            .map_err(|source| Error::StereoPipeline {
                stage: "rectified_color",
                source,
            })
    }

    /// `[red, green, blue]` of a rectified color pixel.
    pub fn rectified_color_pixel(&self, row: usize, col: usize, camera: Camera) -> Result<[u8; 3]> {
        self.rectified_color(camera)?.pixel(row, col)
    }

    /// Copy a rectified color image as interleaved RGB.
    pub fn copy_rectified_color(&self, camera: Camera, out: &mut [u8]) -> Result<usize> {
        self.rectified_color(camera)?.copy_interleaved(out)
    }

    pub fn rectified_color_frame(&self, camera: Camera) -> Result<Frame> {
        let view = self.rectified_color(camera)?;
        let mut data = vec![0u8; view.rows * view.cols * 3];
        view.copy_interleaved(&mut data)?;
        Ok(Frame {
            width: view.cols as u32,
            height: view.rows as u32,
            pixel_format: PixelFormat::Rgb8,
            data,
            ts: self.live()?.host_time,
        })
    }

    pub fn disparity_image(&self) -> Result<ImageView<'_, u16>> {
        let live = self.live()?;
        if !live.products.disparity {
            return Err(Error::ProductUnavailable("disparity image"));
        }
        live.context
            .disparity()
            .map_err(|source| Error::StereoPipeline {
                stage: "disparity",
                source,
            })
    }

    /// Copy the whole disparity buffer, stride included. Returns the row stride in elements.
    pub fn copy_disparity_image(&self, out: &mut [u16]) -> Result<usize> {
        let view = self.disparity_image()?;
        let n = view.rows * view.rowinc;
        if out.len() < n {
            return Err(Error::BufferTooSmall {
                needed: n * 2,
                got: out.len() * 2,
            });
        }
        let src = view
            .data
            .get(..n)
            .ok_or(Error::ProductUnavailable("disparity image"))?;
        out[..n].copy_from_slice(src);
        Ok(view.rowinc)
    }

    /// Triangulate a rectified pixel with its 16-bit disparity.
    pub fn disparity_to_xyz(&self, row: i32, col: i32, disparity: u16) -> Result<Point3> {
        self.live()?
            .context
            .rcd16_to_xyz(row, col, disparity)
            .map_err(Error::Triangulation)
    }

    /// Triangulate a sub-pixel location with a floating point disparity.
    pub fn disparity_to_xyz_f(&self, row: f32, col: f32, disparity: f32) -> Result<Point3> {
        self.live()?
            .context
            .rcd_to_xyz(row, col, disparity)
            .map_err(Error::Triangulation)
    }
}

impl<T: TransportBackend, S: StereoBackend> Drop for StereoCameraSession<T, S> {
    fn drop(&mut self) {
        if self.is_live() {
            debug!(camera = self.identity.id(), "releasing camera on drop");
            self.release_live();
        }
    }
}
