//! In-process bus and stereo engine so sessions run without hardware.
//!
//! The mock camera streams a textured scene whose left view is the right view
//! shifted by a fixed number of pixels. The mock engine rectifies by nearest
//! sampling and matches with a small SAD window, which is enough to produce
//! disparities that depend on the configured range.

use crate::{
    BackendError, BackendResult, BusDevice, Camera, ColorPlanes, ColorView, DisparityRange,
    ImageView, Point3, RawFrame, SensorGeometry, StereoBackend, StereoContext, StereoInput,
    TransportBackend,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Disparity scale of the 16-bit output when sub-pixel interpolation is on.
pub const SUBPIXEL_SCALE: f32 = 256.0;

/// 16-bit disparities at or above this value mark pixels without a match.
pub const INVALID_DISPARITY: u16 = 0xFF00;

/// Microseconds between frames at 15 fps.
const FRAME_PERIOD_US: u64 = 66_666;

#[derive(Clone, Debug)]
pub struct MockDeviceSpec {
    pub serial: u32,
    pub stereo: bool,
    pub sensor: SensorGeometry,
    /// Number of initial bring-up attempts that fail.
    pub fail_bring_up: u32,
    /// Frames that arrive between two empty polls.
    pub frames_per_poll: usize,
    /// Horizontal offset of the left view, raw pixels.
    pub shift: usize,
    pub gain: f32,
}

impl MockDeviceSpec {
    /// A small monochrome stereo pair.
    pub fn stereo_pair(serial: u32) -> Self {
        Self {
            serial,
            stereo: true,
            sensor: SensorGeometry {
                rows: 48,
                cols: 64,
                bytes_per_pixel: 2,
                bayer_tile: None,
            },
            fail_bring_up: 0,
            frames_per_poll: 2,
            shift: 8,
            gain: 1.5,
        }
    }

    pub fn with_sensor(mut self, sensor: SensorGeometry) -> Self {
        self.sensor = sensor;
        self
    }
}

/// Shared view of the mock bus for assertions and fault injection.
#[derive(Debug, Default)]
pub struct MockBusState {
    pub fail_enumeration: bool,
    /// Polls return nothing while set.
    pub starve: bool,
    pub fail_stop_transmission: bool,
    /// Shutter and gain reads fail while set.
    pub fail_feature_read: bool,
    pub released: Vec<u32>,
    pub iso_cleanups: Vec<u32>,
    pub bring_up_attempts: u32,
    pub capture_stops: u32,
    pub transmission_stops: u32,
    pub frames_requeued: u64,
    /// Serials whose transmission is running.
    pub claimed: HashSet<u32>,
}

pub struct MockTransport {
    specs: Vec<MockDeviceSpec>,
    state: Rc<RefCell<MockBusState>>,
}

impl MockTransport {
    pub fn new(specs: Vec<MockDeviceSpec>) -> Self {
        Self {
            specs,
            state: Rc::new(RefCell::new(MockBusState::default())),
        }
    }

    /// Two transports sharing one bus, used to model a second claim on a device.
    pub fn sharing_bus(&self) -> Self {
        Self {
            specs: self.specs.clone(),
            state: Rc::clone(&self.state),
        }
    }

    pub fn state(&self) -> Rc<RefCell<MockBusState>> {
        Rc::clone(&self.state)
    }
}

impl TransportBackend for MockTransport {
    type Device = MockDevice;

    fn enumerate(&mut self) -> BackendResult<Vec<MockDevice>> {
        if self.state.borrow().fail_enumeration {
            return Err(BackendError::new("raw1394 handle unavailable"));
        }
        Ok(self
            .specs
            .iter()
            .map(|spec| MockDevice {
                spec: spec.clone(),
                state: Rc::clone(&self.state),
                failures_left: spec.fail_bring_up,
                transmitting: false,
                seq: 0,
                queue: VecDeque::new(),
                pool: Vec::new(),
                shutter: 0.0,
            })
            .collect())
    }
}

pub struct MockDevice {
    spec: MockDeviceSpec,
    state: Rc<RefCell<MockBusState>>,
    failures_left: u32,
    transmitting: bool,
    seq: u64,
    queue: VecDeque<RawFrame>,
    pool: Vec<RawFrame>,
    shutter: f32,
}

/// Deterministic texture with enough local variation for block matching.
fn texture(x: usize, y: usize, seq: u64) -> u8 {
    let h = (x as u64)
        .wrapping_mul(2_654_435_761)
        .wrapping_add((y as u64).wrapping_mul(40_503))
        .wrapping_add(seq.wrapping_mul(97));
    ((h >> 7) ^ (h >> 13)) as u8
}

impl MockDevice {
    fn read_feature(&self, name: &str) -> BackendResult<()> {
        if self.state.borrow().fail_feature_read {
            return Err(BackendError::new(format!("couldn't read {name}")));
        }
        Ok(())
    }

    fn next_frame(&mut self) -> RawFrame {
        self.seq += 1;
        let sensor = self.spec.sensor;
        let imagers = sensor.bytes_per_pixel as usize;
        let mut data = self.pool.pop().map(|f| f.data).unwrap_or_default();
        data.clear();
        data.reserve(sensor.frame_bytes());
        for y in 0..sensor.rows as usize {
            for x in 0..sensor.cols as usize {
                for k in 0..imagers {
                    // the right imager (k = 0) sees the scene `shift` pixels further along
                    let offset = self.spec.shift * k / (imagers - 1).max(1);
                    data.push(texture(x + self.spec.shift - offset, y, self.seq));
                }
            }
        }
        RawFrame {
            data,
            timestamp: self.seq * FRAME_PERIOD_US,
        }
    }
}

impl BusDevice for MockDevice {
    fn serial_number(&self) -> u32 {
        self.spec.serial
    }

    fn is_stereo_camera(&self) -> bool {
        self.spec.stereo
    }

    fn cleanup_iso_channels(&mut self) -> BackendResult<()> {
        self.state.borrow_mut().iso_cleanups.push(self.spec.serial);
        Ok(())
    }

    fn query_stereo_camera(&mut self) -> BackendResult<SensorGeometry> {
        self.state.borrow_mut().bring_up_attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(BackendError::new("cannot query all information from camera"));
        }
        Ok(self.spec.sensor)
    }

    fn set_stereo_video_mode(&mut self, _sensor: &SensorGeometry) -> BackendResult<()> {
        Ok(())
    }

    fn set_gain_auto(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn set_shutter_manual(&mut self, seconds: f32) -> BackendResult<()> {
        if !(0.0..=0.021).contains(&seconds) {
            return Err(BackendError::new(format!("shutter {seconds}s out of range")));
        }
        self.shutter = seconds;
        Ok(())
    }

    fn start_transmission(&mut self) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.claimed.insert(self.spec.serial) {
            return Err(BackendError::new("isochronous channel already in use"));
        }
        self.transmitting = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> BackendResult<()> {
        self.state.borrow_mut().capture_stops += 1;
        self.queue.clear();
        Ok(())
    }

    fn stop_transmission(&mut self) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.transmission_stops += 1;
        if state.fail_stop_transmission {
            return Err(BackendError::new("couldn't stop the camera"));
        }
        if self.transmitting {
            state.claimed.remove(&self.spec.serial);
        }
        self.transmitting = false;
        Ok(())
    }

    fn poll_frame(&mut self) -> BackendResult<Option<RawFrame>> {
        if !self.transmitting || self.state.borrow().starve {
            return Ok(None);
        }
        if let Some(frame) = self.queue.pop_front() {
            return Ok(Some(frame));
        }
        // the queue ran dry; the next poll sees freshly arrived frames
        for _ in 0..self.spec.frames_per_poll {
            let frame = self.next_frame();
            self.queue.push_back(frame);
        }
        Ok(None)
    }

    fn requeue(&mut self, frame: RawFrame) {
        self.state.borrow_mut().frames_requeued += 1;
        self.pool.push(frame);
    }

    fn shutter(&self) -> BackendResult<f32> {
        self.read_feature("shutter")?;
        Ok(self.shutter)
    }

    fn gain(&self) -> BackendResult<f32> {
        self.read_feature("gain")?;
        Ok(self.spec.gain)
    }

    fn release(self) {
        let mut state = self.state.borrow_mut();
        if self.transmitting {
            state.claimed.remove(&self.spec.serial);
        }
        state.released.push(self.spec.serial);
    }
}

/// Calibration as stored by the mock engine, YAML on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MockCalibration {
    /// Sensor resolution the calibration was made at.
    pub rows: u32,
    pub cols: u32,
    /// Pixels, at sensor resolution.
    pub focal_length: f32,
    pub center_row: f32,
    pub center_col: f32,
    /// Meters.
    pub baseline: f32,
    /// Largest disparity the engine accepts.
    pub max_disparity: i32,
}

impl MockCalibration {
    pub fn for_sensor(sensor: &SensorGeometry) -> Self {
        Self {
            rows: sensor.rows,
            cols: sensor.cols,
            focal_length: sensor.cols as f32 * 0.8,
            center_row: sensor.rows as f32 / 2.0,
            center_col: sensor.cols as f32 / 2.0,
            baseline: 0.12,
            max_disparity: 1024,
        }
    }

    pub fn write_yaml(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let s = serde_yaml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        fs::write(path, s)
    }
}

/// Shared view of the mock engine for assertions and fault injection.
#[derive(Debug, Default)]
pub struct MockStereoState {
    /// Operation names that fail, e.g. `"stereo"` or `"set_disparity"`.
    pub fail: HashSet<&'static str>,
    pub contexts_created: u32,
    pub contexts_dropped: u32,
    pub preprocess_calls: u32,
    pub stereo_calls: u32,
    /// Low-pass setting of the most recent context.
    pub lowpass: bool,
}

pub struct MockStereo {
    calibrations: HashMap<PathBuf, MockCalibration>,
    state: Rc<RefCell<MockStereoState>>,
}

impl MockStereo {
    /// Engine that reads calibrations from disk only.
    pub fn new() -> Self {
        Self {
            calibrations: HashMap::new(),
            state: Rc::new(RefCell::new(MockStereoState::default())),
        }
    }

    /// Serve `calibration` for `path` without touching the filesystem.
    pub fn with_calibration(mut self, path: impl Into<PathBuf>, calibration: MockCalibration) -> Self {
        self.calibrations.insert(path.into(), calibration);
        self
    }

    pub fn state(&self) -> Rc<RefCell<MockStereoState>> {
        Rc::clone(&self.state)
    }
}

impl Default for MockStereo {
    fn default() -> Self {
        Self::new()
    }
}

impl StereoBackend for MockStereo {
    type Context = MockContext;

    fn load_context(&mut self, calibration: &Path) -> BackendResult<MockContext> {
        let calib = match self.calibrations.get(calibration) {
            Some(c) => c.clone(),
            None => {
                let raw = fs::read_to_string(calibration)
                    .map_err(|e| BackendError::new(format!("{}: {e}", calibration.display())))?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| BackendError::new(format!("malformed calibration: {e}")))?
            }
        };
        self.state.borrow_mut().contexts_created += 1;
        Ok(MockContext {
            out_rows: calib.rows as usize,
            out_cols: calib.cols as usize,
            calib,
            subpixel: false,
            lowpass: false,
            range: DisparityRange::default(),
            smoothed: None,
            rectified: None,
            color: [None, None],
            disparity: None,
            state: Rc::clone(&self.state),
        })
    }
}

type Planes = [Vec<u8>; 3];

pub struct MockContext {
    calib: MockCalibration,
    out_rows: usize,
    out_cols: usize,
    subpixel: bool,
    lowpass: bool,
    range: DisparityRange,
    /// Low-pass filtered (right, left) from the last preprocess.
    smoothed: Option<(Vec<u8>, Vec<u8>)>,
    /// Rectified (right, left).
    rectified: Option<(Vec<u8>, Vec<u8>)>,
    /// Rectified color, [right, left].
    color: [Option<Planes>; 2],
    disparity: Option<Vec<u16>>,
    state: Rc<RefCell<MockStereoState>>,
}

impl MockContext {
    fn check(&self, op: &'static str) -> BackendResult<()> {
        if self.state.borrow().fail.contains(op) {
            return Err(BackendError::new(format!("{op} failed (injected)")));
        }
        Ok(())
    }

    fn ratio(&self) -> f32 {
        self.out_cols as f32 / self.calib.cols as f32
    }

    /// Nearest-neighbor resample of a `rows` x `cols` plane to the output resolution.
    fn resample(&self, src: &[u8], rows: usize, cols: usize, rowinc: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.out_rows * self.out_cols);
        for r in 0..self.out_rows {
            let sr = r * rows / self.out_rows;
            for c in 0..self.out_cols {
                let sc = c * cols / self.out_cols;
                out.push(src.get(sr * rowinc + sc).copied().unwrap_or(0));
            }
        }
        out
    }

    fn match_pixel(&self, right: &[u8], left: &[u8], r: usize, c: usize) -> u16 {
        const HALF: usize = 2;
        let cols = self.out_cols;
        let mut best: Option<(u32, usize)> = None;
        for d in self.range.min as usize..=self.range.max as usize {
            if c + d + HALF >= cols || c < HALF {
                break;
            }
            let mut sad = 0u32;
            for k in c - HALF..=c + HALF {
                let a = right[r * cols + k] as i32;
                let b = left[r * cols + k + d] as i32;
                sad += a.abs_diff(b);
            }
            match best {
                Some((s, _)) if s <= sad => {}
                _ => best = Some((sad, d)),
            }
        }
        match best {
            Some((_, d)) if self.subpixel => (d as f32 * SUBPIXEL_SCALE) as u16,
            Some((_, d)) => d as u16,
            None => INVALID_DISPARITY,
        }
    }

    fn triangulate(&self, row: f32, col: f32, disparity: f32) -> BackendResult<Point3> {
        if !disparity.is_finite() || disparity <= 0.0 {
            return Err(BackendError::new(format!("invalid disparity {disparity}")));
        }
        let f = self.focal_length()?;
        let (cr, cc) = self.image_center()?;
        let z = f * self.calib.baseline / disparity;
        Ok(Point3 {
            x: (col - cc) * z / f,
            y: (row - cr) * z / f,
            z,
        })
    }
}

fn box_blur_rows(src: &[u8], rows: usize, cols: usize) -> Vec<u8> {
    let mut out = vec![0u8; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let lo = c.saturating_sub(1);
            let hi = (c + 1).min(cols - 1);
            let sum: u32 = (lo..=hi).map(|k| src[r * cols + k] as u32).sum();
            out[r * cols + c] = (sum / (hi - lo + 1) as u32) as u8;
        }
    }
    out
}

impl StereoContext for MockContext {
    fn set_subpixel_interpolation(&mut self, enabled: bool) -> BackendResult<()> {
        self.check("set_subpixel_interpolation")?;
        self.subpixel = enabled;
        Ok(())
    }

    fn set_resolution(&mut self, rows: u32, cols: u32) -> BackendResult<()> {
        self.check("set_resolution")?;
        if rows == 0 || cols == 0 || rows > self.calib.rows || cols > self.calib.cols {
            return Err(BackendError::new(format!(
                "resolution {cols}x{rows} not supported by {}x{} calibration",
                self.calib.cols, self.calib.rows
            )));
        }
        self.out_rows = rows as usize;
        self.out_cols = cols as usize;
        Ok(())
    }

    fn set_disparity(&mut self, range: DisparityRange) -> BackendResult<()> {
        self.check("set_disparity")?;
        if range.min < 0 || range.min >= range.max || range.max > self.calib.max_disparity {
            return Err(BackendError::new(format!(
                "disparity range [{}, {}] rejected",
                range.min, range.max
            )));
        }
        self.range = range;
        Ok(())
    }

    fn set_lowpass(&mut self, enabled: bool) -> BackendResult<()> {
        self.check("set_lowpass")?;
        self.lowpass = enabled;
        self.state.borrow_mut().lowpass = enabled;
        Ok(())
    }

    fn focal_length(&self) -> BackendResult<f32> {
        self.check("focal_length")?;
        Ok(self.calib.focal_length * self.ratio())
    }

    fn image_center(&self) -> BackendResult<(f32, f32)> {
        self.check("image_center")?;
        let k = self.ratio();
        Ok((self.calib.center_row * k, self.calib.center_col * k))
    }

    fn baseline(&self) -> BackendResult<f32> {
        self.check("baseline")?;
        Ok(self.calib.baseline)
    }

    fn preprocess(&mut self, input: &StereoInput<'_>) -> BackendResult<()> {
        self.check("preprocess")?;
        self.state.borrow_mut().preprocess_calls += 1;
        self.smoothed = if self.lowpass {
            let (rows, cols) = (input.rows, input.cols);
            let compact = |plane: &[u8]| -> Vec<u8> {
                (0..rows)
                    .flat_map(|r| plane[r * input.rowinc..r * input.rowinc + cols].to_vec())
                    .collect()
            };
            Some((
                box_blur_rows(&compact(input.right), rows, cols),
                box_blur_rows(&compact(input.left), rows, cols),
            ))
        } else {
            None
        };
        Ok(())
    }

    fn rectify(&mut self, input: &StereoInput<'_>) -> BackendResult<()> {
        let smoothed = self.smoothed.take();
        self.rectified = None;
        self.disparity = None;
        self.color = [None, None];
        self.check("rectify")?;
        let (rows, cols) = (input.rows, input.cols);
        let pair = match smoothed {
            Some((right, left)) => (
                self.resample(&right, rows, cols, cols),
                self.resample(&left, rows, cols, cols),
            ),
            None => (
                self.resample(input.right, rows, cols, input.rowinc),
                self.resample(input.left, rows, cols, input.rowinc),
            ),
        };
        self.rectified = Some(pair);
        Ok(())
    }

    fn rectify_color(&mut self, camera: Camera, planes: &ColorPlanes<'_>) -> BackendResult<()> {
        self.check("rectify_color")?;
        let (rows, cols) = (planes.rows, planes.cols);
        let out = [
            self.resample(planes.red, rows, cols, cols),
            self.resample(planes.green, rows, cols, cols),
            self.resample(planes.blue, rows, cols, cols),
        ];
        let slot = if camera == Camera::Left { 1 } else { 0 };
        self.color[slot] = Some(out);
        Ok(())
    }

    fn stereo(&mut self) -> BackendResult<()> {
        self.disparity = None;
        self.check("stereo")?;
        self.state.borrow_mut().stereo_calls += 1;
        let (right, left) = self
            .rectified
            .as_ref()
            .ok_or_else(|| BackendError::new("stereo called before rectify"))?;
        let mut disp = Vec::with_capacity(self.out_rows * self.out_cols);
        for r in 0..self.out_rows {
            for c in 0..self.out_cols {
                disp.push(self.match_pixel(right, left, r, c));
            }
        }
        self.disparity = Some(disp);
        Ok(())
    }

    fn rectified(&self, camera: Camera) -> BackendResult<ImageView<'_, u8>> {
        let (right, left) = self
            .rectified
            .as_ref()
            .ok_or_else(|| BackendError::new("no rectified image"))?;
        let data = if camera == Camera::Left { left } else { right };
        Ok(ImageView::new(self.out_rows, self.out_cols, self.out_cols, data))
    }

    fn rectified_color(&self, camera: Camera) -> BackendResult<ColorView<'_>> {
        let slot = if camera == Camera::Left { 1 } else { 0 };
        let [red, green, blue] = self.color[slot]
            .as_ref()
            .ok_or_else(|| BackendError::new("no rectified color image"))?;
        Ok(ColorView {
            rows: self.out_rows,
            cols: self.out_cols,
            red,
            green,
            blue,
        })
    }

    fn disparity(&self) -> BackendResult<ImageView<'_, u16>> {
        let data = self
            .disparity
            .as_ref()
            .ok_or_else(|| BackendError::new("no disparity image"))?;
        Ok(ImageView::new(self.out_rows, self.out_cols, self.out_cols, data))
    }

    fn rcd16_to_xyz(&self, row: i32, col: i32, disparity: u16) -> BackendResult<Point3> {
        if disparity >= INVALID_DISPARITY {
            return Err(BackendError::new("invalid disparity"));
        }
        let d = if self.subpixel {
            disparity as f32 / SUBPIXEL_SCALE
        } else {
            disparity as f32
        };
        self.triangulate(row as f32, col as f32, d)
    }

    fn rcd_to_xyz(&self, row: f32, col: f32, disparity: f32) -> BackendResult<Point3> {
        self.triangulate(row, col, disparity)
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.state.borrow_mut().contexts_dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_refills_after_running_dry() {
        let mut bus = MockTransport::new(vec![MockDeviceSpec::stereo_pair(1)]);
        let mut dev = bus.enumerate().unwrap().pop().unwrap();
        assert!(dev.poll_frame().unwrap().is_none());
        dev.start_transmission().unwrap();
        assert!(dev.poll_frame().unwrap().is_none());
        let a = dev.poll_frame().unwrap().unwrap();
        let b = dev.poll_frame().unwrap().unwrap();
        assert!(b.timestamp > a.timestamp);
        assert!(dev.poll_frame().unwrap().is_none());
        dev.release();
    }

    #[test]
    fn second_claim_is_rejected() {
        let mut bus = MockTransport::new(vec![MockDeviceSpec::stereo_pair(1)]);
        let mut other = bus.sharing_bus();
        let mut a = bus.enumerate().unwrap().pop().unwrap();
        let mut b = other.enumerate().unwrap().pop().unwrap();
        a.start_transmission().unwrap();
        assert!(b.start_transmission().is_err());
        a.release();
        assert!(b.start_transmission().is_ok());
        b.release();
    }

    #[test]
    fn triangulation_rejects_zero_disparity() {
        let sensor = MockDeviceSpec::stereo_pair(1).sensor;
        let mut engine =
            MockStereo::new().with_calibration("1.cal", MockCalibration::for_sensor(&sensor));
        let mut ctx = engine.load_context(Path::new("1.cal")).unwrap();
        ctx.set_subpixel_interpolation(true).unwrap();
        assert!(ctx.rcd16_to_xyz(0, 0, 0).is_err());
        assert!(ctx.rcd16_to_xyz(0, 0, INVALID_DISPARITY).is_err());
        let p = ctx.rcd16_to_xyz(24, 32, 8 * 256).unwrap();
        let f = ctx.focal_length().unwrap();
        assert!((p.z - f * 0.12 / 8.0).abs() < 1e-4);
        assert!(p.x.abs() < 1e-4);
        drop(ctx);
        assert_eq!(engine.state().borrow().contexts_dropped, 1);
    }

    #[test]
    fn missing_calibration_file_fails() {
        let mut engine = MockStereo::new();
        assert!(engine
            .load_context(Path::new("/nonexistent/6021014.cal"))
            .is_err());
    }
}
