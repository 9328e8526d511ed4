//! Frame buffers and the de-interlace / demosaic steps that fill them.
//!
//! The camera packs one byte per imager into each pixel: byte 0 is the right
//! imager, the last byte the left imager, and a trinocular head carries the
//! center imager in between. De-interlacing splits those bytes into planes
//! stacked right, (center), left.

use crate::{
    BayerTile, Camera, ColorPlanes, Error, PixelFormat, Result, SensorGeometry, StereoInput,
};
use bayer::{BayerDepth, Demosaic, RasterDepth, RasterMut, CFA};
use std::io::Cursor;
use tracing::trace;

/// How a color frame is turned into the 8-bit stereo input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ColorPath {
    /// Split the RGB composite into full R/G/B planes. Needed for color rectification.
    Planar,
    /// Pull out the green channel only.
    GreenOnly,
}

/// A raw (unrectified) sensor image.
#[derive(Clone, Copy, Debug)]
pub struct RawImage<'a> {
    pub rows: usize,
    pub cols: usize,
    pub pixel_format: PixelFormat,
    pub data: &'a [u8],
}

impl RawImage<'_> {
    pub fn len(&self) -> usize {
        self.rows * self.cols * self.pixel_format.channels()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ColorBuffers {
    /// Demosaiced composite, one RGB image per imager.
    rgb: Vec<u8>,
    green: Vec<u8>,
    /// The composite split into an R, a G and a B plane, each holding every imager.
    planar: Vec<u8>,
}

pub(crate) struct FrameBuffers {
    sensor: SensorGeometry,
    deinterlaced: Vec<u8>,
    color: Option<ColorBuffers>,
    loaded: Option<ColorPath>,
    timestamp: u64,
}

fn alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::Allocation { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

impl FrameBuffers {
    /// Size every buffer from the sensor geometry. Color buffers exist only for color sensors.
    pub fn allocate(sensor: SensorGeometry) -> Result<Self> {
        let size = sensor.frame_bytes();
        if size == 0 {
            return Err(Error::InvalidConfig(format!(
                "sensor reports empty frame {}x{}x{}",
                sensor.cols, sensor.rows, sensor.bytes_per_pixel
            )));
        }
        let deinterlaced = alloc(size)?;
        let color = if sensor.is_color() {
            Some(ColorBuffers {
                rgb: alloc(3 * size)?,
                green: alloc(size)?,
                planar: alloc(3 * size)?,
            })
        } else {
            None
        };
        Ok(Self {
            sensor,
            deinterlaced,
            color,
            loaded: None,
            timestamp: 0,
        })
    }

    /// Forget the previous frame; accessors fail until the next load succeeds.
    pub fn invalidate(&mut self) {
        self.loaded = None;
    }

    /// De-interlace (and for color sensors demosaic) one packed frame in place.
    pub fn load(&mut self, frame: &[u8], timestamp: u64, path: ColorPath) -> Result<()> {
        self.loaded = None;
        let size = self.sensor.frame_bytes();
        if frame.len() < size {
            return Err(Error::Acquisition(format!(
                "short frame: {} bytes, expected {}",
                frame.len(),
                size
            )));
        }
        let planes = self.sensor.bytes_per_pixel as usize;
        deinterlace(&frame[..size], &mut self.deinterlaced, planes);

        if let (Some(tile), Some(color)) = (self.sensor.bayer_tile, self.color.as_mut()) {
            let cols = self.sensor.cols as usize;
            let rows = self.sensor.rows as usize * planes;
            bayer_to_rgb(&self.deinterlaced, &mut color.rgb, cols, rows, tile)?;
            match path {
                ColorPath::Planar => deinterlace(&color.rgb, &mut color.planar, 3),
                ColorPath::GreenOnly => extract_green(&color.rgb, &mut color.green),
            }
        }

        trace!(timestamp, ?path, "frame loaded");
        self.timestamp = timestamp;
        self.loaded = Some(path);
        Ok(())
    }

    fn imagers(&self) -> usize {
        self.sensor.bytes_per_pixel as usize
    }

    fn slot(&self, camera: Camera) -> usize {
        if camera.is_right() {
            0
        } else {
            self.imagers() - 1
        }
    }

    fn center_slot(&self) -> usize {
        if self.imagers() > 2 {
            1
        } else {
            self.imagers() - 1
        }
    }

    fn raw_slot(&self, slot: usize) -> Option<RawImage<'_>> {
        self.loaded?;
        let n = self.sensor.pixels();
        let rows = self.sensor.rows as usize;
        let cols = self.sensor.cols as usize;
        match &self.color {
            Some(color) => Some(RawImage {
                rows,
                cols,
                pixel_format: PixelFormat::Rgb8,
                data: color.rgb.get(slot * 3 * n..(slot + 1) * 3 * n)?,
            }),
            None => Some(RawImage {
                rows,
                cols,
                pixel_format: PixelFormat::Gray8,
                data: self.deinterlaced.get(slot * n..(slot + 1) * n)?,
            }),
        }
    }

    pub fn raw_image(&self, camera: Camera) -> Option<RawImage<'_>> {
        self.raw_slot(self.slot(camera))
    }

    /// Center imager of a trinocular head; the left imager on a stereo pair.
    pub fn center_image(&self) -> Option<RawImage<'_>> {
        self.raw_slot(self.center_slot())
    }

    /// Right and left 8-bit planes for the stereo backend.
    pub fn stereo_input(&self) -> Option<StereoInput<'_>> {
        let path = self.loaded?;
        let n = self.sensor.pixels();
        let (right_slot, left_slot) = (self.slot(Camera::Right), self.slot(Camera::Left));
        let source: &[u8] = match (&self.color, path) {
            (None, _) => &self.deinterlaced,
            (Some(color), ColorPath::GreenOnly) => &color.green,
            // green plane of the planar buffer
            (Some(color), ColorPath::Planar) => {
                let plane = n * self.imagers();
                color.planar.get(plane..2 * plane)?
            }
        };
        Some(StereoInput {
            rows: self.sensor.rows as usize,
            cols: self.sensor.cols as usize,
            rowinc: self.sensor.cols as usize,
            right: source.get(right_slot * n..(right_slot + 1) * n)?,
            left: source.get(left_slot * n..(left_slot + 1) * n)?,
            timestamp: self.timestamp,
        })
    }

    /// Per-camera R/G/B planes. Only available after a planar color load.
    pub fn color_planes(&self, camera: Camera) -> Option<ColorPlanes<'_>> {
        if self.loaded? != ColorPath::Planar {
            return None;
        }
        let color = self.color.as_ref()?;
        let n = self.sensor.pixels();
        let plane = n * self.imagers();
        let start = self.slot(camera) * n;
        let channel = |c: usize| color.planar.get(c * plane + start..c * plane + start + n);
        Some(ColorPlanes {
            rows: self.sensor.rows as usize,
            cols: self.sensor.cols as usize,
            red: channel(0)?,
            green: channel(1)?,
            blue: channel(2)?,
        })
    }
}

/// Split `src` into `planes` contiguous planes: byte `k` of every pixel lands in plane `k`.
pub(crate) fn deinterlace(src: &[u8], dst: &mut [u8], planes: usize) {
    let plane_len = src.len() / planes;
    for (i, px) in src.chunks_exact(planes).enumerate() {
        for (k, &b) in px.iter().enumerate() {
            dst[k * plane_len + i] = b;
        }
    }
}

/// Keep the green byte of every RGB triple.
pub(crate) fn extract_green(rgb: &[u8], dst: &mut [u8]) {
    for (d, px) in dst.iter_mut().zip(rgb.chunks_exact(3)) {
        *d = px[1];
    }
}

fn cfa(tile: BayerTile) -> CFA {
    match tile {
        BayerTile::Rggb => CFA::RGGB,
        BayerTile::Gbrg => CFA::GBRG,
        BayerTile::Grbg => CFA::GRBG,
        BayerTile::Bggr => CFA::BGGR,
    }
}

/// Nearest-neighbor demosaic of a `cols` x `rows` 8-bit mosaic into packed RGB.
///
/// The imagers are decoded as one tall image, so colors alias across the seam rows.
pub(crate) fn bayer_to_rgb(
    src: &[u8],
    dst: &mut [u8],
    cols: usize,
    rows: usize,
    tile: BayerTile,
) -> Result<()> {
    let needed = cols * rows;
    if src.len() < needed || dst.len() < needed * 3 {
        return Err(Error::Demosaic(format!(
            "buffer sizes {}/{} do not fit {}x{}",
            src.len(),
            dst.len(),
            cols,
            rows
        )));
    }
    let mut cursor = Cursor::new(&src[..needed]);
    let mut raster = RasterMut::new(cols, rows, RasterDepth::Depth8, &mut dst[..needed * 3]);
    bayer::run_demosaic(
        &mut cursor,
        BayerDepth::Depth8,
        cfa(tile),
        Demosaic::NearestNeighbour,
        &mut raster,
    )
    .map_err(|e| Error::Demosaic(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_sensor(bpp: u32) -> SensorGeometry {
        SensorGeometry {
            rows: 4,
            cols: 6,
            bytes_per_pixel: bpp,
            bayer_tile: None,
        }
    }

    #[test]
    fn deinterlace_splits_stereo_bytes() {
        let src = [1u8, 10, 2, 20, 3, 30];
        let mut dst = [0u8; 6];
        deinterlace(&src, &mut dst, 2);
        assert_eq!(dst, [1, 2, 3, 10, 20, 30]);
    }

    #[test]
    fn deinterlace_splits_three_planes() {
        let src = [1u8, 10, 100, 2, 20, 200];
        let mut dst = [0u8; 6];
        deinterlace(&src, &mut dst, 3);
        assert_eq!(dst, [1, 2, 10, 20, 100, 200]);
    }

    #[test]
    fn green_extraction() {
        let rgb = [1u8, 2, 3, 4, 5, 6];
        let mut g = [0u8; 2];
        extract_green(&rgb, &mut g);
        assert_eq!(g, [2, 5]);
    }

    #[test]
    fn mono_load_exposes_right_and_left() {
        let sensor = mono_sensor(2);
        let mut bufs = FrameBuffers::allocate(sensor).unwrap();
        assert!(bufs.raw_image(Camera::Right).is_none());

        // right byte = 1, left byte = 2
        let frame: Vec<u8> = (0..sensor.pixels()).flat_map(|_| [1u8, 2]).collect();
        bufs.load(&frame, 42, ColorPath::Planar).unwrap();

        let right = bufs.raw_image(Camera::Reference).unwrap();
        let left = bufs.raw_image(Camera::Left).unwrap();
        assert_eq!(right.pixel_format, PixelFormat::Gray8);
        assert!(right.data.iter().all(|&b| b == 1));
        assert!(left.data.iter().all(|&b| b == 2));

        let input = bufs.stereo_input().unwrap();
        assert_eq!(input.timestamp, 42);
        assert_eq!((input.rows, input.cols), (4, 6));
        assert!(input.left.iter().all(|&b| b == 2));
        assert!(bufs.color_planes(Camera::Right).is_none());
    }

    #[test]
    fn trinocular_center_sits_between() {
        let sensor = mono_sensor(3);
        let mut bufs = FrameBuffers::allocate(sensor).unwrap();
        let frame: Vec<u8> = (0..sensor.pixels()).flat_map(|_| [1u8, 5, 9]).collect();
        bufs.load(&frame, 0, ColorPath::Planar).unwrap();
        assert!(bufs.center_image().unwrap().data.iter().all(|&b| b == 5));
        assert!(bufs.raw_image(Camera::Left).unwrap().data.iter().all(|&b| b == 9));
    }

    #[test]
    fn short_frame_is_rejected_and_invalidates() {
        let sensor = mono_sensor(2);
        let mut bufs = FrameBuffers::allocate(sensor).unwrap();
        let frame = vec![0u8; sensor.frame_bytes()];
        bufs.load(&frame, 1, ColorPath::Planar).unwrap();
        assert!(bufs.stereo_input().is_some());
        let err = bufs.load(&frame[..3], 2, ColorPath::Planar).unwrap_err();
        assert!(matches!(err, Error::Acquisition(_)));
        assert!(bufs.stereo_input().is_none());
    }

    #[test]
    fn color_load_produces_planes_and_green_input() {
        let sensor = SensorGeometry {
            rows: 8,
            cols: 8,
            bytes_per_pixel: 2,
            bayer_tile: Some(BayerTile::Bggr),
        };
        let mut bufs = FrameBuffers::allocate(sensor).unwrap();
        let frame: Vec<u8> = (0..sensor.pixels()).flat_map(|_| [200u8, 50]).collect();
        bufs.load(&frame, 7, ColorPath::Planar).unwrap();

        let right = bufs.raw_image(Camera::Right).unwrap();
        assert_eq!(right.pixel_format, PixelFormat::Rgb8);
        assert_eq!(right.data.len(), sensor.pixels() * 3);

        // a flat mosaic demosaics to flat channels away from the seam rows
        let away = 2 * sensor.cols as usize;
        let n = sensor.pixels();
        let planes = bufs.color_planes(Camera::Right).unwrap();
        assert!(planes.green[..n - away].iter().all(|&g| g == 200));
        let input = bufs.stereo_input().unwrap();
        assert!(input.right[..n - away].iter().all(|&g| g == 200));
        assert!(input.left[away..].iter().all(|&g| g == 50));

        bufs.load(&frame, 8, ColorPath::GreenOnly).unwrap();
        assert!(bufs.color_planes(Camera::Right).is_none());
        let input = bufs.stereo_input().unwrap();
        assert_eq!(input.timestamp, 8);
        assert!(input.right[..n - away].iter().all(|&g| g == 200));
        assert!(input.left[away..].iter().all(|&g| g == 50));
    }
}
