use crate::{Error, Result};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Owned copy of an image product, detached from the session buffers.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
    pub ts: Option<OffsetDateTime>,
}

/// Serial number of a physical camera plus the calibration file named after it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdentity {
    id: u32,
    calibration_file: PathBuf,
}

impl DeviceIdentity {
    /// Identity whose calibration file `<id>.cal` lives in the working directory.
    pub fn new(id: u32) -> Self {
        Self::with_calibration_dir(id, Path::new("."))
    }

    pub fn with_calibration_dir(id: u32, dir: impl AsRef<Path>) -> Self {
        Self {
            id,
            calibration_file: dir.as_ref().join(format!("{id}.cal")),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn calibration_file(&self) -> &Path {
        &self.calibration_file
    }
}

/// Camera selector. `Reference` is the right camera of the pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Camera {
    Reference,
    Left,
    Right,
}

impl Camera {
    pub(crate) fn is_right(self) -> bool {
        matches!(self, Camera::Reference | Camera::Right)
    }
}

/// Color filter array layout of a color sensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BayerTile {
    Rggb,
    Gbrg,
    Grbg,
    Bggr,
}

/// Frame geometry reported by the device during bring-up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SensorGeometry {
    pub rows: u32,
    pub cols: u32,
    /// 2 for a stereo pair, 3 for a trinocular head.
    pub bytes_per_pixel: u32,
    /// `Some` for color sensors.
    pub bayer_tile: Option<BayerTile>,
}

impl SensorGeometry {
    pub fn is_color(&self) -> bool {
        self.bayer_tile.is_some()
    }

    /// Pixels in one sensor image.
    pub fn pixels(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Bytes in one packed frame as delivered by the bus.
    pub fn frame_bytes(&self) -> usize {
        self.pixels() * self.bytes_per_pixel as usize
    }
}

/// One packed frame dequeued from the device.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Vec<u8>,
    /// Device clock, microseconds.
    pub timestamp: u64,
}

/// Calibrated geometry of the rectified output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryModel {
    pub focal_length: f32,
    pub center_row: f32,
    pub center_col: f32,
    /// Radians.
    pub hfov: f32,
    /// Radians.
    pub vfov: f32,
    pub baseline: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Read-only view of a single-channel image.
///
/// Views borrow the session and therefore cannot outlive the next capture.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a, T> {
    pub rows: usize,
    pub cols: usize,
    /// Row stride in elements.
    pub rowinc: usize,
    pub data: &'a [T],
}

impl<'a, T: Copy> ImageView<'a, T> {
    pub fn new(rows: usize, cols: usize, rowinc: usize, data: &'a [T]) -> Self {
        Self {
            rows,
            cols,
            rowinc,
            data,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        if row >= self.rows || col >= self.cols {
            return Err(Error::OutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        self.data
            .get(row * self.rowinc + col)
            .copied()
            .ok_or(Error::OutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            })
    }

    pub fn row(&self, row: usize) -> Option<&'a [T]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.rowinc;
        self.data.get(start..start + self.cols)
    }

    /// Copy rows into `out` without stride padding. Returns the number of elements written.
    pub fn copy_to(&self, out: &mut [T]) -> Result<usize> {
        let needed = self.rows * self.cols;
        if out.len() < needed {
            return Err(Error::BufferTooSmall {
                needed: needed * std::mem::size_of::<T>(),
                got: out.len() * std::mem::size_of::<T>(),
            });
        }
        for r in 0..self.rows {
            let src = self.row(r).ok_or(Error::ProductUnavailable("image row"))?;
            out[r * self.cols..(r + 1) * self.cols].copy_from_slice(src);
        }
        Ok(needed)
    }

    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            if let Some(src) = self.row(r) {
                out.extend_from_slice(src);
            }
        }
        out
    }
}

/// Rectified color image held as three planes.
#[derive(Clone, Copy, Debug)]
pub struct ColorView<'a> {
    pub rows: usize,
    pub cols: usize,
    pub red: &'a [u8],
    pub green: &'a [u8],
    pub blue: &'a [u8],
}

impl ColorView<'_> {
    pub fn pixel(&self, row: usize, col: usize) -> Result<[u8; 3]> {
        let oob = Error::OutOfBounds {
            row,
            col,
            rows: self.rows,
            cols: self.cols,
        };
        if row >= self.rows || col >= self.cols {
            return Err(oob);
        }
        let idx = row * self.cols + col;
        match (self.red.get(idx), self.green.get(idx), self.blue.get(idx)) {
            (Some(&r), Some(&g), Some(&b)) => Ok([r, g, b]),
            _ => Err(oob),
        }
    }

    /// Interleave into packed RGB. Returns the number of bytes written.
    pub fn copy_interleaved(&self, out: &mut [u8]) -> Result<usize> {
        let n = self.rows * self.cols;
        if out.len() < n * 3 {
            return Err(Error::BufferTooSmall {
                needed: n * 3,
                got: out.len(),
            });
        }
        if self.red.len() < n || self.green.len() < n || self.blue.len() < n {
            return Err(Error::ProductUnavailable("color planes"));
        }
        for (i, px) in out[..n * 3].chunks_exact_mut(3).enumerate() {
            px[0] = self.red[i];
            px[1] = self.green[i];
            px[2] = self.blue[i];
        }
        Ok(n * 3)
    }
}

/// Input descriptor handed to the stereo backend: two 8-bit planes at raw resolution.
#[derive(Clone, Copy, Debug)]
pub struct StereoInput<'a> {
    pub rows: usize,
    pub cols: usize,
    pub rowinc: usize,
    pub right: &'a [u8],
    pub left: &'a [u8],
    pub timestamp: u64,
}

/// One camera's demosaiced color planes at raw resolution.
#[derive(Clone, Copy, Debug)]
pub struct ColorPlanes<'a> {
    pub rows: usize,
    pub cols: usize,
    pub red: &'a [u8],
    pub green: &'a [u8],
    pub blue: &'a [u8],
}

/// Which products a capture produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaptureKind {
    /// Rectified pair plus disparity.
    Stereo,
    /// Rectified pair only, low-pass filtered.
    Rectified,
    /// De-interlaced raw images only.
    Raw,
}

/// Summary of one successful capture.
#[derive(Clone, Copy, Debug)]
pub struct CaptureInfo {
    pub kind: CaptureKind,
    /// Device clock, microseconds.
    pub timestamp: u64,
    pub host_time: OffsetDateTime,
    /// Older queued frames returned to the device unread.
    pub dropped: usize,
    pub color: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_file_is_named_after_the_id() {
        let id = DeviceIdentity::with_calibration_dir(6021014, "/etc/cams");
        assert_eq!(id.calibration_file(), Path::new("/etc/cams/6021014.cal"));
        assert_eq!(DeviceIdentity::new(7).calibration_file(), Path::new("./7.cal"));
    }

    #[test]
    fn view_respects_row_stride() {
        // 2x3 image stored with a stride of 4
        let data = [1u8, 2, 3, 0, 4, 5, 6, 0];
        let view = ImageView::new(2, 3, 4, &data);
        assert_eq!(view.get(1, 2).unwrap(), 6);
        assert_eq!(view.to_vec(), vec![1, 2, 3, 4, 5, 6]);
        assert!(matches!(view.get(2, 0), Err(Error::OutOfBounds { .. })));

        let mut small = [0u8; 5];
        assert!(matches!(
            view.copy_to(&mut small),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn color_view_interleaves() {
        let (r, g, b) = ([1u8, 2], [3u8, 4], [5u8, 6]);
        let view = ColorView {
            rows: 1,
            cols: 2,
            red: &r,
            green: &g,
            blue: &b,
        };
        let mut out = [0u8; 6];
        assert_eq!(view.copy_interleaved(&mut out).unwrap(), 6);
        assert_eq!(out, [1, 3, 5, 2, 4, 6]);
        assert_eq!(view.pixel(0, 1).unwrap(), [2, 4, 6]);
    }
}
