use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use stereo_camera::{
    load_session_config, BayerTile, CaptureMetrics, MockCalibration,
    MockDeviceSpec, MockStereo, MockTransport, RecordReader, RecordWriter, SensorGeometry,
    SessionConfig, StereoCameraSession, StereoImageRecord, RECORD_SIZE, SUBPIXEL_SCALE,
};

type Session = StereoCameraSession<MockTransport, MockStereo>;

#[derive(Parser, Debug)]
#[command(
    name = "stereo",
    version,
    about = "Stereo camera capture tool",
    disable_help_subcommand = true
)]
struct Cli {
    /// Session config YAML; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Camera serial number
    #[arg(long, global = true)]
    serial: Option<u32>,

    /// Rectification/disparity downscale factor
    #[arg(long, global = true)]
    scale: Option<u32>,

    /// Capture and rectify color images (mock camera gets a Bayer sensor)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    color: bool,

    /// Exposure in seconds
    #[arg(long, global = true)]
    shutter: Option<f32>,

    /// Mock sensor size as COLSxROWS
    #[arg(long, default_value = "160x120", global = true)]
    sensor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    /// Rectify and compute disparity
    Full,
    /// Low-pass and rectify only
    Rectify,
    /// De-interlace only
    Raw,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the camera and print its geometry
    Info {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Run a capture loop and report statistics
    Capture {
        #[arg(long, value_enum, default_value = "full")]
        mode: Mode,
        /// Number of capture attempts
        #[arg(long, default_value_t = 30u32)]
        count: u32,
        /// Disparity search range as MIN:MAX
        #[arg(long)]
        disparity: Option<String>,
        /// Print Prometheus metrics at the end
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Write raw frame pairs to a record log
    Record {
        #[arg(long)]
        out: PathBuf,
        /// Number of records to write
        #[arg(long, default_value_t = 10u32)]
        count: u32,
    },
    /// Print the headers of a record log
    Playback {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

#[derive(Serialize)]
struct InfoReport {
    serial: u32,
    color: bool,
    scale: u32,
    image: (u32, u32),
    rectified: (usize, usize),
    focal_length: f32,
    center: (f32, f32),
    hfov_deg: f32,
    vfov_deg: f32,
    baseline_m: f32,
    shutter_s: f32,
    gain: f32,
}

#[derive(Serialize)]
struct PlaybackLine {
    frame_id: i32,
    timestamp: u64,
    cols: i32,
    rows: i32,
    channels: i32,
    shutter: f32,
    gain: f32,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Info { json } => info_cmd(&cli, *json),
        Commands::Capture {
            mode,
            count,
            disparity,
            metrics,
        } => capture_cmd(&cli, *mode, *count, disparity.as_deref(), *metrics),
        Commands::Record { out, count } => record_cmd(&cli, out, *count),
        Commands::Playback { input, json } => playback_cmd(input, *json),
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_pair<T: std::str::FromStr>(s: &str, sep: char, what: &str) -> Result<(T, T)> {
    let (a, b) = s
        .split_once(sep)
        .ok_or_else(|| anyhow!("{what} must look like A{sep}B, got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<T>()
            .map_err(|_| anyhow!("invalid {what} component '{v}'"))
    };
    Ok((parse(a)?, parse(b)?))
}

fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let mut cfg = match &cli.config {
        Some(path) => load_session_config(path)?,
        None => SessionConfig::new(cli.serial.unwrap_or(6021014)),
    };
    if let Some(serial) = cli.serial {
        cfg.device_id = serial;
    }
    if let Some(scale) = cli.scale {
        cfg.capture.downscale = scale;
    }
    if cli.color {
        cfg.capture.color = true;
    }
    if let Some(shutter) = cli.shutter {
        cfg.shutter_s = shutter;
    }
    Ok(cfg)
}

/// Mock bus holding the configured camera, and a mock engine serving its calibration.
fn open_session(cli: &Cli, cfg: &SessionConfig) -> Result<Session> {
    let (cols, rows) = parse_pair::<u32>(&cli.sensor, 'x', "sensor size")?;
    let sensor = SensorGeometry {
        rows,
        cols,
        bytes_per_pixel: 2,
        bayer_tile: cfg.capture.color.then_some(BayerTile::Rggb),
    };
    let spec = MockDeviceSpec::stereo_pair(cfg.device_id).with_sensor(sensor);
    let identity = cfg.identity();
    let stereo = MockStereo::new().with_calibration(
        identity.calibration_file(),
        MockCalibration::for_sensor(&sensor),
    );
    Ok(Session::from_config(cfg, MockTransport::new(vec![spec]), stereo))
}

fn initialized(cli: &Cli) -> Result<(Session, SessionConfig)> {
    let cfg = session_config(cli)?;
    let mut session = open_session(cli, &cfg)?;
    session
        .initialize(cfg.shutter_s)
        .with_context(|| format!("initializing camera {}", cfg.device_id))?;
    Ok((session, cfg))
}

fn info_cmd(cli: &Cli, json: bool) -> Result<()> {
    let (mut session, cfg) = initialized(cli)?;
    let g = session.geometry()?;
    let report = InfoReport {
        serial: cfg.device_id,
        color: session.is_color()?,
        scale: session.scale(),
        image: session.image_size()?,
        rectified: session.rectified_size()?,
        focal_length: g.focal_length,
        center: (g.center_row, g.center_col),
        hfov_deg: g.hfov.to_degrees(),
        vfov_deg: g.vfov.to_degrees(),
        baseline_m: g.baseline,
        shutter_s: session.shutter()?,
        gain: session.gain()?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "camera {}: {}x{} {} | rectified {}x{} (scale {})",
            report.serial,
            report.image.0,
            report.image.1,
            if report.color { "color" } else { "mono" },
            report.rectified.0,
            report.rectified.1,
            report.scale
        );
        println!(
            "focal {:.2}px center ({:.1}, {:.1}) fov {:.1}x{:.1} deg baseline {:.3}m",
            report.focal_length,
            report.center.0,
            report.center.1,
            report.hfov_deg,
            report.vfov_deg,
            report.baseline_m
        );
        println!("shutter {:.4}s gain {:.2}", report.shutter_s, report.gain);
    }
    session.teardown()?;
    Ok(())
}

fn capture_cmd(
    cli: &Cli,
    mode: Mode,
    count: u32,
    disparity: Option<&str>,
    metrics: bool,
) -> Result<()> {
    let cfg = session_config(cli)?;
    let metrics_reg = CaptureMetrics::new().map_err(|e| anyhow!(e))?;
    let mut session = open_session(cli, &cfg)?.with_metrics(metrics_reg);
    session
        .initialize(cfg.shutter_s)
        .with_context(|| format!("initializing camera {}", cfg.device_id))?;
    if let Some(spec) = disparity {
        let (min, max) = parse_pair::<i32>(spec, ':', "disparity range")?;
        session.set_disparity(min, max)?;
    }

    let started = Instant::now();
    let (mut ok, mut failed) = (0u32, 0u32);
    let mut last = None;
    for _ in 0..count {
        let result = match mode {
            Mode::Full => session.capture(),
            Mode::Rectify => session.capture_rectified(),
            Mode::Raw => session.capture_raw(),
        };
        match result {
            Ok(info) => {
                ok += 1;
                last = Some(info);
            }
            Err(e) if e.is_transient() => failed += 1,
            Err(e) => return Err(e.into()),
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    let fps = if elapsed > 0.0 { ok as f64 / elapsed } else { 0.0 };
    println!("{ok} captured, {failed} skipped in {elapsed:.2}s ({fps:.1} fps)");

    if let Some(info) = last {
        let host = info.host_time.format(&Rfc3339).unwrap_or_default();
        println!(
            "last frame: ts={} host={} dropped={} color={}",
            info.timestamp, host, info.dropped, info.color
        );
        if mode == Mode::Full {
            if let Some(line) = center_depth_line(&session) {
                println!("{line}");
            }
        }
    }
    if metrics {
        if let Some(m) = session.metrics() {
            print!("{}", m.encode_text());
        }
    }
    session.teardown()?;
    Ok(())
}

/// Depth at the center of the last disparity map, with the range the session searched.
fn center_depth_line(session: &Session) -> Option<String> {
    let range = session.config().disparity;
    let disp = session.disparity_image().ok()?;
    let (row, col) = (disp.rows / 2, disp.cols / 2);
    let d = disp.get(row, col).ok()?;
    let line = match session.disparity_to_xyz(row as i32, col as i32, d) {
        Ok(p) => format!(
            "center ({row}, {col}) disparity {:.2} (range {}..{}) -> xyz ({:.3}, {:.3}, {:.3})",
            d as f32 / SUBPIXEL_SCALE,
            range.min,
            range.max,
            p.x,
            p.y,
            p.z
        ),
        Err(e) => format!(
            "center ({row}, {col}) (range {}..{}): {e}",
            range.min, range.max
        ),
    };
    Some(line)
}

fn record_cmd(cli: &Cli, out: &Path, count: u32) -> Result<()> {
    let (mut session, _) = initialized(cli)?;
    let mut writer = RecordWriter::create(out)?;
    let mut record = StereoImageRecord::new();
    let mut attempts = 0u32;
    while writer.written() < u64::from(count) {
        attempts += 1;
        if attempts > count.saturating_mul(10).max(10) {
            warn!(written = writer.written(), "giving up, camera delivers too few frames");
            break;
        }
        match session.capture_record(&mut record) {
            Ok(_) => writer.append(&record)?,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let written = writer.written();
    writer.finish()?;
    session.teardown()?;
    info!(path = %out.display(), written, "record log written");
    println!(
        "{written} records ({} bytes) -> {}",
        written * RECORD_SIZE as u64,
        out.display()
    );
    Ok(())
}

fn playback_cmd(input: &Path, json: bool) -> Result<()> {
    let reader = RecordReader::open(input)
        .with_context(|| format!("opening record log {}", input.display()))?;
    let mut n = 0usize;
    for record in reader {
        let r = record?;
        let line = PlaybackLine {
            frame_id: r.frame_id,
            timestamp: r.timestamp,
            cols: r.cols,
            rows: r.rows,
            channels: r.channels,
            shutter: r.shutter,
            gain: r.gain,
        };
        if json {
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!(
                "#{:<6} ts={:<12} {}x{}x{} shutter={:.4} gain={:.2}",
                line.frame_id,
                line.timestamp,
                line.cols,
                line.rows,
                line.channels,
                line.shutter,
                line.gain
            );
        }
        n += 1;
    }
    println!("{n} records");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_session(serial: u32) -> Session {
        let cfg = SessionConfig::new(serial);
        let spec = MockDeviceSpec::stereo_pair(serial);
        let stereo = MockStereo::new().with_calibration(
            cfg.identity().calibration_file(),
            MockCalibration::for_sensor(&spec.sensor),
        );
        Session::from_config(&cfg, MockTransport::new(vec![spec]), stereo)
    }

    #[test]
    fn center_depth_reports_the_range_in_force() {
        let mut session = mock_session(6021014);
        session.initialize(stereo_camera::DEFAULT_SHUTTER_S).unwrap();
        session.set_disparity(2, 6).unwrap();
        (0..4).find_map(|_| session.capture().ok()).unwrap();
        let line = center_depth_line(&session).unwrap();
        assert!(line.contains("range 2..6"), "{line}");
        session.teardown().unwrap();
    }

    #[test]
    fn disparity_flag_parses_as_a_pair() {
        assert_eq!(parse_pair::<i32>("2:6", ':', "disparity range").unwrap(), (2, 6));
        assert!(parse_pair::<i32>("2-6", ':', "disparity range").is_err());
    }
}
