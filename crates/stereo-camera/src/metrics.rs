use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct CaptureCounters {
    pub frames_captured: IntCounter,
    /// Queued frames discarded by poll-and-discard.
    pub frames_dropped: IntCounter,
    pub empty_polls: IntCounter,
    pub pipeline_failures: IntCounter,
    pub session_live: IntGauge,
}

#[derive(Clone)]
pub struct CaptureMetrics {
    pub registry: Registry,
    pub capture: CaptureCounters,
}

impl CaptureMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
        };
        let capture = CaptureCounters {
            frames_captured: counter("stereo_frames_captured", "Frames successfully captured")?,
            frames_dropped: counter(
                "stereo_frames_dropped",
                "Queued frames discarded in favour of a newer one",
            )?,
            empty_polls: counter("stereo_empty_polls", "Captures that found no queued frame")?,
            pipeline_failures: counter(
                "stereo_pipeline_failures",
                "Captures aborted by demosaic, rectification or matching",
            )?,
            session_live: IntGauge::new("stereo_session_live", "1 while a device is held")
                .map_err(|e| format!("metrics init error: {e}"))?,
        };
        let _ = registry.register(Box::new(capture.frames_captured.clone()));
        let _ = registry.register(Box::new(capture.frames_dropped.clone()));
        let _ = registry.register(Box::new(capture.empty_polls.clone()));
        let _ = registry.register(Box::new(capture.pipeline_failures.clone()));
        let _ = registry.register(Box::new(capture.session_live.clone()));
        Ok(Self { registry, capture })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        let m = CaptureMetrics::new().unwrap();
        m.capture.frames_captured.inc();
        m.capture.frames_dropped.inc_by(3);
        let text = m.encode_text();
        assert!(text.contains("stereo_frames_captured 1"));
        assert!(text.contains("stereo_frames_dropped 3"));
    }
}
