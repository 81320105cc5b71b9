use std::time::Instant;

/// Per-request stream timing, fed into the Prometheus histograms when the
/// stream finishes.
#[derive(Debug, Clone)]
pub struct StreamTimings {
    pub request_start: Instant,
    pub first_event_time: Option<Instant>,
    pub ttft_ms: Option<u128>,
}

impl StreamTimings {
    pub fn new() -> Self {
        Self {
            request_start: Instant::now(),
            first_event_time: None,
            ttft_ms: None,
        }
    }

    pub fn record_first_event(&mut self) {
        if self.first_event_time.is_none() {
            self.first_event_time = Some(Instant::now());
            self.ttft_ms = Some(self.request_start.elapsed().as_millis());
        }
    }
}

impl Default for StreamTimings {
    fn default() -> Self {
        Self::new()
    }
}
