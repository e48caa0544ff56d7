//! Round-trip clock synchronization.
//!
//! ```text
//! client                        server
//!   │── ping(send) ────────────────►│
//!   │◄──────────── pong(send, srv) ─│
//!   │   rtt    = now - send         │
//!   │   offset = srv + rtt/2 - now  │
//!   │── peng(rtt) ─────────────────►│
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub rtt_ms: u64,
    /// `server - local`, in milliseconds.
    pub offset_ms: i64,
}

impl ClockSample {
    pub fn compute(client_send_ms: u64, server_ms: u64, now_ms: u64) -> Self {
        let rtt_ms = now_ms.saturating_sub(client_send_ms);
        let offset_ms = server_ms as i64 + (rtt_ms / 2) as i64 - now_ms as i64;
        Self { rtt_ms, offset_ms }
    }
}

/// Latest sample plus an exponentially smoothed offset.
#[derive(Debug, Clone)]
pub struct ClockSync {
    latest: Option<ClockSample>,
    smoothed: Option<f64>,
    alpha: f64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(0.25)
    }
}

impl ClockSync {
    /// `alpha` is the weight of a new sample, in `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        Self { latest: None, smoothed: None, alpha: alpha.clamp(f64::EPSILON, 1.0) }
    }

    pub fn on_pong(&mut self, client_send_ms: u64, server_ms: u64, now_ms: u64) -> ClockSample {
        let sample = ClockSample::compute(client_send_ms, server_ms, now_ms);
        let offset = sample.offset_ms as f64;
        self.smoothed = Some(match self.smoothed {
            Some(s) => s + self.alpha * (offset - s),
            None => offset,
        });
        self.latest = Some(sample);
        sample
    }

    pub fn latest(&self) -> Option<ClockSample> {
        self.latest
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.latest.map(|s| s.rtt_ms)
    }

    /// Smoothed offset, 0 before the first sample.
    pub fn offset_ms(&self) -> i64 {
        self.smoothed.map(|s| s.round() as i64).unwrap_or(0)
    }

    /// Convert a server timestamp embedded in a message to local time.
    pub fn server_to_local(&self, server_ms: u64) -> u64 {
        (server_ms as i64 - self.offset_ms()).max(0) as u64
    }

    pub fn local_to_server(&self, local_ms: u64) -> u64 {
        (local_ms as i64 + self.offset_ms()).max(0) as u64
    }

    pub fn reset(&mut self) {
        self.latest = None;
        self.smoothed = None;
    }
}
