//! Round-trip latency bookkeeping for heartbeat replies.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

use crate::core::variant::QDateTime;

#[derive(Debug, Default)]
struct HeartBeatState {
    last_received: Option<DateTime<Utc>>,
    latency: Option<Duration>,
}

/// Tracks when the core last answered and how long that took.
#[derive(Debug, Default)]
pub struct HeartBeatHandler {
    state: Mutex<HeartBeatState>,
}

impl HeartBeatHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the core echoed a heartbeat stamped `sent`.
    ///
    /// Timestamps without a UTC anchor (local time without zone) are
    /// interpreted as UTC, which is what Quassel cores send in practice.
    pub fn recompute_latency(&self, sent: &QDateTime) {
        let now = Utc::now();
        let sent = sent
            .to_utc()
            .unwrap_or_else(|| sent.naive_local().and_utc());
        // A core with a skewed clock can make this negative.
        let latency = (now - sent).to_std().unwrap_or(Duration::ZERO);

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_received = Some(now);
        state.latency = Some(latency);
        debug!(latency_ms = latency.as_millis() as u64, "Heartbeat latency updated");
    }

    /// Note an incoming heartbeat from the core.
    pub fn received(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_received = Some(Utc::now());
        trace!("Heartbeat received");
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).latency
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_received
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn latency_is_measured_from_the_echoed_stamp() {
        let handler = HeartBeatHandler::new();
        assert!(handler.latency().is_none());

        let sent = QDateTime::Utc(Utc::now() - chrono::Duration::milliseconds(250));
        handler.recompute_latency(&sent);

        let latency = handler.latency().unwrap();
        assert!(latency >= Duration::from_millis(250));
        assert!(latency < Duration::from_secs(5));
        assert!(handler.last_received().is_some());
    }

    #[test]
    fn future_stamps_clamp_to_zero() {
        let handler = HeartBeatHandler::new();
        let sent = QDateTime::Utc(Utc::now() + chrono::Duration::seconds(60));
        handler.recompute_latency(&sent);
        assert_eq!(handler.latency(), Some(Duration::ZERO));
    }
}
