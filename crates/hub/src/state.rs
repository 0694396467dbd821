use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::db::NewReading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral runtime state. Telemetry itself lives in the database; this
/// only tracks transport health and a short event log for operators.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub stored_readings: Option<i64>,
    pub classifier_loaded: bool,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a persisted telemetry reading.
    pub fn record_reading(&mut self, id: i64, r: &NewReading) {
        self.push_event(
            EventKind::Reading,
            format!(
                "#{id} {}: ph={:.2} soil={}% adc={} pump={}",
                r.device_id,
                r.ph,
                r.soil_percent,
                r.soil_adc,
                r.pump_status.as_str()
            ),
        );
    }

    /// Record an operator command sent to the device.
    pub fn record_command(&mut self, action: &str) {
        self.push_event(EventKind::Command, format!("pump command {action} sent"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self, stored_readings: Option<i64>, classifier_loaded: bool) -> StatusResponse {
        StatusResponse {
            status: "online",
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            stored_readings,
            classifier_loaded,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PumpStatus;

    #[test]
    fn events_are_capped() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("hub started".into());
        st.record_command("ON");

        let status = st.to_status(Some(3), true);
        assert_eq!(status.events.len(), 2);
        assert_eq!(status.events[0].kind, EventKind::Command);
        assert_eq!(status.stored_readings, Some(3));
        assert!(!status.mqtt_connected);
    }

    #[test]
    fn reading_event_describes_sample() {
        let mut st = SystemState::new();
        st.record_reading(
            7,
            &NewReading {
                device_id: "ESP32".into(),
                ph: 6.25,
                soil_percent: 41,
                soil_adc: 2300,
                pump_status: PumpStatus::On,
            },
        );
        let ev = st.events.back().unwrap();
        assert_eq!(ev.kind, EventKind::Reading);
        assert_eq!(ev.detail, "#7 ESP32: ph=6.25 soil=41% adc=2300 pump=ON");
    }
}
