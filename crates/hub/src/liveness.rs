//! Device liveness: ONLINE while the newest reading is younger than the
//! configured threshold.

use serde::Serialize;
use std::time::Duration;

/// Reported as `seconds_since_last_reading` when nothing was ever stored.
pub const NO_READING: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liveness {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub status: Liveness,
    pub seconds_since_last_reading: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessDetector {
    offline_after_secs: i64,
}

impl LivenessDetector {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            offline_after_secs: i64::try_from(offline_after.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Classify the device from the newest reading's capture time (unix
    /// seconds) and the current time.
    ///
    /// A capture time in the future (clock skew between store and hub)
    /// counts as zero seconds old.
    pub fn evaluate(&self, last_captured_at: Option<i64>, now: i64) -> DeviceStatus {
        let Some(last) = last_captured_at else {
            return DeviceStatus {
                status: Liveness::Offline,
                seconds_since_last_reading: NO_READING,
            };
        };

        let elapsed = now.saturating_sub(last).max(0);
        let status = if elapsed < self.offline_after_secs {
            Liveness::Online
        } else {
            Liveness::Offline
        };

        DeviceStatus {
            status,
            seconds_since_last_reading: elapsed,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
