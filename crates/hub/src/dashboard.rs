//! Assembled operator view of the newest reading. Computed fresh on every
//! request; nothing here is cached.

use serde::Serialize;
use time::OffsetDateTime;

use crate::db::{PumpStatus, Reading};
use crate::decision::{DecisionEngine, Recommendation};
use crate::liveness::{DeviceStatus, LivenessDetector};
use crate::mqtt::DEFAULT_DEVICE_ID;

/// Neutral pH reported before any reading exists.
const DEFAULT_PH: f64 = 7.0;

#[derive(Debug, Serialize)]
pub struct DashboardView {
    pub device_id: String,
    pub reading_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub sensor: SensorView,
    pub pump_status: PumpStatus,
    pub device_status: DeviceStatus,
    pub recommendation: Recommendation,
}

#[derive(Debug, Serialize)]
pub struct SensorView {
    pub ph: f64,
    pub soil_percent: i64,
    pub soil_adc: i64,
}

pub fn assemble(
    latest: Option<&Reading>,
    now: i64,
    liveness: &LivenessDetector,
    engine: &DecisionEngine,
) -> DashboardView {
    let device_status = liveness.evaluate(latest.map(|r| r.captured_at), now);

    match latest {
        Some(r) => DashboardView {
            device_id: r.device_id.clone(),
            reading_id: Some(r.id),
            timestamp: OffsetDateTime::from_unix_timestamp(r.captured_at).ok(),
            sensor: SensorView {
                ph: r.ph,
                soil_percent: r.soil_percent,
                soil_adc: r.soil_adc,
            },
            pump_status: r.pump_status,
            device_status,
            recommendation: engine.recommend(r.ph, r.soil_percent),
        },
        None => DashboardView {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            reading_id: None,
            timestamp: None,
            sensor: SensorView {
                ph: DEFAULT_PH,
                soil_percent: 0,
                soil_adc: 0,
            },
            pump_status: PumpStatus::Off,
            device_status,
            recommendation: Recommendation::no_reading(),
        },
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::FixedClassifier;
    use crate::decision::{Suggestion, MSG_AWAITING_DATA, MSG_PH_ACIDIC};
    use crate::liveness::{Liveness, NO_READING};
    use std::sync::Arc;
    use std::time::Duration;

    const NOW: i64 = 1_760_000_000;

    fn detector() -> LivenessDetector {
        LivenessDetector::new(Duration::from_secs(30))
    }

    fn engine_on() -> DecisionEngine {
        DecisionEngine::new(Some(Arc::new(FixedClassifier(PumpStatus::On))))
    }

    fn stored(captured_at: i64) -> Reading {
        Reading {
            id: 12,
            device_id: "ESP32-north".into(),
            ph: 4.5,
            soil_percent: 50,
            soil_adc: 1900,
            pump_status: PumpStatus::On,
            captured_at,
        }
    }

    #[test]
    fn empty_store_shows_defaults() {
        let view = assemble(None, NOW, &detector(), &engine_on());
        assert_eq!(view.device_id, "ESP32");
        assert_eq!(view.reading_id, None);
        assert_eq!(view.sensor.ph, 7.0);
        assert_eq!(view.pump_status, PumpStatus::Off);
        assert_eq!(view.device_status.status, Liveness::Offline);
        assert_eq!(view.device_status.seconds_since_last_reading, NO_READING);
        // nothing to classify; OFF keeps this distinct from "no classifier"
        assert_eq!(view.recommendation.suggestion, Suggestion::Off);
        assert_eq!(view.recommendation.message, MSG_AWAITING_DATA);
        assert!(!view.recommendation.is_critical);
    }

    #[test]
    fn empty_store_without_classifier_is_also_off() {
        let view = assemble(None, NOW, &detector(), &DecisionEngine::new(None));
        assert_eq!(view.recommendation, Recommendation::no_reading());
    }

    #[test]
    fn reading_without_classifier_is_unknown() {
        let r = stored(NOW - 5);
        let view = assemble(Some(&r), NOW, &detector(), &DecisionEngine::new(None));
        assert_eq!(view.recommendation.suggestion, Suggestion::Unknown);
    }

    #[test]
    fn fresh_reading_is_online_and_classified() {
        let r = stored(NOW - 10);
        let view = assemble(Some(&r), NOW, &detector(), &engine_on());
        assert_eq!(view.device_id, "ESP32-north");
        assert_eq!(view.reading_id, Some(12));
        assert_eq!(view.device_status.status, Liveness::Online);
        assert_eq!(view.device_status.seconds_since_last_reading, 10);
        assert_eq!(view.recommendation.message, MSG_PH_ACIDIC);
        assert!(view.recommendation.is_critical);
    }

    #[test]
    fn stale_reading_still_gets_recommendation() {
        let r = stored(NOW - 31);
        let view = assemble(Some(&r), NOW, &detector(), &engine_on());
        assert_eq!(view.device_status.status, Liveness::Offline);
        assert_eq!(view.device_status.seconds_since_last_reading, 31);
        assert_eq!(view.recommendation.suggestion, Suggestion::On);
    }

    #[test]
    fn serializes_timestamp_as_rfc3339() {
        let r = stored(0);
        let json = serde_json::to_value(assemble(Some(&r), NOW, &detector(), &engine_on())).unwrap();
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(json["sensor"]["soil_adc"], 1900);
        assert_eq!(json["pump_status"], "ON");

        let json = serde_json::to_value(assemble(None, NOW, &detector(), &engine_on())).unwrap();
        assert!(json["timestamp"].is_null());
    }
}
