//! Irrigation recommendation: the classifier decides ON/OFF, a small rule
//! table picks the operator-facing message.

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::classifier::Classifier;
use crate::db::PumpStatus;

/// Below this soil moisture the soil is reported as too dry.
pub const DRY_SOIL_PERCENT: i64 = 30;
/// Below this pH the soil is reported as too acidic.
pub const ACIDIC_PH: f64 = 5.0;

pub const MSG_AWAITING_DATA: &str = "Awaiting data...";
pub const MSG_SOIL_DRY: &str = "Soil too dry, pump recommended.";
pub const MSG_PH_ACIDIC: &str = "pH too acidic, pump recommended.";
pub const MSG_PUMP_ON: &str = "Pump recommended.";
pub const MSG_SAFE: &str = "Conditions safe, saving water.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Suggestion {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub suggestion: Suggestion,
    pub message: String,
    pub is_critical: bool,
}

impl Recommendation {
    pub fn awaiting_data() -> Self {
        Self {
            suggestion: Suggestion::Unknown,
            message: MSG_AWAITING_DATA.to_string(),
            is_critical: false,
        }
    }

    /// Nothing has been received yet, so there is nothing to water.
    pub fn no_reading() -> Self {
        Self {
            suggestion: Suggestion::Off,
            message: MSG_AWAITING_DATA.to_string(),
            is_critical: false,
        }
    }
}

#[derive(Clone)]
pub struct DecisionEngine {
    classifier: Option<Arc<dyn Classifier>>,
}

impl DecisionEngine {
    pub fn new(classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self { classifier }
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Stateless per call. Classifier failures degrade to UNKNOWN.
    pub fn recommend(&self, ph: f64, soil_percent: i64) -> Recommendation {
        let Some(classifier) = &self.classifier else {
            return Recommendation::awaiting_data();
        };

        match classifier.predict(ph, soil_percent) {
            Ok(PumpStatus::On) => Recommendation {
                suggestion: Suggestion::On,
                message: on_message(ph, soil_percent).to_string(),
                is_critical: true,
            },
            Ok(PumpStatus::Off) => Recommendation {
                suggestion: Suggestion::Off,
                message: MSG_SAFE.to_string(),
                is_critical: false,
            },
            Err(e) => {
                warn!(ph, soil_percent, "classifier failed, suggestion unknown: {e}");
                Recommendation::awaiting_data()
            }
        }
    }
}

/// First matching rule wins; dryness outranks acidity.
fn on_message(ph: f64, soil_percent: i64) -> &'static str {
    if soil_percent < DRY_SOIL_PERCENT {
        MSG_SOIL_DRY
    } else if ph < ACIDIC_PH {
        MSG_PH_ACIDIC
    } else {
        MSG_PUMP_ON
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::{FailingClassifier, FixedClassifier};

    fn engine(answer: PumpStatus) -> DecisionEngine {
        DecisionEngine::new(Some(Arc::new(FixedClassifier(answer))))
    }

    #[test]
    fn dry_and_acidic_reports_dryness() {
        let r = engine(PumpStatus::On).recommend(4.5, 20);
        assert_eq!(r.suggestion, Suggestion::On);
        assert_eq!(r.message, MSG_SOIL_DRY);
        assert!(r.is_critical);
    }

    #[test]
    fn acidic_only_reports_acidity() {
        let r = engine(PumpStatus::On).recommend(4.5, 50);
        assert_eq!(r.suggestion, Suggestion::On);
        assert_eq!(r.message, MSG_PH_ACIDIC);
        assert!(r.is_critical);
    }

    #[test]
    fn on_without_rule_match_is_generic() {
        let r = engine(PumpStatus::On).recommend(6.5, 50);
        assert_eq!(r.message, MSG_PUMP_ON);
        assert!(r.is_critical);
    }

    #[test]
    fn rule_thresholds_are_strict() {
        let e = engine(PumpStatus::On);
        assert_eq!(e.recommend(5.0, 30).message, MSG_PUMP_ON);
        assert_eq!(e.recommend(4.99, 30).message, MSG_PH_ACIDIC);
        assert_eq!(e.recommend(7.0, 29).message, MSG_SOIL_DRY);
    }

    #[test]
    fn off_is_safe_and_not_critical() {
        // rules only apply to ON; a dry reading classified OFF stays OFF
        let r = engine(PumpStatus::Off).recommend(4.5, 20);
        assert_eq!(r.suggestion, Suggestion::Off);
        assert_eq!(r.message, MSG_SAFE);
        assert!(!r.is_critical);
    }

    #[test]
    fn no_classifier_is_unknown() {
        let e = DecisionEngine::new(None);
        assert!(!e.has_classifier());
        for (ph, soil) in [(4.5, 20), (7.0, 80), (0.0, 0)] {
            let r = e.recommend(ph, soil);
            assert_eq!(r.suggestion, Suggestion::Unknown);
            assert_eq!(r.message, MSG_AWAITING_DATA);
            assert!(!r.is_critical);
        }
    }

    #[test]
    fn classifier_error_degrades_to_unknown() {
        let e = DecisionEngine::new(Some(Arc::new(FailingClassifier)));
        let r = e.recommend(f64::NAN, 10);
        assert_eq!(r, Recommendation::awaiting_data());
    }

    #[test]
    fn serializes_for_api() {
        let json = serde_json::to_value(engine(PumpStatus::On).recommend(4.5, 20)).unwrap();
        assert_eq!(json["suggestion"], "ON");
        assert_eq!(json["is_critical"], true);
    }
}
