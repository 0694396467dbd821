//! Stateful field simulator for local development.
//!
//! Models one ESP32 field device:
//! - Soil moisture as a random walk with mean reversion and drying drift
//! - Closed-loop watering response (moisture rises while the pump is on)
//! - pH wandering slowly around a scenario-dependent centre
//! - Capacitive sensor ADC derived from soil percent, with electronic noise

use std::fmt;

/// 12-bit ADC reading of the capacitive probe in bone-dry soil.
pub const SOIL_ADC_DRY: f64 = 3000.0;
/// 12-bit ADC reading of the probe in saturated soil.
pub const SOIL_ADC_WET: f64 = 1200.0;
const ADC_MAX: f64 = 4095.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries out steadily. Neutral pH.
    Drying,
    /// Hovers around 50% with little noise. Good for watching the UI
    /// without triggering pump recommendations.
    Stable,
    /// Moist soil but pH drifting below 5. Exercises the acidity message.
    Acidic,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "acidic" => Self::Acidic,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Acidic => write!(f, "acidic"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

struct Profile {
    start_soil: f64,
    soil_center: f64,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    ph_center: f64,
    ph_sigma: f64,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Drying => Self {
                start_soil: 55.0,
                soil_center: 20.0,
                drift: -1.2,
                walk_sigma: 1.0,
                mean_reversion: 0.01,
                ph_center: 6.8,
                ph_sigma: 0.05,
            },
            Scenario::Stable => Self {
                start_soil: 50.0,
                soil_center: 50.0,
                drift: 0.0,
                walk_sigma: 0.5,
                mean_reversion: 0.1,
                ph_center: 6.5,
                ph_sigma: 0.03,
            },
            Scenario::Acidic => Self {
                start_soil: 60.0,
                soil_center: 55.0,
                drift: -0.2,
                walk_sigma: 0.8,
                mean_reversion: 0.05,
                ph_center: 4.6,
                ph_sigma: 0.08,
            },
            Scenario::Wet => Self {
                start_soil: 85.0,
                soil_center: 75.0,
                drift: -0.2,
                walk_sigma: 0.6,
                mean_reversion: 0.02,
                ph_center: 7.0,
                ph_sigma: 0.04,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// One instantaneous sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ph: f64,
    pub soil_percent: i64,
    pub soil_adc: i64,
}

pub struct FieldSim {
    profile: Profile,
    soil: f64,
    ph: f64,
    pump_on: bool,
    /// Soil percent gained per tick while the pump runs.
    wet_rate: f64,
    adc_noise_sigma: f64,
}

impl FieldSim {
    pub fn new(scenario: Scenario) -> Self {
        let profile = Profile::for_scenario(scenario);
        Self {
            soil: profile.start_soil,
            ph: profile.ph_center,
            profile,
            pump_on: false,
            wet_rate: 6.0,
            adc_noise_sigma: 15.0,
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    /// Advance one tick and return the reading the device would publish.
    pub fn step(&mut self) -> Sample {
        let p = &self.profile;

        let pull = p.mean_reversion * (p.soil_center - self.soil);
        let walk = gaussian(0.0, p.walk_sigma);
        let wet = if self.pump_on { self.wet_rate } else { 0.0 };
        self.soil = (self.soil + p.drift + pull + walk + wet).clamp(0.0, 100.0);

        // pH reverts hard toward its centre; it barely moves in a few minutes.
        let ph_pull = 0.2 * (p.ph_center - self.ph);
        self.ph = (self.ph + ph_pull + gaussian(0.0, p.ph_sigma)).clamp(0.0, 14.0);

        let soil_percent = self.soil.round() as i64;
        Sample {
            ph: (self.ph * 100.0).round() / 100.0,
            soil_percent,
            soil_adc: soil_adc(soil_percent, gaussian(0.0, self.adc_noise_sigma)),
        }
    }
}

/// Inverse of the device's calibration map: dry soil reads high, wet soil low.
pub fn soil_adc(soil_percent: i64, noise: f64) -> i64 {
    let frac = soil_percent.clamp(0, 100) as f64 / 100.0;
    let raw = SOIL_ADC_DRY - frac * (SOIL_ADC_DRY - SOIL_ADC_WET) + noise;
    raw.round().clamp(0.0, ADC_MAX) as i64
}

// ===========================================================================
// Tests
// ===========================================================================
