//! Battery chemistry profiles.
//!
//! BM2 monitors report a state of charge and status that are far too optimistic for
//! most batteries. A profile re-derives both from the measured voltage using a
//! voltage curve calibrated for one battery technology.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::status::BatteryStatus;

/// The battery technologies a monitor can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Chemistry {
    /// Trust whatever the monitor reports
    #[default]
    #[serde(rename = "automatic")]
    Automatic,
    #[serde(rename = "agm")]
    Agm,
    #[serde(rename = "deep-cycle")]
    DeepCycle,
    #[serde(rename = "lead-acid")]
    LeadAcid,
    #[serde(rename = "lifepo4")]
    LiFePo4,
    #[serde(rename = "lithium-ion")]
    LithiumIon,
    #[serde(rename = "custom")]
    Custom,
}

/// One calibration point: at `voltage` volts the battery holds `percent` % charge.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "(f64, u8)")]
pub struct CurvePoint {
    pub voltage: f64,
    pub percent: u8,
}

impl From<(f64, u8)> for CurvePoint {
    fn from((voltage, percent): (f64, u8)) -> Self {
        Self { voltage, percent }
    }
}

const MIN_CURVE_POINTS: usize = 4;

const DECILES: [u8; 11] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100];

const LEAD_CALCIUM_VOLTS: [f64; 11] = [
    10.5, 11.51, 11.66, 11.81, 11.95, 12.05, 12.15, 12.3, 12.5, 12.75, 12.8,
];
const LEAD_ACID_VOLTS: [f64; 11] = [
    10.5, 11.31, 11.58, 11.75, 11.9, 12.06, 12.2, 12.32, 12.42, 12.5, 12.7,
];
const LIFEPO4_VOLTS: [f64; 11] = [
    10.0, 12.0, 12.5, 12.8, 12.9, 13.0, 13.1, 13.2, 13.3, 13.4, 13.6,
];
const LIFEPO4_PERCENTS: [u8; 11] = [0, 9, 14, 17, 20, 30, 40, 70, 90, 99, 100];
const LITHIUM_ION_VOLTS: [f64; 11] = [
    10.0, 12.0, 12.8, 12.9, 13.0, 13.05, 13.1, 13.2, 13.3, 13.4, 13.6,
];

/// A voltage curve plus the thresholds used to classify a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedProfile {
    chemistry: Chemistry,
    curve: Vec<CurvePoint>,
    low_percent: u8,
    critical_percent: u8,
    floating_voltage: f64,
    charging_voltage: f64,
}

/// How raw readings are adjusted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ChemistryProfile {
    /// Pass the monitor's own values through
    #[default]
    Automatic,
    Calibrated(CalibratedProfile),
}

impl ChemistryProfile {
    /// The built-in profile for `chemistry`. `Custom` has no built-in values and must be
    /// created with [`ChemistryProfile::custom`].
    pub fn builtin(chemistry: Chemistry) -> Result<Self, ConfigError> {
        let (volts, percents, low, critical, floating, charging) = match chemistry {
            Chemistry::Automatic => return Ok(ChemistryProfile::Automatic),
            Chemistry::Agm => (LEAD_CALCIUM_VOLTS, DECILES, 30, 20, 13.6, 14.3),
            Chemistry::DeepCycle => (LEAD_CALCIUM_VOLTS, DECILES, 50, 20, 13.6, 14.4),
            Chemistry::LeadAcid => (LEAD_ACID_VOLTS, DECILES, 60, 50, 13.7, 14.5),
            Chemistry::LiFePo4 => (LIFEPO4_VOLTS, LIFEPO4_PERCENTS, 20, 5, 13.5, 14.4),
            Chemistry::LithiumIon => (LITHIUM_ION_VOLTS, DECILES, 30, 20, 13.5, 14.25),
            Chemistry::Custom => {
                return Err(ConfigError::InvalidCurve(
                    "the custom chemistry needs a user supplied curve".to_string(),
                ))
            }
        };

        let curve = volts
            .iter()
            .zip(percents.iter())
            .map(|(&voltage, &percent)| CurvePoint { voltage, percent })
            .collect();

        Ok(ChemistryProfile::Calibrated(CalibratedProfile {
            chemistry,
            curve,
            low_percent: low,
            critical_percent: critical,
            floating_voltage: floating,
            charging_voltage: charging,
        }))
    }

    /// A user calibrated profile. The curve may have any number of points (at least four),
    /// must be strictly increasing in voltage and must run from 0 % to 100 %.
    pub fn custom(
        curve: Vec<CurvePoint>,
        low_percent: u8,
        critical_percent: u8,
        floating_voltage: f64,
        charging_voltage: f64,
    ) -> Result<Self, ConfigError> {
        validate_curve(&curve)?;

        if critical_percent > low_percent || low_percent > 100 {
            return Err(ConfigError::InvalidThresholds(format!(
                "need critical ({critical_percent}) <= low ({low_percent}) <= 100"
            )));
        }
        if !(charging_voltage > floating_voltage) {
            return Err(ConfigError::InvalidThresholds(format!(
                "charging voltage ({charging_voltage}) must be above floating voltage ({floating_voltage})"
            )));
        }

        Ok(ChemistryProfile::Calibrated(CalibratedProfile {
            chemistry: Chemistry::Custom,
            curve,
            low_percent,
            critical_percent,
            floating_voltage,
            charging_voltage,
        }))
    }

    pub fn chemistry(&self) -> Chemistry {
        match self {
            ChemistryProfile::Automatic => Chemistry::Automatic,
            ChemistryProfile::Calibrated(profile) => profile.chemistry,
        }
    }

    /// The state of charge in %, always within 0..=100.
    pub fn adjust_percentage(&self, raw_percentage: u8, voltage: f64) -> u8 {
        match self {
            ChemistryProfile::Automatic => raw_percentage.min(100),
            ChemistryProfile::Calibrated(profile) => {
                let percentage = profile.interpolate(voltage);
                log::debug!(
                    "Adjusted percentage for {:?}: voltage = {voltage}, device percentage = {raw_percentage}, adjusted = {percentage}",
                    profile.chemistry
                );
                percentage
            }
        }
    }

    /// Classify a reading. Charging and floating are judged on voltage alone and win over
    /// the percentage based critical and low bands.
    pub fn adjust_status(
        &self,
        raw_status: BatteryStatus,
        adjusted_percentage: u8,
        voltage: f64,
    ) -> BatteryStatus {
        let profile = match self {
            ChemistryProfile::Automatic => return raw_status,
            ChemistryProfile::Calibrated(profile) => profile,
        };

        if voltage >= profile.charging_voltage {
            BatteryStatus::Charging
        } else if voltage >= profile.floating_voltage {
            BatteryStatus::Floating
        } else if adjusted_percentage <= profile.critical_percent {
            BatteryStatus::Critical
        } else if adjusted_percentage <= profile.low_percent {
            BatteryStatus::Low
        } else {
            BatteryStatus::Normal
        }
    }
}

impl CalibratedProfile {
    pub fn curve(&self) -> &[CurvePoint] {
        &self.curve
    }

    pub fn low_percent(&self) -> u8 {
        self.low_percent
    }

    pub fn critical_percent(&self) -> u8 {
        self.critical_percent
    }

    pub fn floating_voltage(&self) -> f64 {
        self.floating_voltage
    }

    pub fn charging_voltage(&self) -> f64 {
        self.charging_voltage
    }

    /// Linear interpolation along the curve, held flat beyond either end.
    ///
    /// The result is rounded to the nearest percent, so it can sit up to one percent
    /// above a truncating interpolation of the same curve.
    fn interpolate(&self, voltage: f64) -> u8 {
        let (first, last) = match (self.curve.first(), self.curve.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0,
        };
        if voltage <= first.voltage {
            return first.percent.min(100);
        }
        if voltage >= last.voltage {
            return last.percent.min(100);
        }

        let percent = self
            .curve
            .windows(2)
            .find(|pair| voltage < pair[1].voltage)
            .map(|pair| {
                let (lo, hi) = (pair[0], pair[1]);
                let t = (voltage - lo.voltage) / (hi.voltage - lo.voltage);
                f64::from(lo.percent) + t * (f64::from(hi.percent) - f64::from(lo.percent))
            })
            .unwrap_or(f64::from(last.percent));

        percent.round().clamp(0.0, 100.0) as u8
    }
}

fn validate_curve(curve: &[CurvePoint]) -> Result<(), ConfigError> {
    if curve.len() < MIN_CURVE_POINTS {
        return Err(ConfigError::InvalidCurve(format!(
            "need at least {MIN_CURVE_POINTS} points, got {}",
            curve.len()
        )));
    }
    if curve.first().map(|p| p.percent) != Some(0) {
        return Err(ConfigError::InvalidCurve(
            "the first point must be at 0 %".to_string(),
        ));
    }
    if curve.last().map(|p| p.percent) != Some(100) {
        return Err(ConfigError::InvalidCurve(
            "the last point must be at 100 %".to_string(),
        ));
    }
    if let Some(point) = curve.iter().find(|p| p.percent > 100 || !p.voltage.is_finite()) {
        return Err(ConfigError::InvalidCurve(format!(
            "point ({}, {}) is out of range",
            point.voltage, point.percent
        )));
    }
    if curve.windows(2).any(|pair| pair[1].voltage <= pair[0].voltage) {
        return Err(ConfigError::InvalidCurve(
            "voltages must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
const CALIBRATED: [Chemistry; 5] = [
    Chemistry::Agm,
    Chemistry::DeepCycle,
    Chemistry::LeadAcid,
    Chemistry::LiFePo4,
    Chemistry::LithiumIon,
];

#[cfg(test)]
fn six_point_curve() -> Vec<CurvePoint> {
    vec![
        (11.0, 0).into(),
        (11.8, 20).into(),
        (12.1, 40).into(),
        (12.3, 60).into(),
        (12.5, 80).into(),
        (12.7, 100).into(),
    ]
}

#[test]
fn test_automatic_passes_through() {
    let profile = ChemistryProfile::Automatic;
    assert_eq!(profile.adjust_percentage(70, 12.60), 70);
    assert_eq!(
        profile.adjust_status(BatteryStatus::Low, 70, 12.60),
        BatteryStatus::Low
    );
    // even a charging voltage does not override the device
    assert_eq!(
        profile.adjust_status(BatteryStatus::Normal, 70, 14.8),
        BatteryStatus::Normal
    );
}

#[test]
fn test_automatic_clamps_device_percentage() {
    assert_eq!(ChemistryProfile::Automatic.adjust_percentage(120, 12.0), 100);
}

#[test]
fn test_agm_interpolates() {
    let profile = ChemistryProfile::builtin(Chemistry::Agm).unwrap();
    assert_eq!(profile.adjust_percentage(70, 12.6), 84);
    assert_eq!(profile.adjust_percentage(70, 12.5), 80);
    assert_eq!(
        profile.adjust_status(BatteryStatus::Low, 84, 12.6),
        BatteryStatus::Normal
    );
}

#[test]
fn test_interpolation_rounds_to_nearest() {
    // 11.55 V sits 0.89 of the way from 10 % to 20 % on the lead-acid curve
    let profile = ChemistryProfile::builtin(Chemistry::LeadAcid).unwrap();
    assert_eq!(profile.adjust_percentage(0, 11.55), 19);
}

#[test]
fn test_curve_is_clamped_at_the_ends() {
    for chemistry in CALIBRATED {
        let profile = ChemistryProfile::builtin(chemistry).unwrap();
        assert_eq!(profile.adjust_percentage(50, 0.0), 0, "{chemistry:?}");
        assert_eq!(profile.adjust_percentage(50, 9.99), 0, "{chemistry:?}");
        assert_eq!(profile.adjust_percentage(50, 14.0), 100, "{chemistry:?}");
        assert_eq!(profile.adjust_percentage(50, 40.95), 100, "{chemistry:?}");
    }
}

#[test]
fn test_builtin_curves_are_monotonic() {
    for chemistry in CALIBRATED {
        let profile = ChemistryProfile::builtin(chemistry).unwrap();
        let mut previous = 0;
        for cv in 900..1500u16 {
            let percentage = profile.adjust_percentage(0, f64::from(cv) / 100.0);
            assert!(percentage <= 100);
            assert!(
                percentage >= previous,
                "{chemistry:?} drops from {previous} to {percentage} at {cv}cV"
            );
            previous = percentage;
        }
    }
}

#[test]
fn test_lifepo4_uses_its_own_percentages() {
    let profile = ChemistryProfile::builtin(Chemistry::LiFePo4).unwrap();
    assert_eq!(profile.adjust_percentage(0, 13.2), 70);
    assert_eq!(profile.adjust_percentage(0, 13.25), 80);
    assert_eq!(profile.adjust_percentage(0, 12.0), 9);
}

#[test]
fn test_status_bands() {
    let profile = ChemistryProfile::builtin(Chemistry::Agm).unwrap();
    let raw = BatteryStatus::Normal;
    assert_eq!(profile.adjust_status(raw, 90, 14.3), BatteryStatus::Charging);
    assert_eq!(profile.adjust_status(raw, 90, 13.6), BatteryStatus::Floating);
    assert_eq!(profile.adjust_status(raw, 20, 11.66), BatteryStatus::Critical);
    assert_eq!(profile.adjust_status(raw, 21, 11.7), BatteryStatus::Low);
    assert_eq!(profile.adjust_status(raw, 30, 11.81), BatteryStatus::Low);
    assert_eq!(profile.adjust_status(raw, 31, 11.82), BatteryStatus::Normal);
}

#[test]
fn test_charging_voltage_beats_percentage() {
    for chemistry in CALIBRATED {
        let profile = ChemistryProfile::builtin(chemistry).unwrap();
        for percentage in [0, 5, 20, 50, 100] {
            assert_eq!(
                profile.adjust_status(BatteryStatus::Critical, percentage, 14.5),
                BatteryStatus::Charging,
                "{chemistry:?}"
            );
        }
    }
}

#[test]
fn test_adjust_status_is_idempotent() {
    let profile = ChemistryProfile::builtin(Chemistry::LeadAcid).unwrap();
    let first = profile.adjust_status(BatteryStatus::Normal, 55, 12.1);
    let second = profile.adjust_status(BatteryStatus::Normal, 55, 12.1);
    assert_eq!(first, second);
    assert_eq!(first, BatteryStatus::Low);
}

#[test]
fn test_custom_curve_of_any_length() {
    let profile = ChemistryProfile::custom(six_point_curve(), 60, 50, 13.6, 13.9).unwrap();
    assert_eq!(profile.chemistry(), Chemistry::Custom);
    assert_eq!(profile.adjust_percentage(0, 12.2), 50);
    assert_eq!(profile.adjust_percentage(0, 13.0), 100);
    assert_eq!(
        profile.adjust_status(BatteryStatus::Normal, 50, 12.2),
        BatteryStatus::Critical
    );

    let four_points = vec![(11.0, 0).into(), (12.0, 30).into(), (12.4, 70).into(), (12.8, 100).into()];
    assert!(ChemistryProfile::custom(four_points, 30, 10, 13.5, 14.0).is_ok());
}

#[test]
fn test_custom_curve_validation() {
    let short = six_point_curve()[..3].to_vec();
    assert!(matches!(
        ChemistryProfile::custom(short, 60, 50, 13.6, 13.9),
        Err(ConfigError::InvalidCurve(_))
    ));

    let mut unordered = six_point_curve();
    unordered[2].voltage = 11.5;
    assert!(matches!(
        ChemistryProfile::custom(unordered, 60, 50, 13.6, 13.9),
        Err(ConfigError::InvalidCurve(_))
    ));

    let mut not_full = six_point_curve();
    not_full[5].percent = 95;
    assert!(matches!(
        ChemistryProfile::custom(not_full, 60, 50, 13.6, 13.9),
        Err(ConfigError::InvalidCurve(_))
    ));

    assert!(matches!(
        ChemistryProfile::custom(six_point_curve(), 40, 50, 13.6, 13.9),
        Err(ConfigError::InvalidThresholds(_))
    ));
    assert!(matches!(
        ChemistryProfile::custom(six_point_curve(), 60, 50, 13.9, 13.9),
        Err(ConfigError::InvalidThresholds(_))
    ));
}

#[test]
fn test_custom_has_no_builtin() {
    assert!(ChemistryProfile::builtin(Chemistry::Custom).is_err());
    assert_eq!(
        ChemistryProfile::builtin(Chemistry::Automatic).unwrap(),
        ChemistryProfile::Automatic
    );
}
