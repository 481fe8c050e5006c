use std::path::Path;

use serde::Deserialize;
use tokio::time::Duration;

use crate::chemistry::{Chemistry, ChemistryProfile, CurvePoint};
use crate::error::ConfigError;
use crate::scheduler::{RateLimitMode, ScheduleConfig};
use crate::session::SessionTiming;
use crate::status::{BatteryStatus, StatusCodeMap};
use crate::transport::DEFAULT_DEVICE_NAMES;

/// Settings for one monitored battery, usually read from a TOML file.
///
/// ```toml
/// poll_interval_secs = 120
/// rate_limit = "while-not-charging"
/// battery_type = "custom"
///
/// [custom]
/// curve = [[11.0, 0], [11.8, 20], [12.1, 40], [12.3, 60], [12.5, 80], [12.7, 100]]
/// low_percent = 40
/// critical_percent = 20
///
/// [[status_codes]]
/// code = 8
/// status = "charging"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Advertised names to accept during discovery
    pub device_names: Vec<String>,
    pub poll_interval_secs: u64,
    pub rate_limit: RateLimitMode,
    pub battery_type: Chemistry,
    pub custom: Option<CustomChemistryConfig>,
    pub gatt_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    pub scan_timeout_secs: u64,
    /// How often the daemon asks whether a poll is due
    pub check_interval_secs: u64,
    pub status_codes: Vec<StatusCodeEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomChemistryConfig {
    pub curve: Vec<CurvePoint>,
    #[serde(default = "default_low_percent")]
    pub low_percent: u8,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u8,
    #[serde(default = "default_floating_voltage")]
    pub floating_voltage: f64,
    #[serde(default = "default_charging_voltage")]
    pub charging_voltage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusCodeEntry {
    pub code: u8,
    pub status: BatteryStatus,
}

fn default_low_percent() -> u8 {
    60
}

fn default_critical_percent() -> u8 {
    50
}

fn default_floating_voltage() -> f64 {
    13.6
}

fn default_charging_voltage() -> f64 {
    13.9
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_names: DEFAULT_DEVICE_NAMES.iter().map(|n| n.to_string()).collect(),
            poll_interval_secs: 60,
            rate_limit: RateLimitMode::Always,
            battery_type: Chemistry::Automatic,
            custom: None,
            gatt_timeout_secs: 20,
            connect_timeout_secs: 15,
            connect_attempts: 3,
            scan_timeout_secs: 30,
            check_interval_secs: 5,
            status_codes: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        // fail early rather than on the first poll
        config.profile()?;
        config.status_map()?;
        Ok(config)
    }

    pub fn profile(&self) -> Result<ChemistryProfile, ConfigError> {
        match (self.battery_type, &self.custom) {
            (Chemistry::Custom, Some(custom)) => ChemistryProfile::custom(
                custom.curve.clone(),
                custom.low_percent,
                custom.critical_percent,
                custom.floating_voltage,
                custom.charging_voltage,
            ),
            (Chemistry::Custom, None) => Err(ConfigError::InvalidCurve(
                "battery_type is custom but there is no [custom] section".to_string(),
            )),
            (chemistry, _) => ChemistryProfile::builtin(chemistry),
        }
    }

    pub fn status_map(&self) -> Result<StatusCodeMap, ConfigError> {
        let mut map = StatusCodeMap::default();
        for entry in &self.status_codes {
            if entry.status == BatteryStatus::Unknown {
                return Err(ConfigError::InvalidStatusCode(format!(
                    "code {} cannot be mapped to unknown",
                    entry.code
                )));
            }
            map.set(entry.code, entry.status);
        }
        Ok(map)
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig::new(Duration::from_secs(self.poll_interval_secs), self.rate_limit)
    }

    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            connect_attempts: self.connect_attempts.max(1),
            payload_timeout: Duration::from_secs(self.gatt_timeout_secs),
            ..SessionTiming::default()
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = MonitorConfig::parse("").unwrap();
    assert_eq!(config, MonitorConfig::default());
    assert_eq!(config.profile().unwrap(), ChemistryProfile::Automatic);
    assert_eq!(config.schedule(), ScheduleConfig::default());
    assert_eq!(config.timing().payload_timeout, Duration::from_secs(20));
    assert_eq!(config.device_names.len(), 3);
}

#[test]
fn test_builtin_chemistry_and_rate_limit() {
    let config = MonitorConfig::parse(
        r#"
        poll_interval_secs = 10
        rate_limit = "while-not-charging"
        battery_type = "lifepo4"
        "#,
    )
    .unwrap();
    assert_eq!(config.battery_type, Chemistry::LiFePo4);
    assert_eq!(config.profile().unwrap().chemistry(), Chemistry::LiFePo4);

    let schedule = config.schedule();
    assert_eq!(schedule.rate_limit, RateLimitMode::WhileNotCharging);
    assert_eq!(schedule.interval, Duration::from_secs(30));
}

#[test]
fn test_custom_chemistry() {
    let config = MonitorConfig::parse(
        r#"
        battery_type = "custom"

        [custom]
        curve = [[11.0, 0], [11.8, 20], [12.1, 40], [12.3, 60], [12.5, 80], [12.7, 100]]
        low_percent = 40
        critical_percent = 20
        "#,
    )
    .unwrap();
    let profile = config.profile().unwrap();
    assert_eq!(profile.chemistry(), Chemistry::Custom);
    match profile {
        ChemistryProfile::Calibrated(profile) => {
            assert_eq!(profile.curve().len(), 6);
            assert_eq!(profile.low_percent(), 40);
            assert_eq!(profile.floating_voltage(), 13.6);
            assert_eq!(profile.charging_voltage(), 13.9);
        }
        ChemistryProfile::Automatic => panic!("expected a calibrated profile"),
    }
}

#[test]
fn test_custom_without_curve_is_rejected() {
    assert!(matches!(
        MonitorConfig::parse(r#"battery_type = "custom""#),
        Err(ConfigError::InvalidCurve(_))
    ));
    assert!(matches!(
        MonitorConfig::parse(
            r#"
            battery_type = "custom"
            [custom]
            curve = [[11.0, 0], [12.7, 100]]
            "#
        ),
        Err(ConfigError::InvalidCurve(_))
    ));
}

#[test]
fn test_status_code_overrides() {
    let config = MonitorConfig::parse(
        r#"
        [[status_codes]]
        code = 8
        status = "charging"
        "#,
    )
    .unwrap();
    let map = config.status_map().unwrap();
    assert_eq!(map.status(8), BatteryStatus::Charging);
    assert_eq!(map.status(4), BatteryStatus::Floating);

    assert!(matches!(
        MonitorConfig::parse(
            r#"
            [[status_codes]]
            code = 3
            status = "unknown"
            "#,
        ),
        Err(ConfigError::InvalidStatusCode(_))
    ));
}

#[test]
fn test_unknown_values_are_rejected() {
    assert!(matches!(
        MonitorConfig::parse(r#"battery_type = "nicad""#),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        MonitorConfig::parse("poll_intervall_secs = 60"),
        Err(ConfigError::Parse(_))
    ));
}
