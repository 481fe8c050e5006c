use std::sync::Arc;

use crate::chemistry::ChemistryProfile;
use crate::error::PollError;
use crate::payload::{Bm2Codec, PayloadCodec, RawReading};
use crate::status::{BatteryStatus, StatusCodeMap};

/// The interpreted state of the battery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustedReading {
    /// The battery voltage in V
    pub voltage: f64,
    /// The state of charge in %, 0..=100
    pub percentage: u8,
    /// The device status code corresponding to `status`
    pub status_code: u8,
    pub status: BatteryStatus,
}

impl AdjustedReading {
    pub fn is_charging(&self) -> bool {
        self.status == BatteryStatus::Charging
    }

    /// The icon key for the status
    pub fn icon(&self) -> &'static str {
        self.status.icon()
    }
}

/// Payload bytes in, [`AdjustedReading`] out: decode, then adjust for the chemistry.
#[derive(Clone)]
pub struct ReadingPipeline {
    codec: Arc<dyn PayloadCodec>,
    profile: ChemistryProfile,
    status_map: StatusCodeMap,
}

impl Default for ReadingPipeline {
    fn default() -> Self {
        Self::new(ChemistryProfile::Automatic, StatusCodeMap::default())
    }
}

impl ReadingPipeline {
    pub fn new(profile: ChemistryProfile, status_map: StatusCodeMap) -> Self {
        Self::with_codec(Arc::new(Bm2Codec::default()), profile, status_map)
    }

    pub fn with_codec(
        codec: Arc<dyn PayloadCodec>,
        profile: ChemistryProfile,
        status_map: StatusCodeMap,
    ) -> Self {
        Self { codec, profile, status_map }
    }

    pub fn profile(&self) -> &ChemistryProfile {
        &self.profile
    }

    pub fn interpret(&self, payload: &[u8]) -> Result<AdjustedReading, PollError> {
        let raw = self.codec.decode(payload)?;
        log::debug!(
            "Raw reading: voltage = {}, percentage = {}, status = {}",
            raw.voltage(),
            raw.percentage,
            raw.status_code
        );
        Ok(self.adjust(&raw))
    }

    pub fn adjust(&self, raw: &RawReading) -> AdjustedReading {
        let voltage = raw.voltage();
        let raw_status = self.status_map.status(raw.status_code);

        let percentage = self.profile.adjust_percentage(raw.percentage, voltage);
        let status = self.profile.adjust_status(raw_status, percentage, voltage);
        let status_code = match self.profile {
            ChemistryProfile::Automatic => raw.status_code,
            ChemistryProfile::Calibrated(_) => self
                .status_map
                .code(status)
                .unwrap_or(raw.status_code),
        };
        log::debug!("Adjusted reading: percentage = {percentage}, status = {status}");

        AdjustedReading { voltage, percentage, status_code, status }
    }
}

impl std::fmt::Debug for ReadingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingPipeline")
            .field("profile", &self.profile)
            .field("status_map", &self.status_map)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
const SCENARIO_PAYLOAD: &str = "4b8c5e5bcaa9ff20e368f9c70119c8aa";

#[test]
fn test_automatic_pipeline() {
    let payload = hex::decode(SCENARIO_PAYLOAD).unwrap();
    let reading = ReadingPipeline::default().interpret(&payload).unwrap();
    assert!((reading.voltage - 12.60).abs() < 1e-9);
    assert_eq!(reading.percentage, 70);
    assert_eq!(reading.status_code, 1);
    assert_eq!(reading.status, BatteryStatus::Low);
    assert_eq!(reading.icon(), "mdi:battery-arrow-down-outline");
}

#[test]
fn test_agm_pipeline() {
    let profile = ChemistryProfile::builtin(crate::Chemistry::Agm).unwrap();
    let pipeline = ReadingPipeline::new(profile, StatusCodeMap::default());
    let payload = hex::decode(SCENARIO_PAYLOAD).unwrap();
    let reading = pipeline.interpret(&payload).unwrap();
    assert_eq!(reading.percentage, 84);
    assert_eq!(reading.status, BatteryStatus::Normal);
    assert_eq!(reading.status_code, 2);
    assert!(!reading.is_charging());
}

#[test]
fn test_calibrated_status_code_follows_map() {
    let profile = ChemistryProfile::builtin(crate::Chemistry::LeadAcid).unwrap();
    let map = StatusCodeMap::default().with(8, BatteryStatus::Charging);
    let pipeline = ReadingPipeline::new(profile, map);
    let raw = RawReading { voltage_cv: 1460, status_code: 2, percentage: 100 };
    let reading = pipeline.adjust(&raw);
    assert_eq!(reading.status, BatteryStatus::Charging);
    assert_eq!(reading.status_code, 8);
    assert!(reading.is_charging());
}

#[test]
fn test_unknown_raw_status_in_automatic_mode() {
    let reading = ReadingPipeline::default().adjust(&RawReading {
        voltage_cv: 3085,
        status_code: 11,
        percentage: 120,
    });
    assert_eq!(reading.status, BatteryStatus::Unknown);
    assert_eq!(reading.status_code, 11);
    assert_eq!(reading.percentage, 100);
}

#[test]
fn test_malformed_payload() {
    let err = ReadingPipeline::default().interpret(&[0u8; 4]).unwrap_err();
    assert_eq!(err.kind(), crate::FailureKind::MalformedPayload);
}
