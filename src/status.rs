use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// The battery condition shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryStatus {
    Critical,
    Low,
    Normal,
    Floating,
    Charging,
    /// A raw device code with no entry in the [`StatusCodeMap`]
    Unknown,
}

impl BatteryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BatteryStatus::Critical => "Critical",
            BatteryStatus::Low => "Low",
            BatteryStatus::Normal => "Normal",
            BatteryStatus::Floating => "Floating",
            BatteryStatus::Charging => "Charging",
            BatteryStatus::Unknown => "Unknown",
        }
    }

    /// The icon key a host should render for this status.
    pub fn icon(&self) -> &'static str {
        match self {
            BatteryStatus::Critical => "mdi:battery-remove-outline",
            BatteryStatus::Low => "mdi:battery-arrow-down-outline",
            BatteryStatus::Normal => "mdi:battery-check",
            BatteryStatus::Floating => "mdi:battery-sync",
            BatteryStatus::Charging => "mdi:battery-charging-100",
            BatteryStatus::Unknown => "mdi:battery-off",
        }
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps the device's numeric status codes to [`BatteryStatus`] and back.
///
/// Firmware revisions disagree on which code means what, notably whether 4 is
/// charging and 8 floating or the other way around. The default follows the most
/// complete table seen in the wild and every entry can be overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodeMap {
    codes: BTreeMap<u8, BatteryStatus>,
}

impl Default for StatusCodeMap {
    fn default() -> Self {
        Self {
            codes: BTreeMap::from([
                (0, BatteryStatus::Critical),
                (1, BatteryStatus::Low),
                (2, BatteryStatus::Normal),
                (4, BatteryStatus::Charging),
                (8, BatteryStatus::Floating),
            ]),
        }
    }
}

impl StatusCodeMap {
    /// Assign `status` to `code`.
    ///
    /// The table stays one-to-one: if `status` already belonged to another code, that
    /// code takes over whatever `code` used to mean (or is dropped if `code` was new).
    /// `Unknown` is what unmapped codes decode to and cannot be assigned.
    pub fn set(&mut self, code: u8, status: BatteryStatus) {
        if status == BatteryStatus::Unknown {
            return;
        }
        let previous = self.codes.get(&code).copied();
        if let Some(other) = self.code(status).filter(|other| *other != code) {
            match previous {
                Some(previous) => self.codes.insert(other, previous),
                None => self.codes.remove(&other),
            };
        }
        self.codes.insert(code, status);
    }

    pub fn with(mut self, code: u8, status: BatteryStatus) -> Self {
        self.set(code, status);
        self
    }

    pub fn status(&self, code: u8) -> BatteryStatus {
        self.codes
            .get(&code)
            .copied()
            .unwrap_or(BatteryStatus::Unknown)
    }

    /// The device code for `status`, if the table has one.
    pub fn code(&self, status: BatteryStatus) -> Option<u8> {
        self.codes
            .iter()
            .find(|(_, s)| **s == status)
            .map(|(code, _)| *code)
    }
}

#[test]
fn test_default_table() {
    let map = StatusCodeMap::default();
    assert_eq!(map.status(0), BatteryStatus::Critical);
    assert_eq!(map.status(1), BatteryStatus::Low);
    assert_eq!(map.status(2), BatteryStatus::Normal);
    assert_eq!(map.status(4), BatteryStatus::Charging);
    assert_eq!(map.status(8), BatteryStatus::Floating);
    assert_eq!(map.status(3), BatteryStatus::Unknown);
    assert_eq!(map.code(BatteryStatus::Floating), Some(8));
    assert_eq!(map.code(BatteryStatus::Unknown), None);
}

#[test]
fn test_override_swaps_charging_and_floating() {
    let map = StatusCodeMap::default().with(8, BatteryStatus::Charging);
    assert_eq!(map.status(8), BatteryStatus::Charging);
    assert_eq!(map.status(4), BatteryStatus::Floating);
    assert_eq!(map.code(BatteryStatus::Charging), Some(8));
    assert_eq!(map.code(BatteryStatus::Floating), Some(4));
}

#[test]
fn test_override_to_new_code_moves_status() {
    let map = StatusCodeMap::default()
        .with(3, BatteryStatus::Low)
        .with(1, BatteryStatus::Unknown);
    assert_eq!(map.status(3), BatteryStatus::Low);
    assert_eq!(map.status(1), BatteryStatus::Unknown);
    assert_eq!(map.code(BatteryStatus::Low), Some(3));
}

#[test]
fn test_icons_are_distinct() {
    let all = [
        BatteryStatus::Critical,
        BatteryStatus::Low,
        BatteryStatus::Normal,
        BatteryStatus::Floating,
        BatteryStatus::Charging,
        BatteryStatus::Unknown,
    ];
    let icons: std::collections::HashSet<_> = all.iter().map(|s| s.icon()).collect();
    assert_eq!(icons.len(), all.len());
    assert_eq!(BatteryStatus::Charging.to_string(), "Charging");
}
