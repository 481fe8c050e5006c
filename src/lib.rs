//! Poll BM2 family Bluetooth Low Energy battery monitors
//!
//! Tested with the 12V "Battery Monitor" / "Li Battery Monitor" / ZX-1689 clip-on monitors
//! sold under many brand names.
//!
//! The monitor does not support plain characteristic reads. A client connects, subscribes to
//! the `0000fff4` characteristic and the monitor answers with one AES encrypted 16 byte block
//! holding the battery voltage, a status code and a state of charge estimate. The monitor's own
//! percentage and status are very optimistic, so readings can be re-derived from the voltage
//! using a curve for the battery chemistry in use.
//!
//! Each poll yields:
//!
//! - Voltage (V)
//! - State of charge (%)
//! - Status (critical, low, normal, floating, charging) and a matching icon key
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # use bm2read::*;
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = MonitorConfig::default();
//!     let transport = BluestTransport::discover(&config.device_names, config.scan_timeout()).await?;
//!     let pipeline = ReadingPipeline::new(config.profile()?, config.status_map()?);
//!     let mut monitor = BatteryMonitor::new(transport, pipeline, config.timing(), config.schedule());
//!     loop {
//!         if monitor.is_poll_due() {
//!             match monitor.poll().await {
//!                 Ok(reading) => println!("{reading:?}"),
//!                 Err(err) => println!("poll failed: {err}"),
//!             }
//!         }
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! # }
//! ```

mod chemistry;
mod config;
mod error;
mod monitor;
mod payload;
mod reading;
mod scheduler;
mod session;
mod status;
#[cfg(test)]
mod testing;
mod transport;

pub use chemistry::{CalibratedProfile, Chemistry, ChemistryProfile, CurvePoint};
pub use config::{CustomChemistryConfig, MonitorConfig, StatusCodeEntry};
pub use error::{ConfigError, DecodeError, FailureKind, PollError, TransportError};
pub use monitor::{BatteryMonitor, PollOutcome};
pub use payload::{Bm2Codec, PayloadCodec, RawReading, BM2_KEY, PAYLOAD_LEN};
pub use reading::{AdjustedReading, ReadingPipeline};
pub use scheduler::{
    is_poll_due, PollScheduler, RateLimitMode, ScheduleConfig, DEFAULT_POLL_INTERVAL,
    MIN_POLL_INTERVAL,
};
pub use session::{PollSession, SessionState, SessionTiming};
pub use status::{BatteryStatus, StatusCodeMap};
pub use transport::{
    BleTransport, BluestTransport, NotificationSlot, BM2_NOTIFY_CHARACTERISTIC,
    BM2_SERVICE, DEFAULT_DEVICE_NAMES,
};
pub use bluest::Uuid;
