use serde::Deserialize;
use tokio::time::{Duration, Instant};

use crate::error::PollError;
use crate::reading::AdjustedReading;

/// The shortest poll interval a monitor may be configured with
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// When the poll interval applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitMode {
    /// Never poll more often than the interval
    #[default]
    Always,
    /// Poll whenever asked
    Never,
    /// Poll whenever asked while the battery is charging
    WhileNotCharging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub rate_limit: RateLimitMode,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_POLL_INTERVAL, rate_limit: RateLimitMode::Always }
    }
}

impl ScheduleConfig {
    /// `interval` is raised to [`MIN_POLL_INTERVAL`] if shorter.
    pub fn new(interval: Duration, rate_limit: RateLimitMode) -> Self {
        Self { interval: interval.max(MIN_POLL_INTERVAL), rate_limit }
    }
}

/// Whether a poll should run now. `since_last_poll` is `None` before the first poll.
pub fn is_poll_due(
    since_last_poll: Option<Duration>,
    is_charging: bool,
    config: &ScheduleConfig,
) -> bool {
    let since_last_poll = match since_last_poll {
        None => return true,
        Some(elapsed) => elapsed,
    };

    match config.rate_limit {
        RateLimitMode::Never => true,
        RateLimitMode::WhileNotCharging if is_charging => true,
        _ => since_last_poll > config.interval,
    }
}

/// Per device scheduling state.
#[derive(Debug, Clone, Default)]
pub struct PollScheduler {
    last_poll: Option<Instant>,
    is_charging: bool,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_charging(&self) -> bool {
        self.is_charging
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn is_poll_due(&self, now: Instant, config: &ScheduleConfig) -> bool {
        let since_last_poll = self.last_poll.map(|last| now.saturating_duration_since(last));
        let due = is_poll_due(since_last_poll, self.is_charging, config);
        log::debug!(
            "Poll due = {due} (mode = {:?}, charging = {}, since last = {since_last_poll:?})",
            config.rate_limit,
            self.is_charging
        );
        due
    }

    /// Record a completed cycle. A failure keeps the previous charging state.
    pub fn record(&mut self, outcome: &Result<AdjustedReading, PollError>, finished_at: Instant) {
        self.last_poll = Some(finished_at);
        if let Ok(reading) = outcome {
            self.is_charging = reading.is_charging();
        }
    }
}

#[cfg(test)]
fn reading(status: crate::BatteryStatus) -> AdjustedReading {
    AdjustedReading { voltage: 14.4, percentage: 100, status_code: 4, status }
}

#[test]
fn test_first_poll_is_always_due() {
    let config = ScheduleConfig::default();
    assert!(is_poll_due(None, false, &config));
    assert!(PollScheduler::new().is_poll_due(Instant::now(), &config));
}

#[test]
fn test_always_rate_limits() {
    let config = ScheduleConfig::new(Duration::from_secs(60), RateLimitMode::Always);
    assert!(!is_poll_due(Some(Duration::from_secs(5)), true, &config));
    assert!(!is_poll_due(Some(Duration::from_secs(60)), false, &config));
    assert!(is_poll_due(Some(Duration::from_secs(61)), false, &config));
}

#[test]
fn test_never_rate_limits() {
    let config = ScheduleConfig::new(Duration::from_secs(60), RateLimitMode::Never);
    assert!(is_poll_due(Some(Duration::from_secs(1)), false, &config));
}

#[test]
fn test_charging_bypasses_rate_limit() {
    let config = ScheduleConfig::new(Duration::from_secs(60), RateLimitMode::WhileNotCharging);
    assert!(is_poll_due(Some(Duration::from_secs(5)), true, &config));
    assert!(!is_poll_due(Some(Duration::from_secs(5)), false, &config));
}

#[test]
fn test_interval_is_clamped() {
    let config = ScheduleConfig::new(Duration::from_secs(5), RateLimitMode::Always);
    assert_eq!(config.interval, MIN_POLL_INTERVAL);
}

#[test]
fn test_record_updates_charging_only_on_success() {
    let start = Instant::now();
    let mut scheduler = PollScheduler::new();

    scheduler.record(&Ok(reading(crate::BatteryStatus::Charging)), start);
    assert!(scheduler.is_charging());
    assert_eq!(scheduler.last_poll(), Some(start));

    let later = start + Duration::from_secs(90);
    scheduler.record(&Err(PollError::Timeout(Duration::from_secs(20))), later);
    assert!(scheduler.is_charging());
    assert_eq!(scheduler.last_poll(), Some(later));

    scheduler.record(&Ok(reading(crate::BatteryStatus::Floating)), later);
    assert!(!scheduler.is_charging());
}

#[test]
fn test_scheduler_uses_elapsed_time() {
    let start = Instant::now();
    let config = ScheduleConfig::new(Duration::from_secs(60), RateLimitMode::WhileNotCharging);
    let mut scheduler = PollScheduler::new();
    scheduler.record(&Ok(reading(crate::BatteryStatus::Normal)), start);

    assert!(!scheduler.is_poll_due(start + Duration::from_secs(5), &config));
    assert!(scheduler.is_poll_due(start + Duration::from_secs(61), &config));

    scheduler.record(&Ok(reading(crate::BatteryStatus::Charging)), start);
    assert!(scheduler.is_poll_due(start + Duration::from_secs(5), &config));
}
