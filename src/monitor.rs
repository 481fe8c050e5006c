use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::PollError;
use crate::reading::{AdjustedReading, ReadingPipeline};
use crate::scheduler::{PollScheduler, ScheduleConfig};
use crate::session::{PollSession, SessionTiming};
use crate::transport::BleTransport;

/// The result of one poll cycle
pub type PollOutcome = Result<AdjustedReading, PollError>;

/// Everything needed to poll one battery monitor: the transport, how to interpret its
/// payload, and when to poll it.
pub struct BatteryMonitor<T> {
    transport: Arc<Mutex<T>>,
    pipeline: ReadingPipeline,
    timing: SessionTiming,
    schedule: ScheduleConfig,
    scheduler: PollScheduler,
}

impl<T: BleTransport + 'static> BatteryMonitor<T> {
    pub fn new(
        transport: T,
        pipeline: ReadingPipeline,
        timing: SessionTiming,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            pipeline,
            timing,
            schedule,
            scheduler: PollScheduler::new(),
        }
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn is_poll_due(&self) -> bool {
        self.scheduler.is_poll_due(Instant::now(), &self.schedule)
    }

    /// Read the current state from the battery.
    ///
    /// The cycle runs in its own task, so dropping this future does not interrupt
    /// it: the subscription and the connection are still released, and the next
    /// poll waits for that to finish.
    pub async fn poll(&mut self) -> PollOutcome {
        let transport = self.transport.clone().lock_owned().await;
        let pipeline = self.pipeline.clone();
        let timing = self.timing;

        let cycle = tokio::spawn(async move {
            let mut transport = transport;
            PollSession::new(&mut *transport, timing).run(&pipeline).await
        });

        let outcome = match cycle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(PollError::Connection(format!("poll task failed: {err}"))),
        };
        self.scheduler.record(&outcome, Instant::now());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, timeout, Duration};

    use super::*;
    use crate::error::FailureKind;
    use crate::scheduler::RateLimitMode;
    use crate::status::{BatteryStatus, StatusCodeMap};
    use crate::testing::{count, sending, with_payload, FakeTransport, FULL_PAYLOAD};
    use crate::ChemistryProfile;

    fn monitor(transport: FakeTransport, schedule: ScheduleConfig) -> BatteryMonitor<FakeTransport> {
        BatteryMonitor::new(transport, ReadingPipeline::default(), SessionTiming::default(), schedule)
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_records_outcome() {
        let transport = with_payload();
        let counters = transport.counters.clone();
        let mut monitor = monitor(transport, ScheduleConfig::default());

        assert!(monitor.is_poll_due());
        let reading = monitor.poll().await.unwrap();
        assert_eq!(reading.status, BatteryStatus::Low);
        assert!(monitor.scheduler().last_poll().is_some());
        assert!(!monitor.is_poll_due());

        sleep(Duration::from_secs(61)).await;
        assert!(monitor.is_poll_due());
        assert_eq!(count(&counters.disconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charging_lifts_rate_limit() {
        let transport = sending(FULL_PAYLOAD);
        let pipeline = ReadingPipeline::new(
            ChemistryProfile::Automatic,
            StatusCodeMap::default().with(2, BatteryStatus::Charging),
        );
        let schedule = ScheduleConfig::new(Duration::from_secs(60), RateLimitMode::WhileNotCharging);
        let mut monitor = BatteryMonitor::new(transport, pipeline, SessionTiming::default(), schedule);

        let reading = monitor.poll().await.unwrap();
        assert!(reading.is_charging());
        assert!(monitor.scheduler().is_charging());
        assert!(monitor.is_poll_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_charging_state() {
        let transport = FakeTransport::default();
        let counters = transport.counters.clone();
        let mut monitor = monitor(transport, ScheduleConfig::default());

        let err = monitor.poll().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(!monitor.scheduler().is_charging());
        assert!(!monitor.is_poll_due());
        assert_eq!(count(&counters.disconnects), count(&counters.connects));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_poll_still_disconnects() {
        let transport = with_payload();
        let counters = transport.counters.clone();
        let mut monitor = monitor(transport, ScheduleConfig::new(Duration::ZERO, RateLimitMode::Never));

        // the payload arrives after 600 ms, so this drops the poll while it is waiting
        assert!(timeout(Duration::from_millis(300), monitor.poll()).await.is_err());
        assert_eq!(count(&counters.subscribes), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(count(&counters.unsubscribes), 1);
        assert_eq!(count(&counters.disconnects), 1);

        // the transport is free again
        assert!(monitor.poll().await.is_ok());
        assert_eq!(count(&counters.connects), 2);
        assert_eq!(count(&counters.disconnects), 2);
    }
}
