//! One connect, subscribe, await, unsubscribe, disconnect cycle against a monitor.
//!
//! BM2 monitors cannot be read directly. Instead the client subscribes to the notify
//! characteristic and the monitor pushes a single encrypted reading shortly after.
//! The session waits for it by checking a [`NotificationSlot`] at a fixed tick rather
//! than blocking on the notification stream, so a silent device costs exactly the
//! payload timeout and never more.
//!
//! Whatever happens after the link is up, the session unsubscribes and disconnects
//! exactly once before returning. Failed or timed out connection attempts are followed
//! by a disconnect too, since the stack may finish connecting after the attempt was
//! abandoned. A leaked connection blocks every later poll of the device.

use bluest::Uuid;
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::error::{FailureKind, PollError, TransportError};
use crate::reading::{AdjustedReading, ReadingPipeline};
use crate::transport::{BleTransport, NotificationSlot, BM2_NOTIFY_CHARACTERISTIC};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const PAYLOAD_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Budget for a single connection attempt
    pub connect_timeout: Duration,
    /// How many connection attempts to make before giving up (at least one)
    pub connect_attempts: u32,
    /// How long to wait for the notification once subscribed
    pub payload_timeout: Duration,
    /// How often to check whether the notification has arrived
    pub payload_tick: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            payload_timeout: DEFAULT_PAYLOAD_TIMEOUT,
            payload_tick: PAYLOAD_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    SubscribingNotify,
    AwaitingPayload,
    Unsubscribing,
    Disconnecting,
    Completed,
    Failed(FailureKind),
}

/// Drives one poll cycle over a borrowed transport.
///
/// The cleanup steps only run if the future is polled to completion. Callers that may
/// be cancelled should run the session in its own task, as
/// [`crate::BatteryMonitor::poll`] does.
pub struct PollSession<'a, T: BleTransport + ?Sized> {
    transport: &'a mut T,
    timing: SessionTiming,
    characteristic: Uuid,
    state: SessionState,
}

impl<'a, T: BleTransport + ?Sized> PollSession<'a, T> {
    pub fn new(transport: &'a mut T, timing: SessionTiming) -> Self {
        Self {
            transport,
            timing,
            characteristic: BM2_NOTIFY_CHARACTERISTIC,
            state: SessionState::Idle,
        }
    }

    /// Listen on another characteristic than the BM2 default.
    pub fn with_characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = characteristic;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run a full cycle and interpret the payload.
    pub async fn run(&mut self, pipeline: &ReadingPipeline) -> Result<AdjustedReading, PollError> {
        let payload = self.fetch_payload().await?;
        match pipeline.interpret(&payload) {
            Ok(reading) => {
                self.transition(SessionState::Completed);
                Ok(reading)
            }
            Err(err) => {
                log::warn!("Could not decode payload 0x{}: {err}", hex::encode(&payload));
                self.fail(err)
            }
        }
    }

    /// Run the BLE part of the cycle and return the raw notification bytes.
    pub async fn fetch_payload(&mut self) -> Result<Vec<u8>, PollError> {
        self.transition(SessionState::Connecting);
        if let Err(err) = self.connect().await {
            return self.fail(err);
        }

        let slot = NotificationSlot::new();
        let (captured, subscribed) = self.capture(slot).await;
        self.release(subscribed, captured.is_ok()).await;

        match captured {
            Ok(payload) => Ok(payload),
            Err(err) => self.fail(err),
        }
    }

    async fn connect(&mut self) -> Result<(), PollError> {
        let attempts = self.timing.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match timeout(self.timing.connect_timeout, self.transport.connect()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    log::warn!("Failed to connect (attempt {attempt}/{attempts}): {err}");
                    last_error = err.to_string();
                }
                Err(_) => {
                    log::warn!(
                        "Timed out connecting after {:?} (attempt {attempt}/{attempts})",
                        self.timing.connect_timeout
                    );
                    last_error = format!("timed out after {:?}", self.timing.connect_timeout);
                }
            }
            // An abandoned attempt may still bring the link up behind our back.
            if let Err(err) = self.transport.disconnect().await {
                log::debug!("Disconnect after failed attempt {attempt}: {err}");
            }
        }

        Err(PollError::Connection(format!(
            "gave up after {attempts} attempts: {last_error}"
        )))
    }

    /// Subscribe and wait for the payload. Also reports whether the subscription is active.
    async fn capture(&mut self, slot: NotificationSlot) -> (Result<Vec<u8>, PollError>, bool) {
        self.transition(SessionState::SubscribingNotify);
        if let Err(err) = self.transport.subscribe(self.characteristic, slot.clone()).await {
            log::warn!("Failed to subscribe to {}: {err}", self.characteristic);
            return (Err(err.into()), false);
        }

        self.transition(SessionState::AwaitingPayload);
        let deadline = Instant::now() + self.timing.payload_timeout;
        loop {
            if let Some(payload) = slot.take() {
                log::debug!("Received payload 0x{}", hex::encode(&payload));
                return (Ok(payload), true);
            }
            if Instant::now() >= deadline {
                return (Err(PollError::Timeout(self.timing.payload_timeout)), true);
            }
            sleep(self.timing.payload_tick).await;
        }
    }

    /// Unsubscribe (if subscribed) and disconnect. Errors are logged only.
    async fn release(&mut self, subscribed: bool, captured: bool) {
        self.transition(SessionState::Unsubscribing);
        if subscribed {
            if let Err(err) = self.transport.unsubscribe(self.characteristic).await {
                Self::log_cleanup_error("unsubscribe", &err, captured);
            }
        }

        self.transition(SessionState::Disconnecting);
        if let Err(err) = self.transport.disconnect().await {
            Self::log_cleanup_error("disconnect", &err, captured);
        }
    }

    fn log_cleanup_error(step: &str, err: &TransportError, captured: bool) {
        if captured {
            log::warn!("Failed to {step} after receiving the payload, keeping it: {err}");
        } else {
            log::warn!("Failed to {step}: {err}");
        }
    }

    fn fail<R>(&mut self, err: PollError) -> Result<R, PollError> {
        self.transition(SessionState::Failed(err.kind()));
        Err(err)
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Poll session {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BatteryStatus;
    use crate::testing::{count, with_payload, FakeTransport};

    #[tokio::test(start_paused = true)]
    async fn test_successful_cycle() {
        let mut transport = with_payload();
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let reading = session.run(&ReadingPipeline::default()).await.unwrap();
        assert_eq!(reading.percentage, 70);
        assert_eq!(reading.status, BatteryStatus::Low);
        assert_eq!(session.state(), SessionState::Completed);

        assert_eq!(count(&counters.connects), 1);
        assert_eq!(count(&counters.subscribes), 1);
        assert_eq!(count(&counters.unsubscribes), 1);
        assert_eq!(count(&counters.disconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_connection() {
        let mut transport = FakeTransport::default();
        let counters = transport.counters.clone();
        let timing = SessionTiming { payload_timeout: Duration::from_secs(5), ..Default::default() };
        let mut session = PollSession::new(&mut transport, timing);

        let started = Instant::now();
        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err, PollError::Timeout(Duration::from_secs(5)));
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));

        assert_eq!(count(&counters.connects), 1);
        assert_eq!(count(&counters.unsubscribes), 1);
        assert_eq!(count(&counters.disconnects), count(&counters.connects));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let mut transport = FakeTransport { failing_connects: 2, ..with_payload() };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        assert!(session.run(&ReadingPipeline::default()).await.is_ok());
        assert_eq!(count(&counters.connect_calls), 3);
        assert_eq!(count(&counters.connects), 1);
        // one per failed attempt, one at the end of the cycle
        assert_eq!(count(&counters.disconnects), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up() {
        let mut transport = FakeTransport { failing_connects: 10, ..with_payload() };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectionError);
        assert_eq!(session.state(), SessionState::Failed(FailureKind::ConnectionError));
        assert_eq!(count(&counters.connect_calls), 3);
        assert_eq!(count(&counters.subscribes), 0);
        assert_eq!(count(&counters.disconnects), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_releases_late_links() {
        // each attempt starts bringing the link up, then stalls past the timeout
        let mut transport = FakeTransport { hanging_connect: true, ..with_payload() };
        let counters = transport.counters.clone();
        let timing = SessionTiming {
            connect_timeout: Duration::from_secs(2),
            connect_attempts: 3,
            ..Default::default()
        };
        let mut session = PollSession::new(&mut transport, timing);

        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectionError);
        assert_eq!(session.state(), SessionState::Failed(FailureKind::ConnectionError));
        assert_eq!(count(&counters.connect_calls), 3);
        assert_eq!(count(&counters.subscribes), 0);
        assert!(count(&counters.disconnects) >= count(&counters.connect_calls));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disconnect_does_not_stop_retries() {
        let mut transport = FakeTransport { failing_connects: 1, fail_cleanup: true, ..with_payload() };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let reading = session.run(&ReadingPipeline::default()).await.unwrap();
        assert_eq!(reading.percentage, 70);
        assert_eq!(count(&counters.connect_calls), 2);
        assert_eq!(count(&counters.disconnects), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_characteristic() {
        let other = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
        let mut transport = with_payload();
        let counters = transport.counters.clone();
        let mut session =
            PollSession::new(&mut transport, SessionTiming::default()).with_characteristic(other);

        assert!(session.run(&ReadingPipeline::default()).await.is_ok());
        assert_eq!(*counters.subscribed_to.lock().unwrap(), Some(other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_still_disconnects() {
        let mut transport = FakeTransport { fail_subscribe: true, ..with_payload() };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectionError);
        assert_eq!(count(&counters.unsubscribes), 0);
        assert_eq!(count(&counters.disconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_errors_keep_captured_payload() {
        let mut transport = FakeTransport { fail_cleanup: true, ..with_payload() };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let reading = session.run(&ReadingPipeline::default()).await.unwrap();
        assert_eq!(reading.percentage, 70);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(count(&counters.disconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_errors_do_not_mask_timeout() {
        let mut transport = FakeTransport { fail_cleanup: true, ..Default::default() };
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_after_clean_release() {
        let mut transport = FakeTransport {
            payload: Some(vec![0x01, 0x02, 0x03]),
            ..Default::default()
        };
        let counters = transport.counters.clone();
        let mut session = PollSession::new(&mut transport, SessionTiming::default());

        let err = session.run(&ReadingPipeline::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedPayload);
        assert_eq!(session.state(), SessionState::Failed(FailureKind::MalformedPayload));
        assert_eq!(count(&counters.disconnects), 1);
    }
}
