//! A scripted [`BleTransport`] for exercising poll cycles without hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::Uuid;
use tokio::time::{sleep, Duration};

use crate::error::TransportError;
use crate::transport::{BleTransport, NotificationSlot, BM2_NOTIFY_CHARACTERISTIC};

// plaintext ab4ec1464a0000000000000000000000: 12.60 V, status 1, 70 %
pub const PAYLOAD: &str = "4b8c5e5bcaa9ff20e368f9c70119c8aa";
// plaintext f55142640000000000000000000000ff: 13.00 V, status 2, 100 %
pub const FULL_PAYLOAD: &str = "56def5af919cde28e499b95ac1ad7f1f";

#[derive(Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub connect_calls: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub subscribed_to: Mutex<Option<Uuid>>,
}

#[derive(Default)]
pub struct FakeTransport {
    pub counters: Arc<Counters>,
    pub failing_connects: usize,
    pub hanging_connect: bool,
    pub fail_subscribe: bool,
    pub fail_cleanup: bool,
    pub payload: Option<Vec<u8>>,
    pub payload_delay: Duration,
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let call = self.counters.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging_connect {
            sleep(Duration::from_secs(3600)).await;
        }
        if call < self.failing_connects {
            return Err(TransportError::Other("le-connection-abort-by-local".into()));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
        slot: NotificationSlot,
    ) -> Result<(), TransportError> {
        if self.fail_subscribe {
            return Err(TransportError::MissingCharacteristic(BM2_NOTIFY_CHARACTERISTIC));
        }
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribed_to) = self.counters.subscribed_to.lock() {
            *subscribed_to = Some(characteristic);
        }
        if let Some(payload) = self.payload.clone() {
            let delay = self.payload_delay;
            tokio::spawn(async move {
                sleep(delay).await;
                slot.fill(payload);
            });
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, _characteristic: Uuid) -> Result<(), TransportError> {
        self.counters.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(TransportError::Other("not connected".into()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(TransportError::Other("not connected".into()));
        }
        Ok(())
    }
}

pub fn with_payload() -> FakeTransport {
    sending(PAYLOAD)
}

pub fn sending(payload: &str) -> FakeTransport {
    FakeTransport {
        payload: Some(hex::decode(payload).unwrap()),
        payload_delay: Duration::from_millis(600),
        ..Default::default()
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
