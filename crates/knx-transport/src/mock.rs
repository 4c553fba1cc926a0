use crate::{GroupAddress, GroupBus, GroupEvent, Inbound, Result, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    sent: Vec<GroupEvent>,
    attempts: HashMap<GroupAddress, usize>,
    /// Remaining failures per address; `None` fails forever.
    failing: HashMap<GroupAddress, Option<u32>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// A simple in-process mock bus. Sent telegrams are recorded; inbound
/// telegrams are injected through the paired [`MockFeed`].
pub struct MockBus {
    inbound: Option<Inbound>,
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle of a [`MockBus`]. Dropping it ends the inbound stream.
#[derive(Clone)]
pub struct MockFeed {
    tx: mpsc::Sender<GroupEvent>,
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new(capacity: usize) -> (Self, MockFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                inbound: Some(rx),
                state: state.clone(),
            },
            MockFeed { tx, state },
        )
    }
}

#[async_trait]
impl GroupBus for MockBus {
    fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    async fn send(&self, event: &GroupEvent) -> Result<()> {
        let mut state = lock(&self.state);
        *state.attempts.entry(event.destination).or_default() += 1;
        let fail = match state.failing.get_mut(&event.destination) {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(left)) => {
                *left -= 1;
                true
            }
        };
        if fail {
            return Err(TransportError::SendFailed(format!(
                "mock send to {} rejected",
                event.destination
            )));
        }
        state.sent.push(event.clone());
        Ok(())
    }
}

impl MockFeed {
    /// Inject a telegram as if it had been received from the bus.
    pub async fn push(&self, mut event: GroupEvent) -> Result<()> {
        if event.received_at.is_none() {
            event.received_at = Some(OffsetDateTime::now_utc());
        }
        self.tx.send(event).await.map_err(|_| TransportError::Closed)
    }

    /// Telegrams sent through the bus so far, in send order.
    pub fn sent(&self) -> Vec<GroupEvent> {
        lock(&self.state).sent.clone()
    }

    /// Make every later send addressed to `addr` fail.
    pub fn fail_sends_to(&self, addr: GroupAddress) {
        lock(&self.state).failing.insert(addr, None);
    }

    /// Make the next `times` sends addressed to `addr` fail.
    pub fn fail_next_sends_to(&self, addr: GroupAddress, times: u32) {
        lock(&self.state).failing.insert(addr, Some(times));
    }

    /// Sends attempted to `addr`, failed ones included.
    pub fn attempts(&self, addr: GroupAddress) -> usize {
        lock(&self.state)
            .attempts
            .get(&addr)
            .copied()
            .unwrap_or_default()
    }
}
