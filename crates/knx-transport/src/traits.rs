use crate::{GroupEvent, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of inbound group telegrams. Ends when the transport closes.
pub type Inbound = mpsc::Receiver<GroupEvent>;

/// A connection to a KNX bus carrying group telegrams.
#[async_trait]
pub trait GroupBus: Send + Sync {
    /// Take the inbound telegram stream. Returns `None` once taken.
    fn take_inbound(&mut self) -> Option<Inbound>;

    /// Send one telegram; resolves once the transport has accepted it.
    async fn send(&self, event: &GroupEvent) -> Result<()>;

    /// Close the connection. The inbound stream ends afterwards.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
