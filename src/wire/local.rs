//! In-memory message bus connecting participants in the same process.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use super::{Envelope, MessageBus};
use crate::{
    error::{Error, Result},
    types::Address,
};

/// Routes [Envelope]s to the subscriber registered for the recipient.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    peers: Arc<RwLock<HashMap<Address, mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive all envelopes addressed to `addr`. Subscribing again replaces
    /// the previous subscription.
    pub async fn subscribe(&self, addr: Address) -> mpsc::UnboundedReceiver<Envelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.write().await.insert(addr, sender);
        receiver
    }

    pub async fn unsubscribe(&self, addr: &Address) {
        self.peers.write().await.remove(addr);
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let peers = self.peers.read().await;
        let peer = peers
            .get(&envelope.recipient)
            .ok_or(Error::UnknownPeer(envelope.recipient))?;
        trace!(
            sender = %envelope.sender,
            recipient = %envelope.recipient,
            msg = ?envelope.msg,
            "bus: routing envelope"
        );
        peer.send(envelope).map_err(|_| Error::Closed)
    }
}
