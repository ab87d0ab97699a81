//! Payment channel on top of a client [Channel].
//!
//! Outgoing transfers are proposed directly; incoming updates are handled by
//! [PaymentChannel::handle] (called from the update handler task) and queued,
//! so the receiving side of a protocol script can pick them up in order with
//! [PaymentChannel::recv_transfer] and [PaymentChannel::recv_final].

use std::time::Duration;

use tokio::{
    sync::{mpsc, Mutex},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    channel::{ChannelId, ChannelUpdate, PartIdx, State},
    client::{Channel, UpdateResponder},
    error::{Error, Result, TimeoutError},
    types::U256,
};

/// Asset all payments are made in.
const PAYMENT_ASSET: usize = 0;

/// State before and after an accepted inbound update.
type Handled = Result<(State, State)>;

#[derive(Debug)]
pub struct PaymentChannel<Ch: Channel> {
    ch: Ch,
    role: String,
    timeout: Duration,
    handled_tx: mpsc::UnboundedSender<Handled>,
    handled_rx: Mutex<mpsc::UnboundedReceiver<Handled>>,
}

impl<Ch: Channel> PaymentChannel<Ch> {
    pub fn new(ch: Ch, role: &str, timeout: Duration) -> Self {
        let (handled_tx, handled_rx) = mpsc::unbounded_channel();
        Self {
            ch,
            role: role.to_string(),
            timeout,
            handled_tx,
            handled_rx: Mutex::new(handled_rx),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.ch.id()
    }

    pub fn idx(&self) -> PartIdx {
        self.ch.idx()
    }

    /// The wrapped client channel.
    pub fn channel(&self) -> &Ch {
        &self.ch
    }

    pub async fn state(&self) -> State {
        self.ch.state().await
    }

    fn peer_idx(&self) -> PartIdx {
        1 - self.idx()
    }

    /// Pay `amount` to the peer.
    pub async fn send_transfer(&self, amount: U256) -> Result<()> {
        let mut next = self.state().await.make_next_state();
        next.transfer(PAYMENT_ASSET, self.idx(), self.peer_idx(), amount)?;
        debug!(role = %self.role, channel = %self.id(), %amount, "Sending transfer");
        self.send_update(next, "send transfer").await
    }

    /// Propose the current balances as the final state.
    pub async fn send_final(&self) -> Result<()> {
        let mut next = self.state().await.make_next_state();
        next.is_final = true;
        debug!(role = %self.role, channel = %self.id(), "Sending final state");
        self.send_update(next, "send final").await
    }

    async fn send_update(&self, next: State, op: &'static str) -> Result<()> {
        timeout(self.timeout, self.ch.update(next))
            .await
            .map_err(|_| TimeoutError {
                op,
                after: self.timeout,
            })?
    }

    /// Wait for the next inbound update and check that it paid us `amount`.
    pub async fn recv_transfer(&self, amount: U256) -> Result<()> {
        let (before, after) = self.recv_update("receive transfer").await?;
        let idx = self.idx();
        let received = after.outcome.balances[PAYMENT_ASSET][idx]
            .saturating_sub(before.outcome.balances[PAYMENT_ASSET][idx]);
        if received != amount {
            return Err(Error::UnexpectedTransfer {
                expected: amount,
                received,
            });
        }
        Ok(())
    }

    /// Wait for the next inbound update and check that it is final.
    pub async fn recv_final(&self) -> Result<()> {
        let (_, after) = self.recv_update("receive final").await?;
        if !after.is_final {
            return Err(Error::ExpectedFinal);
        }
        Ok(())
    }

    async fn recv_update(&self, op: &'static str) -> Result<(State, State)> {
        let mut handled = self.handled_rx.lock().await;
        match timeout(self.timeout, handled.recv()).await {
            Ok(Some(res)) => res,
            // We hold a sender ourselves.
            Ok(None) => Err(Error::Closed),
            Err(_) => Err(TimeoutError {
                op,
                after: self.timeout,
            }
            .into()),
        }
    }

    /// Accept `update` if it is a valid successor of the current state,
    /// reject it otherwise. The outcome is queued for the receive side.
    pub async fn handle(&self, update: ChannelUpdate, res: UpdateResponder) {
        let current = self.state().await;
        let outcome = match current.check_valid_transition(&update.state) {
            Ok(()) => {
                debug!(
                    role = %self.role,
                    channel = %self.id(),
                    version = update.state.version(),
                    "Accepting update"
                );
                self.bounded("accept update", res.accept())
                    .await
                    .map(|_| (current, update.state))
            }
            Err(e) => {
                warn!(role = %self.role, channel = %self.id(), error = %e, "Rejecting update");
                if let Err(err) = self.bounded("reject update", res.reject(&e.to_string())).await {
                    warn!(role = %self.role, error = %err, "Could not reject update");
                }
                Err(e.into())
            }
        };
        // The receiver lives in `self`.
        let _ = self.handled_tx.send(outcome);
    }

    async fn bounded<F>(&self, op: &'static str, fut: F) -> Result<()>
    where
        F: core::future::Future<Output = Result<()>>,
    {
        timeout(self.timeout, fut).await.map_err(|_| TimeoutError {
            op,
            after: self.timeout,
        })?
    }
}
