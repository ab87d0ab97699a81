use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use rand::{rngs::StdRng, Rng};
use tokio::{
    sync::{mpsc, Mutex},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use super::{ChannelHandle, RoleContext};
use crate::{
    channel::ProposalAcc,
    client::{Client, ProposalEvent},
    error::{Error, Result},
};

/// Outcome of one proposal, tagged with the timeout generation it arrived in.
#[derive(Debug)]
struct Decision<Ch> {
    generation: u64,
    result: Result<Ch>,
}

#[derive(Debug)]
struct Inner<C: Client> {
    role: Arc<RoleContext<C>>,
    rng: Mutex<StdRng>,
    decisions_tx: mpsc::UnboundedSender<Decision<ChannelHandle<C>>>,
    decisions_rx: Mutex<mpsc::UnboundedReceiver<Decision<ChannelHandle<C>>>>,
    /// Bumped by every timed out [AcceptAllProposalHandler::next].
    generation: AtomicU64,
}

/// Accepts every incoming channel proposal and hands the opened channels to
/// [AcceptAllProposalHandler::next], one per call.
///
/// An accepted channel is registered with the role before the proposer learns
/// about the acceptance, so the role answers updates on it right away.
/// Decisions are buffered, so proposals may arrive before anyone waits for
/// them. A decision still in flight while a `next()` call timed out is stale:
/// `next()` does not return it and reports it on the role's error sink. Its
/// channel stays registered.
#[derive(Debug)]
pub struct AcceptAllProposalHandler<C: Client> {
    inner: Arc<Inner<C>>,
}

impl<C: Client> Clone for AcceptAllProposalHandler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Client> AcceptAllProposalHandler<C> {
    pub(super) fn new(role: Arc<RoleContext<C>>, rng: StdRng) -> Self {
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                role,
                rng: Mutex::new(rng),
                decisions_tx,
                decisions_rx: Mutex::new(decisions_rx),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start deciding on `event` in the background. Never blocks.
    pub fn handle(&self, event: ProposalEvent<C::Channel>) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.accept(event).await;
            // The receiver lives in `inner`.
            let _ = inner.decisions_tx.send(Decision { generation, result });
        });
    }

    /// Wait for the next decided proposal.
    pub async fn next(&self) -> Result<ChannelHandle<C>> {
        let role = &self.inner.role;
        let deadline = Instant::now() + role.timeout;
        let mut decisions = self.inner.decisions_rx.lock().await;
        loop {
            let decision = match timeout_at(deadline, decisions.recv()).await {
                Ok(Some(decision)) => decision,
                Ok(None) => return Err(Error::Closed),
                Err(_) => {
                    self.inner.generation.fetch_add(1, Ordering::SeqCst);
                    return Err(role.timeout_error("next proposal").into());
                }
            };

            if decision.generation < self.inner.generation.load(Ordering::SeqCst) {
                warn!(
                    role = %role.name,
                    channel = ?decision.result.as_ref().ok().map(|ch| ch.id()),
                    "Discarding stale proposal decision"
                );
                role.record(Error::StaleDecision);
                continue;
            }
            return decision.result;
        }
    }
}

impl<C: Client> Inner<C> {
    async fn accept(&self, event: ProposalEvent<C::Channel>) -> Result<ChannelHandle<C>> {
        let ProposalEvent {
            proposal,
            responder,
        } = event;
        info!(
            role = %self.role.name,
            proposal = %proposal.proposal_id,
            "Accepting incoming channel proposal"
        );

        let (account, nonce_share) = {
            let mut rng = self.rng.lock().await;
            let account = self.role.wallet.new_random_account(&mut rng);
            (account, rng.gen())
        };
        debug!(
            role = %self.role.name,
            participant = %account.address(),
            "Accepting with participant"
        );

        let acc = ProposalAcc {
            proposal_id: proposal.proposal_id,
            nonce_share,
            participant: account.address(),
        };
        let role = self.role.clone();
        let register = move |ch: C::Channel| async move { role.register(ch).await };
        timeout(self.role.timeout, responder.accept_with(acc, register))
            .await
            .map_err(|_| self.role.timeout_error("accept proposal"))?
    }
}
