//! Client running the channel protocol over a [LocalBus].
//!
//! Funding, watching and signatures are not part of the exchange: a channel is
//! open as soon as the proposal was accepted, and an update is applied as soon
//! as the peer accepted it.

use std::{
    collections::HashMap,
    hash::Hash as StdHash,
    sync::{Arc, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{
    Channel, Client, Completion, Incoming, ProposalAnswer, ProposalDecision, ProposalEvent,
    ProposalReply, ProposalResponder, UpdateAnswer, UpdateEvent, UpdateReply, UpdateResponder,
};
use crate::{
    channel::{
        ChannelId, ChannelProposal, ChannelUpdate, InvalidUpdate, Params, PartIdx, ProposalAcc,
        State,
    },
    error::{Error, Result},
    types::{Address, Hash},
    wire::{Envelope, LocalBus, MessageBus, ParticipantMessage},
};

type Answers<K, T> = HashMap<K, oneshot::Sender<Result<T>>>;

/// Requests waiting for the peer's answer, keyed by what the answer refers to.
#[derive(Debug)]
struct Pending<K, T> {
    waiting: std::sync::Mutex<Answers<K, T>>,
}

impl<K: Eq + StdHash + Clone, T> Pending<K, T> {
    fn new() -> Self {
        Self {
            waiting: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Answers<K, T>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The entry for `key` lives as long as the returned [Waiter].
    fn wait_for(&self, key: K) -> Waiter<'_, K, T> {
        let (sender, answer) = oneshot::channel();
        self.lock().insert(key.clone(), sender);
        Waiter {
            pending: self,
            key,
            answer,
        }
    }

    /// Returns false if nobody was waiting (anymore).
    fn resolve(&self, key: &K, result: Result<T>) -> bool {
        let sender = self.lock().remove(key);
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Interest in one answer. Dropping it, answered or not, forgets the entry.
#[derive(Debug)]
struct Waiter<'a, K: Eq + StdHash + Clone, T> {
    pending: &'a Pending<K, T>,
    key: K,
    answer: oneshot::Receiver<Result<T>>,
}

impl<K: Eq + StdHash + Clone, T> Waiter<'_, K, T> {
    async fn answer(&mut self) -> Result<T> {
        (&mut self.answer).await.map_err(|_| Error::Closed)?
    }
}

impl<K: Eq + StdHash + Clone, T> Drop for Waiter<'_, K, T> {
    fn drop(&mut self) {
        self.answer.close();
        let mut waiting = self.pending.lock();
        // A later request for the same key keeps its entry.
        if waiting.get(&self.key).map_or(false, |s| s.is_closed()) {
            waiting.remove(&self.key);
        }
    }
}

type PendingUpdates = Pending<(ChannelId, u64), ()>;

#[derive(Debug)]
struct ChannelInner {
    id: ChannelId,
    idx: PartIdx,
    params: Params,
    state: RwLock<State>,
    addr: Address,
    peer: Address,
    bus: LocalBus,
    updates: Arc<PendingUpdates>,
}

/// Channel opened by a [LocalClient].
#[derive(Debug, Clone)]
pub struct LocalChannel {
    inner: Arc<ChannelInner>,
}

impl LocalChannel {
    fn new(
        idx: PartIdx,
        prop: &ChannelProposal,
        acc: &ProposalAcc,
        client: &ClientInner,
        peer: Address,
    ) -> Self {
        let params = Params::new(prop, acc);
        let state = params.initial_state(prop.init_bals.clone());
        LocalChannel {
            inner: Arc::new(ChannelInner {
                id: state.channel_id(),
                idx,
                params,
                state: RwLock::new(state),
                addr: client.addr,
                peer,
                bus: client.bus.clone(),
                updates: client.updates.clone(),
            }),
        }
    }

    pub fn params(&self) -> Params {
        self.inner.params
    }

    /// Replace the current state, if `new_state` is a valid successor.
    async fn apply(&self, new_state: State) -> core::result::Result<(), InvalidUpdate> {
        let mut state = self.inner.state.write().await;
        state.check_valid_transition(&new_state)?;
        *state = new_state;
        Ok(())
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn id(&self) -> ChannelId {
        self.inner.id
    }

    fn idx(&self) -> PartIdx {
        self.inner.idx
    }

    async fn state(&self) -> State {
        self.inner.state.read().await.clone()
    }

    async fn update(&self, new_state: State) -> Result<()> {
        self.inner
            .state
            .read()
            .await
            .check_valid_transition(&new_state)?;

        let key = (self.inner.id, new_state.version());
        let mut waiter = self.inner.updates.wait_for(key);
        let msg = ParticipantMessage::ChannelUpdate(ChannelUpdate {
            state: new_state.clone(),
            actor_idx: self.inner.idx,
        });
        self.inner
            .bus
            .send(Envelope {
                sender: self.inner.addr,
                recipient: self.inner.peer,
                msg,
            })
            .await?;

        waiter.answer().await?;
        // The state may have moved on while we waited.
        self.apply(new_state).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct EventSenders {
    proposals: mpsc::UnboundedSender<ProposalEvent<LocalChannel>>,
    updates: mpsc::UnboundedSender<UpdateEvent>,
}

#[derive(Debug)]
struct ClientInner {
    addr: Address,
    bus: LocalBus,
    channels: RwLock<HashMap<ChannelId, LocalChannel>>,
    proposals: Pending<Hash, ProposalAcc>,
    updates: Arc<PendingUpdates>,
    events: EventSenders,
    incoming: Mutex<Option<Incoming<LocalChannel>>>,
}

/// [Client] implementation for participants sharing a [LocalBus].
#[derive(Debug, Clone)]
pub struct LocalClient {
    inner: Arc<ClientInner>,
}

impl LocalClient {
    /// Subscribe `addr` on the bus and start processing inbound messages.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(addr: Address, bus: &LocalBus) -> Self {
        let (proposals_tx, proposals_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            addr,
            bus: bus.clone(),
            channels: RwLock::new(HashMap::new()),
            proposals: Pending::new(),
            updates: Arc::new(Pending::new()),
            events: EventSenders {
                proposals: proposals_tx,
                updates: updates_tx,
            },
            incoming: Mutex::new(Some(Incoming {
                proposals: proposals_rx,
                updates: updates_rx,
            })),
        });

        let receiver = bus.subscribe(addr).await;
        tokio::spawn(receive_loop(Arc::downgrade(&inner), receiver));
        LocalClient { inner }
    }

    /// Channel with the given ID, if this client is a party to it.
    pub async fn channel(&self, id: &ChannelId) -> Option<LocalChannel> {
        self.inner.channels.read().await.get(id).cloned()
    }
}

#[async_trait]
impl Client for LocalClient {
    type Channel = LocalChannel;

    fn address(&self) -> Address {
        self.inner.addr
    }

    async fn propose_channel(&self, prop: ChannelProposal) -> Result<LocalChannel> {
        let inner = &self.inner;
        let peer = prop
            .peers
            .iter()
            .copied()
            .find(|p| *p != inner.addr)
            .ok_or(Error::UnknownPeer(inner.addr))?;

        let mut waiter = inner.proposals.wait_for(prop.proposal_id);
        inner
            .send(peer, ParticipantMessage::ChannelProposal(prop.clone()))
            .await?;

        let acc = waiter.answer().await?;
        let channel = LocalChannel::new(0, &prop, &acc, inner, peer);
        inner.open(channel.clone()).await;
        Ok(channel)
    }

    async fn incoming(&self) -> Option<Incoming<LocalChannel>> {
        self.inner.incoming.lock().await.take()
    }
}

/// Runs until the bus drops our subscription or the client is gone.
async fn receive_loop(client: Weak<ClientInner>, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        client.dispatch(envelope).await;
    }
    trace!("client: receive loop stopped");
}

impl ClientInner {
    async fn send(&self, recipient: Address, msg: ParticipantMessage) -> Result<()> {
        self.bus
            .send(Envelope {
                sender: self.addr,
                recipient,
                msg,
            })
            .await
    }

    async fn open(&self, channel: LocalChannel) {
        debug!(addr = %self.addr, channel = %channel.id(), "client: channel open");
        self.channels.write().await.insert(channel.id(), channel);
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope { sender, msg, .. } = envelope;
        match msg {
            ParticipantMessage::ChannelProposal(prop) => self.handle_proposal(sender, prop),
            ParticipantMessage::ProposalAccepted(acc) => {
                let id = acc.proposal_id;
                if !self.proposals.resolve(&id, Ok(acc)) {
                    debug!(proposal = %id, "client: late proposal acceptance dropped");
                }
            }
            ParticipantMessage::ProposalRejected { id, reason } => {
                self.proposals.resolve(&id, Err(Error::Rejected { reason }));
            }
            ParticipantMessage::ChannelUpdate(update) => self.handle_update(sender, update),
            ParticipantMessage::ChannelUpdateAccepted { id, version } => {
                self.updates.resolve(&(id, version), Ok(()));
            }
            ParticipantMessage::ChannelUpdateRejected {
                id,
                version,
                reason,
            } => {
                self.updates.resolve(&(id, version), Err(Error::Rejected { reason }));
            }
        }
    }

    fn handle_proposal(self: &Arc<Self>, sender: Address, prop: ChannelProposal) {
        let (responder, answer) = ProposalResponder::new();
        let event = ProposalEvent {
            proposal: prop.clone(),
            responder,
        };
        if self.events.proposals.send(event).is_err() {
            warn!(addr = %self.addr, "client: nobody handles proposals");
        }
        tokio::spawn(self.clone().answer_proposal(sender, prop, answer));
    }

    async fn answer_proposal(
        self: Arc<Self>,
        sender: Address,
        prop: ChannelProposal,
        answer: ProposalAnswer<LocalChannel>,
    ) {
        let id = prop.proposal_id;
        let Ok(ProposalDecision { reply, done, ready }) = answer.await else {
            if let Err(e) = self.reject_proposal(sender, id, "proposal not handled").await {
                warn!(error = %e, "client: could not reject unhandled proposal");
            }
            return;
        };

        match reply {
            ProposalReply::Accept(acc) => {
                self.accept_proposal(sender, &prop, acc, done, ready).await;
            }
            ProposalReply::Reject(reason) => {
                let result = self.reject_proposal(sender, id, &reason).await;
                // The responder may have given up waiting.
                let _ = done.send(result.map(|_| None));
            }
        }
    }

    async fn accept_proposal(
        &self,
        sender: Address,
        prop: &ChannelProposal,
        acc: ProposalAcc,
        done: Completion<Option<LocalChannel>>,
        ready: oneshot::Receiver<Result<()>>,
    ) {
        let id = prop.proposal_id;
        let Some(idx) = prop.peers.iter().position(|p| *p == self.addr) else {
            warn!(addr = %self.addr, proposal = %id, "client: accepted proposal without us");
            let _ = done.send(Err(Error::UnknownPeer(self.addr)));
            if let Err(e) = self.reject_proposal(sender, id, "not a peer").await {
                warn!(error = %e, "client: could not reject foreign proposal");
            }
            return;
        };

        let channel = LocalChannel::new(idx, prop, &acc, self, sender);
        let channel_id = channel.id();
        // Open before answering, the proposer may start sending updates right
        // after receiving the acceptance.
        self.open(channel.clone()).await;
        let _ = done.send(Ok(Some(channel)));

        let sent = match ready.await {
            Ok(Ok(())) => self.send(sender, ParticipantMessage::ProposalAccepted(acc)).await,
            refused => {
                let reason = match refused {
                    Ok(Err(e)) => e.to_string(),
                    _ => "proposal not handled".to_string(),
                };
                debug!(addr = %self.addr, channel = %channel_id, "client: channel dropped");
                self.channels.write().await.remove(&channel_id);
                self.reject_proposal(sender, id, &reason).await
            }
        };
        if let Err(e) = sent {
            warn!(error = %e, proposal = %id, "client: could not answer proposal");
        }
    }

    async fn reject_proposal(&self, recipient: Address, id: Hash, reason: &str) -> Result<()> {
        let msg = ParticipantMessage::ProposalRejected {
            id,
            reason: reason.to_string(),
        };
        self.send(recipient, msg).await
    }

    fn handle_update(self: &Arc<Self>, sender: Address, update: ChannelUpdate) {
        let (responder, answer) = UpdateResponder::new();
        let event = UpdateEvent {
            update: update.clone(),
            responder,
        };
        if self.events.updates.send(event).is_err() {
            warn!(addr = %self.addr, "client: nobody handles updates");
        }
        tokio::spawn(self.clone().answer_update(sender, update, answer));
    }

    async fn answer_update(
        self: Arc<Self>,
        sender: Address,
        update: ChannelUpdate,
        answer: UpdateAnswer,
    ) {
        let id = update.state.channel_id();
        let version = update.state.version();
        let reject = |reason: String| ParticipantMessage::ChannelUpdateRejected {
            id,
            version,
            reason,
        };

        let Ok((reply, done)) = answer.await else {
            if let Err(e) = self.send(sender, reject("update not handled".into())).await {
                warn!(error = %e, "client: could not reject unhandled update");
            }
            return;
        };

        let result = match reply {
            UpdateReply::Accept => {
                let channel = self.channels.read().await.get(&id).cloned();
                match channel {
                    Some(channel) => match channel.apply(update.state).await {
                        Ok(()) => {
                            let msg = ParticipantMessage::ChannelUpdateAccepted { id, version };
                            self.send(sender, msg).await
                        }
                        Err(e) => {
                            let _ = self.send(sender, reject(e.to_string())).await;
                            Err(e.into())
                        }
                    },
                    None => {
                        let _ = self.send(sender, reject("unknown channel".into())).await;
                        Err(Error::UnknownChannel(id))
                    }
                }
            }
            UpdateReply::Reject(reason) => self.send(sender, reject(reason)).await,
        };
        let _ = done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Allocation, SimAsset};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::Duration;

    async fn connect_pair(rng: &mut StdRng) -> (LocalClient, LocalClient) {
        let bus = LocalBus::new();
        let alice = LocalClient::connect(rng.gen(), &bus).await;
        let bob = LocalClient::connect(rng.gen(), &bus).await;
        (alice, bob)
    }

    fn proposal(rng: &mut StdRng, alice: &LocalClient, bob: &LocalClient) -> ChannelProposal {
        let init_bals = Allocation::single(SimAsset::new(1), [100.into(), 100.into()]);
        let participant = rng.gen();
        ChannelProposal::new(
            rng,
            60,
            participant,
            init_bals,
            [alice.address(), bob.address()],
        )
    }

    #[tokio::test]
    async fn open_and_update() {
        let mut rng = StdRng::seed_from_u64(0);
        let (alice, bob) = connect_pair(&mut rng).await;
        let mut bob_events = bob.incoming().await.unwrap();
        assert!(bob.incoming().await.is_none(), "streams are handed out once");

        let prop = proposal(&mut rng, &alice, &bob);
        let acc = ProposalAcc {
            proposal_id: prop.proposal_id,
            nonce_share: rng.gen(),
            participant: rng.gen(),
        };
        let bob_side = tokio::spawn(async move {
            let event = bob_events.proposals.recv().await.unwrap();
            let ch = event.responder.accept(acc).await.unwrap();
            let event = bob_events.updates.recv().await.unwrap();
            event.responder.accept().await.unwrap();
            ch
        });

        let alice_ch = alice.propose_channel(prop).await.unwrap();
        let mut next = alice_ch.state().await.make_next_state();
        next.transfer(0, 0, 1, 10.into()).unwrap();
        alice_ch.update(next).await.unwrap();

        let bob_ch = bob_side.await.unwrap();
        assert_eq!(alice_ch.id(), bob_ch.id());
        assert_eq!((alice_ch.idx(), bob_ch.idx()), (0, 1));
        assert_eq!(bob_ch.state().await.version(), 1);
        assert_eq!(
            bob_ch.state().await.outcome.balances[0],
            alice_ch.state().await.outcome.balances[0]
        );
        assert!(bob.channel(&alice_ch.id()).await.is_some());
    }

    #[tokio::test]
    async fn rejected_proposal() {
        let mut rng = StdRng::seed_from_u64(1);
        let (alice, bob) = connect_pair(&mut rng).await;
        let mut bob_events = bob.incoming().await.unwrap();
        tokio::spawn(async move {
            let event = bob_events.proposals.recv().await.unwrap();
            event.responder.reject("not today").await.unwrap();
        });

        let prop = proposal(&mut rng, &alice, &bob);
        assert_eq!(
            alice.propose_channel(prop).await.unwrap_err(),
            Error::Rejected {
                reason: "not today".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_responder_rejects() {
        let mut rng = StdRng::seed_from_u64(2);
        let (alice, bob) = connect_pair(&mut rng).await;
        // Nobody takes bob's streams: the responders are dropped.
        drop(bob.incoming().await);

        let prop = proposal(&mut rng, &alice, &bob);
        let res = tokio::time::timeout(Duration::from_secs(5), alice.propose_channel(prop))
            .await
            .expect("an unhandled proposal must be answered");
        assert!(matches!(res, Err(Error::Rejected { .. })));
    }

    #[tokio::test]
    async fn proposal_without_us_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let bus = LocalBus::new();
        let bob = LocalClient::connect(rng.gen(), &bus).await;
        let mut bob_events = bob.incoming().await.unwrap();
        let mallory: Address = rng.gen();
        let mut mallory_rx = bus.subscribe(mallory).await;

        let mut prop = proposal(&mut rng, &bob, &bob);
        prop.peers = [mallory, rng.gen()];
        bus.send(Envelope {
            sender: mallory,
            recipient: bob.address(),
            msg: ParticipantMessage::ChannelProposal(prop.clone()),
        })
        .await
        .unwrap();

        let event = bob_events.proposals.recv().await.unwrap();
        let acc = ProposalAcc {
            proposal_id: prop.proposal_id,
            nonce_share: rng.gen(),
            participant: rng.gen(),
        };
        assert_eq!(
            event.responder.accept(acc).await.unwrap_err(),
            Error::UnknownPeer(bob.address())
        );

        let answer = mallory_rx.recv().await.unwrap();
        assert!(matches!(
            answer.msg,
            ParticipantMessage::ProposalRejected { id, ref reason }
                if id == prop.proposal_id && reason == "not a peer"
        ));
        assert!(bob.inner.channels.read().await.is_empty());
    }

    #[tokio::test]
    async fn abandoned_requests_are_forgotten() {
        let mut rng = StdRng::seed_from_u64(4);
        let (alice, bob) = connect_pair(&mut rng).await;
        let patience = Duration::from_millis(50);

        // Bob's streams are not taken yet, nobody answers.
        let prop = proposal(&mut rng, &alice, &bob);
        let res = tokio::time::timeout(patience, alice.propose_channel(prop)).await;
        assert!(res.is_err());
        assert_eq!(alice.inner.proposals.len(), 0);

        let mut bob_events = bob.incoming().await.unwrap();
        drop(bob_events.proposals.recv().await.unwrap());
        let prop = proposal(&mut rng, &alice, &bob);
        let acc = ProposalAcc {
            proposal_id: prop.proposal_id,
            nonce_share: rng.gen(),
            participant: rng.gen(),
        };
        let bob_side = tokio::spawn(async move {
            let event = bob_events.proposals.recv().await.unwrap();
            event.responder.accept(acc).await.unwrap();
            // Hold on to the update without answering it.
            bob_events.updates.recv().await.unwrap()
        });
        let alice_ch = alice.propose_channel(prop).await.unwrap();

        let next = alice_ch.state().await.make_next_state();
        let res = tokio::time::timeout(patience, alice_ch.update(next)).await;
        assert!(res.is_err());
        assert_eq!(alice.inner.updates.len(), 0);
        assert_eq!(alice_ch.state().await.version(), 0);
        drop(bob_side.await.unwrap());
    }
}
