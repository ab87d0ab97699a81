//! Interface to the client connection a role drives.
//!
//! A [Client] proposes channels and surfaces everything the peers send as
//! [Incoming] event streams. Inbound proposals and updates carry single-use
//! responders: consuming one sends the answer to the peer and waits until the
//! client has processed it.

mod local;

use async_trait::async_trait;
use core::{fmt::Debug, future::Future};
use tokio::sync::{mpsc, oneshot};

pub use local::{LocalChannel, LocalClient};

use crate::{
    channel::{ChannelId, ChannelProposal, ChannelUpdate, PartIdx, ProposalAcc, State},
    error::{Error, Result},
    types::Address,
};

/// Handle to an open channel as provided by the client.
#[async_trait]
pub trait Channel: Debug + Clone + Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    /// Our index in the channel's participants.
    fn idx(&self) -> PartIdx;

    async fn state(&self) -> State;

    /// Propose `new_state` to the peer and wait for its answer. The local
    /// state only changes if the peer accepted.
    async fn update(&self, new_state: State) -> Result<()>;
}

/// The client connection used by a role.
#[async_trait]
pub trait Client: Debug + Send + Sync + 'static {
    type Channel: Channel;

    /// Wire address of this client.
    fn address(&self) -> Address;

    /// Send the proposal to the peer and wait for the channel to open. Does
    /// not time out on its own.
    async fn propose_channel(&self, prop: ChannelProposal) -> Result<Self::Channel>;

    /// Streams of inbound proposals and updates. Only the first call returns
    /// them.
    async fn incoming(&self) -> Option<Incoming<Self::Channel>>;
}

/// Sender half of the answer to a responder: the result of processing it.
pub(crate) type Completion<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone)]
pub enum ProposalReply {
    Accept(ProposalAcc),
    Reject(String),
}

#[derive(Debug, Clone)]
pub enum UpdateReply {
    Accept,
    Reject(String),
}

/// Answer to an inbound proposal, as handed to the client.
#[derive(Debug)]
pub(crate) struct ProposalDecision<C> {
    pub(crate) reply: ProposalReply,
    /// Takes the opened channel, or `None` once a rejection was sent.
    pub(crate) done: Completion<Option<C>>,
    /// Resolves once the accepting side took over the opened channel. The
    /// proposer learns about the acceptance only after that.
    pub(crate) ready: oneshot::Receiver<Result<()>>,
}

pub(crate) type ProposalAnswer<C> = oneshot::Receiver<ProposalDecision<C>>;
pub(crate) type UpdateAnswer = oneshot::Receiver<(UpdateReply, Completion<()>)>;

/// Single-use answer handle for an inbound proposal.
///
/// Dropping it unanswered rejects the proposal.
#[derive(Debug)]
pub struct ProposalResponder<C> {
    reply: oneshot::Sender<ProposalDecision<C>>,
}

impl<C> ProposalResponder<C> {
    pub(crate) fn new() -> (Self, ProposalAnswer<C>) {
        let (reply, answer) = oneshot::channel();
        (Self { reply }, answer)
    }

    /// Accept the proposal and wait until the channel is open.
    pub async fn accept(self, acc: ProposalAcc) -> Result<C> {
        self.accept_with(acc, |ch| async move { Ok(ch) }).await
    }

    /// Accept the proposal and run `on_open` on the opened channel before the
    /// proposer is told. If `on_open` fails, the proposal is rejected with its
    /// error.
    pub async fn accept_with<T, F, Fut>(self, acc: ProposalAcc, on_open: F) -> Result<T>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (ready_tx, ready) = oneshot::channel();
        let channel = self
            .respond(ProposalReply::Accept(acc), ready)
            .await?
            .ok_or(Error::Closed)?;
        let opened = on_open(channel).await;
        // The client stops listening once it gave up on us.
        let _ = ready_tx.send(opened.as_ref().map(|_| ()).map_err(|e| e.clone()));
        opened
    }

    pub async fn reject(self, reason: &str) -> Result<()> {
        let (_, ready) = oneshot::channel();
        self.respond(ProposalReply::Reject(reason.to_string()), ready)
            .await
            .map(|_| ())
    }

    async fn respond(
        self,
        reply: ProposalReply,
        ready: oneshot::Receiver<Result<()>>,
    ) -> Result<Option<C>> {
        let (done, result) = oneshot::channel();
        self.reply
            .send(ProposalDecision { reply, done, ready })
            .map_err(|_| Error::Closed)?;
        result.await.map_err(|_| Error::Closed)?
    }
}

/// Single-use answer handle for an inbound update.
///
/// Dropping it unanswered rejects the update.
#[derive(Debug)]
pub struct UpdateResponder {
    reply: oneshot::Sender<(UpdateReply, Completion<()>)>,
}

impl UpdateResponder {
    pub(crate) fn new() -> (Self, UpdateAnswer) {
        let (reply, answer) = oneshot::channel();
        (Self { reply }, answer)
    }

    /// Accept the update; the client applies it to its channel.
    pub async fn accept(self) -> Result<()> {
        self.respond(UpdateReply::Accept).await
    }

    pub async fn reject(self, reason: &str) -> Result<()> {
        self.respond(UpdateReply::Reject(reason.to_string())).await
    }

    async fn respond(self, reply: UpdateReply) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.reply.send((reply, done)).map_err(|_| Error::Closed)?;
        result.await.map_err(|_| Error::Closed)?
    }
}

#[derive(Debug)]
pub struct ProposalEvent<C> {
    pub proposal: ChannelProposal,
    pub responder: ProposalResponder<C>,
}

#[derive(Debug)]
pub struct UpdateEvent {
    pub update: ChannelUpdate,
    pub responder: UpdateResponder,
}

/// Inbound event streams of a [Client].
#[derive(Debug)]
pub struct Incoming<C> {
    pub proposals: mpsc::UnboundedReceiver<ProposalEvent<C>>,
    pub updates: mpsc::UnboundedReceiver<UpdateEvent>,
}
