//! A single participant executing a channel protocol script.
//!
//! A [Role] owns a client connection, the registry of channels it is a
//! confirmed party to and, optionally, a shared [Stages] set to rendezvous with
//! the other roles of the same run. Inbound proposals and updates are handled
//! in a background task (see [Role::handle]) and bridged to the script through
//! [AcceptAllProposalHandler::next] and the [PaymentChannel] receive methods.

mod payment;
mod proposal;
mod registry;
mod stages;
mod update;


use std::{sync::Arc, time::Duration};

use rand::rngs::StdRng;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, error, info};

pub use payment::PaymentChannel;
pub use proposal::AcceptAllProposalHandler;
pub use registry::ChannelRegistry;
pub use stages::{Stage, Stages};
pub use update::RoleUpdateHandler;

use crate::{
    channel::{ChannelProposal, PartIdx},
    client::{Client, Incoming},
    error::{Error, FatalError, Result, TimeoutError},
    types::Address,
    wallet::{Account, Wallet},
};

/// Timeout for every network facing call of a role, unless configured
/// otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to set up a [Role].
#[derive(Debug)]
pub struct RoleSetup {
    /// Used in logs only.
    pub name: String,
    /// Wire identity. The role's client must be connected as this address.
    pub identity: Account,
    /// Creates fresh channel accounts when accepting proposals.
    pub wallet: Arc<dyn Wallet>,
    pub timeout: Duration,
}

impl RoleSetup {
    pub fn new(name: &str, identity: Account, wallet: impl Wallet + 'static) -> Self {
        Self {
            name: name.to_string(),
            identity,
            wallet: Arc::new(wallet),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Registry handle type of a role using client `C`.
pub type ChannelHandle<C> = Arc<PaymentChannel<<C as Client>::Channel>>;

/// The parts of a role its background handlers need.
#[derive(Debug)]
pub(crate) struct RoleContext<C: Client> {
    pub(crate) name: String,
    pub(crate) timeout: Duration,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) chans: ChannelRegistry<ChannelHandle<C>>,
    errors: mpsc::UnboundedSender<Error>,
}

impl<C: Client> RoleContext<C> {
    /// Report a non-fatal error that has no caller to return it to.
    pub(crate) fn record(&self, err: Error) {
        // Nobody listening is fine.
        let _ = self.errors.send(err);
    }

    pub(crate) fn timeout_error(&self, op: &'static str) -> TimeoutError {
        TimeoutError {
            op,
            after: self.timeout,
        }
    }

    /// Wrap `ch`, register it and return the registered handle.
    pub(crate) async fn register(&self, ch: C::Channel) -> Result<ChannelHandle<C>> {
        let handle = Arc::new(PaymentChannel::new(ch, &self.name, self.timeout));
        if let Err(e) = self.chans.register(handle.id(), handle.clone()).await {
            error!(role = %self.name, error = %e, "Registering channel failed");
            return Err(e.into());
        }
        info!(role = %self.name, channel = %handle.id(), "Channel open");
        Ok(handle)
    }
}

#[derive(Debug)]
pub struct Role<C: Client> {
    identity: Account,
    client: Arc<C>,
    ctx: Arc<RoleContext<C>>,
    /// Fixed number of stages, checked against attached [Stages].
    stage_count: usize,
    /// Stages not waited on yet. Consumed back to front.
    num_stages: usize,
    stages: Option<Stages>,
    errors: Option<mpsc::UnboundedReceiver<Error>>,
    handler: Option<JoinHandle<()>>,
}

impl<C: Client> Role<C> {
    /// Fails if `client` is not connected as the identity of `setup`.
    pub fn new(
        setup: RoleSetup,
        client: C,
        num_stages: usize,
    ) -> core::result::Result<Self, FatalError> {
        let identity = setup.identity.address();
        if identity != client.address() {
            error!(role = %setup.name, %identity, client = %client.address(), "Identity mismatch");
            return Err(FatalError::IdentityMismatch {
                identity,
                client: client.address(),
            });
        }
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Ok(Role {
            identity: setup.identity,
            client: Arc::new(client),
            ctx: Arc::new(RoleContext {
                name: setup.name,
                timeout: setup.timeout,
                wallet: setup.wallet,
                chans: ChannelRegistry::new(),
                errors: errors_tx,
            }),
            stage_count: num_stages,
            num_stages,
            stages: None,
            errors: Some(errors_rx),
            handler: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn timeout(&self) -> Duration {
        self.ctx.timeout
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn wallet(&self) -> &dyn Wallet {
        self.ctx.wallet.as_ref()
    }

    pub fn channels(&self) -> &ChannelRegistry<ChannelHandle<C>> {
        &self.ctx.chans
    }

    /// Our own and our peer's index in `peers`.
    pub fn idxs(
        &self,
        peers: &[Address; 2],
    ) -> core::result::Result<(PartIdx, PartIdx), FatalError> {
        let me = self.address();
        if peers[0] == me {
            Ok((0, 1))
        } else if peers[1] == me {
            Ok((1, 0))
        } else {
            error!(role = %self.name(), identity = %me, "Identity not in peers");
            Err(FatalError::IdentityNotInPeers(me))
        }
    }

    /// Propose a channel and wait for it to open. The channel is registered
    /// before this returns.
    pub async fn propose_channel(&self, prop: ChannelProposal) -> Result<ChannelHandle<C>> {
        debug!(role = %self.name(), proposal = %prop.proposal_id, "Proposing channel");
        let ch = timeout(self.timeout(), self.client.propose_channel(prop))
            .await
            .map_err(|_| self.ctx.timeout_error("propose channel"))??;
        self.ctx.register(ch).await
    }

    /// Create a new stage set for this and other roles. The other roles join
    /// with [Role::set_stages].
    pub fn enable_stages(&mut self) -> Stages {
        let stages = Stages::new(self.stage_count);
        stages.attach();
        self.stages = Some(stages.clone());
        stages
    }

    /// Join a stage set created by another role.
    pub fn set_stages(&mut self, stages: Stages) -> core::result::Result<(), FatalError> {
        if stages.len() != self.stage_count {
            error!(
                role = %self.name(),
                have = self.stage_count,
                got = stages.len(),
                "Number of stages don't match"
            );
            return Err(FatalError::StageCountMismatch {
                have: self.stage_count,
                got: stages.len(),
            });
        }
        stages.attach();
        self.stages = Some(stages);
        Ok(())
    }

    /// Wait until every attached role reached the next stage. Does nothing if
    /// no stages are attached.
    pub async fn wait_stage(&mut self) -> core::result::Result<(), FatalError> {
        let Some(stages) = &self.stages else {
            return Ok(());
        };
        if self.num_stages == 0 {
            error!(role = %self.ctx.name, "Waited on more stages than configured");
            return Err(FatalError::StagesExhausted(self.stage_count));
        }
        self.num_stages -= 1;
        debug!(role = %self.ctx.name, stage = self.num_stages, "Waiting on stage");
        stages[self.num_stages].arrive_and_wait().await
    }

    /// Handler that accepts every incoming proposal with a fresh account.
    pub fn accept_all_proposals(&self, rng: StdRng) -> AcceptAllProposalHandler<C> {
        AcceptAllProposalHandler::new(self.ctx.clone(), rng)
    }

    /// Handler that routes incoming updates to our registered channels.
    pub fn update_handler(&self) -> RoleUpdateHandler<C> {
        RoleUpdateHandler::new(self.ctx.clone())
    }

    /// Start handling the client's inbound events with the given handlers.
    ///
    /// The task is stopped when the role is dropped.
    pub async fn handle(
        &mut self,
        proposals: AcceptAllProposalHandler<C>,
        updates: RoleUpdateHandler<C>,
    ) -> Result<()> {
        let incoming = self.client.incoming().await.ok_or(Error::Closed)?;
        let name = self.ctx.name.clone();
        let task = tokio::spawn(handle_incoming(name, incoming, proposals, updates));
        if let Some(old) = self.handler.replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Errors of the background handlers. Only the first call returns the
    /// receiver.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.take()
    }
}

impl<C: Client> Drop for Role<C> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

async fn handle_incoming<C: Client>(
    role: String,
    incoming: Incoming<C::Channel>,
    proposals: AcceptAllProposalHandler<C>,
    updates: RoleUpdateHandler<C>,
) {
    let Incoming {
        proposals: mut proposal_events,
        updates: mut update_events,
    } = incoming;
    loop {
        tokio::select! {
            Some(event) = proposal_events.recv() => proposals.handle(event),
            Some(event) = update_events.recv() => updates.handle(event),
            else => break,
        }
    }
    debug!(role = %role, "Inbound event streams closed");
}
