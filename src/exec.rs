//! Scripted protocol runs.
//!
//! An [Executer] runs one side of a protocol script on top of a [Role]. The
//! two-party script has [Alice] propose a channel to [Bob], both send each
//! other payments and Alice finally closes the channel with a final state.
//! Every phase ends with a stage, so the two sides move in lockstep.

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    channel::{Allocation, ChannelProposal, SimAsset},
    client::Client,
    error::{FatalError, Result},
    role::{Role, RoleSetup, Stages},
    types::{Address, U256},
};

/// Number of stages of the Alice/Bob script.
pub const TWO_PARTY_STAGES: usize = 4;

/// Challenge duration of channels proposed by [Alice].
pub const CHALLENGE_DURATION: u64 = 60;

/// Parameters of a two-party run. Indices follow `peer_addrs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub peer_addrs: [Address; 2],
    pub asset: SimAsset,
    pub init_bals: [U256; 2],
    #[serde(default = "default_num_payments")]
    pub num_payments: [usize; 2],
    #[serde(default = "default_tx_amounts")]
    pub tx_amounts: [U256; 2],
}

fn default_num_payments() -> [usize; 2] {
    [2, 2]
}

fn default_tx_amounts() -> [U256; 2] {
    [U256::from(5), U256::from(3)]
}

impl ExecConfig {
    pub fn new(peer_addrs: [Address; 2], asset: SimAsset, init_bals: [U256; 2]) -> Self {
        Self {
            peer_addrs,
            asset,
            init_bals,
            num_payments: default_num_payments(),
            tx_amounts: default_tx_amounts(),
        }
    }
}

/// One side of a scripted protocol run.
#[async_trait]
pub trait Executer: Send {
    /// Create a stage set to hand to the other executers of the run.
    fn enable_stages(&mut self) -> Stages;

    fn set_stages(&mut self, stages: Stages) -> core::result::Result<(), FatalError>;

    async fn execute(&mut self, cfg: &ExecConfig) -> Result<()>;
}

/// Proposes the channel, pays first and closes the channel.
#[derive(Debug)]
pub struct Alice<C: Client> {
    role: Role<C>,
    rng: StdRng,
}

impl<C: Client> Alice<C> {
    pub fn new(
        setup: RoleSetup,
        client: C,
        rng: StdRng,
    ) -> core::result::Result<Self, FatalError> {
        Ok(Self {
            role: Role::new(setup, client, TWO_PARTY_STAGES)?,
            rng,
        })
    }

    pub fn role(&self) -> &Role<C> {
        &self.role
    }
}

#[async_trait]
impl<C: Client> Executer for Alice<C> {
    fn enable_stages(&mut self) -> Stages {
        self.role.enable_stages()
    }

    fn set_stages(&mut self, stages: Stages) -> core::result::Result<(), FatalError> {
        self.role.set_stages(stages)
    }

    async fn execute(&mut self, cfg: &ExecConfig) -> Result<()> {
        let (we, they) = self.role.idxs(&cfg.peer_addrs)?;
        // Alice never gets proposals, but has to answer Bob's updates.
        let proposals = self.role.accept_all_proposals(StdRng::seed_from_u64(self.rng.gen()));
        let updates = self.role.update_handler();
        self.role.handle(proposals, updates).await?;

        let participant = self.role.wallet().new_random_account(&mut self.rng).address();
        let prop = ChannelProposal::new(
            &mut self.rng,
            CHALLENGE_DURATION,
            participant,
            Allocation::single(cfg.asset, cfg.init_bals),
            cfg.peer_addrs,
        );
        let ch = self.role.propose_channel(prop).await?;
        info!(role = %self.role.name(), channel = %ch.id(), "Proposed channel open");
        self.role.wait_stage().await?;

        for _ in 0..cfg.num_payments[we] {
            ch.send_transfer(cfg.tx_amounts[we]).await?;
        }
        self.role.wait_stage().await?;

        for _ in 0..cfg.num_payments[they] {
            ch.recv_transfer(cfg.tx_amounts[they]).await?;
        }
        self.role.wait_stage().await?;

        ch.send_final().await?;
        self.role.wait_stage().await?;
        Ok(())
    }
}

/// Accepts the channel, pays second and receives the final state.
#[derive(Debug)]
pub struct Bob<C: Client> {
    role: Role<C>,
    rng: StdRng,
}

impl<C: Client> Bob<C> {
    pub fn new(
        setup: RoleSetup,
        client: C,
        rng: StdRng,
    ) -> core::result::Result<Self, FatalError> {
        Ok(Self {
            role: Role::new(setup, client, TWO_PARTY_STAGES)?,
            rng,
        })
    }

    pub fn role(&self) -> &Role<C> {
        &self.role
    }
}

#[async_trait]
impl<C: Client> Executer for Bob<C> {
    fn enable_stages(&mut self) -> Stages {
        self.role.enable_stages()
    }

    fn set_stages(&mut self, stages: Stages) -> core::result::Result<(), FatalError> {
        self.role.set_stages(stages)
    }

    async fn execute(&mut self, cfg: &ExecConfig) -> Result<()> {
        let (we, they) = self.role.idxs(&cfg.peer_addrs)?;
        let proposals = self.role.accept_all_proposals(StdRng::seed_from_u64(self.rng.gen()));
        let updates = self.role.update_handler();
        self.role.handle(proposals.clone(), updates).await?;

        let ch = proposals.next().await?;
        info!(role = %self.role.name(), channel = %ch.id(), "Accepted channel open");
        self.role.wait_stage().await?;

        for _ in 0..cfg.num_payments[they] {
            ch.recv_transfer(cfg.tx_amounts[they]).await?;
        }
        self.role.wait_stage().await?;

        for _ in 0..cfg.num_payments[we] {
            ch.send_transfer(cfg.tx_amounts[we]).await?;
        }
        self.role.wait_stage().await?;

        ch.recv_final().await?;
        self.role.wait_stage().await?;
        Ok(())
    }
}

/// Run `alice` and `bob` against each other in lockstep.
///
/// Stops at the first error of either side; the other side is cancelled.
pub async fn execute_two_party_test<A, B>(
    alice: &mut A,
    bob: &mut B,
    cfg: &ExecConfig,
) -> Result<()>
where
    A: Executer,
    B: Executer,
{
    let stages = alice.enable_stages();
    bob.set_stages(stages)?;

    let res = tokio::try_join!(alice.execute(cfg), bob.execute(cfg));
    if let Err(e) = &res {
        if e.is_fatal() {
            error!(error = %e, "Two party run aborted");
        }
    }
    res.map(|_| ())
}
