mod local;

use async_trait::async_trait;
use core::fmt::Debug;

pub use local::LocalBus;

use crate::{
    channel::{ChannelId, ChannelProposal, ChannelUpdate, ProposalAcc},
    error::Result,
    types::{Address, Hash},
};

/// Messages sent between participants of a channel.
#[derive(Debug, Clone)]
pub enum ParticipantMessage {
    ChannelProposal(ChannelProposal),
    ProposalAccepted(ProposalAcc),
    ProposalRejected {
        id: Hash,
        reason: String,
    },
    ChannelUpdate(ChannelUpdate),
    ChannelUpdateAccepted {
        id: ChannelId,
        version: u64,
    },
    ChannelUpdateRejected {
        id: ChannelId,
        version: u64,
        reason: String,
    },
}

/// A [ParticipantMessage] together with its routing information.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub msg: ParticipantMessage,
}

/// Abstraction over the network connecting participants.
#[async_trait]
pub trait MessageBus: Debug + Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}
