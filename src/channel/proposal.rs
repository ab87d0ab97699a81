//! Proposal phase: the handshake that creates a new channel.
//!
//! The proposer fixes everything except the acceptor's nonce share and
//! channel account, which arrive with the [ProposalAcc]. Both sides then
//! derive the same [Params] and thereby the same [ChannelId].

use rand::Rng;
use sha3::{Digest, Keccak256, Sha3_256};

use super::{Allocation, ChannelId, NonceShare, State, PARTICIPANTS};
use crate::types::{Address, Hash, U256};

/// Channel configuration (also exchanged over the network).
#[derive(Debug, Clone)]
pub struct ChannelProposal {
    pub proposal_id: Hash,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    pub init_bals: Allocation,
    /// Channel account of the proposer.
    pub participant: Address,
    /// Wire addresses of all participants, proposer first.
    pub peers: [Address; PARTICIPANTS],
}

impl ChannelProposal {
    /// Create a proposal with a random proposal ID and nonce share.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        challenge_duration: u64,
        participant: Address,
        init_bals: Allocation,
        peers: [Address; PARTICIPANTS],
    ) -> Self {
        ChannelProposal {
            proposal_id: rng.gen(),
            challenge_duration,
            nonce_share: rng.gen(),
            init_bals,
            participant,
            peers,
        }
    }
}

/// Message sent when a participant accepts the proposed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalAcc {
    pub proposal_id: Hash,
    pub nonce_share: NonceShare,
    /// Freshly generated channel account of the acceptor.
    pub participant: Address,
}

/// Parameters for this channel, fixed once all participants accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: [Address; PARTICIPANTS],
}

impl Params {
    /// Combine a proposal with the acceptor's response.
    pub fn new(prop: &ChannelProposal, acc: &ProposalAcc) -> Self {
        // Go-Perun does NOT use keccak256 here, probably to be less dependent
        // on Ethereum. We do the same here.
        let mut hasher = Sha3_256::new();
        hasher.update(prop.nonce_share.0);
        hasher.update(acc.nonce_share.0);
        let nonce = U256::from_big_endian(hasher.finalize().as_slice());

        Params {
            challenge_duration: prop.challenge_duration,
            nonce,
            participants: [prop.participant, acc.participant],
        }
    }

    /// Not the on-chain encoding, but identical on every participant.
    pub fn channel_id(&self) -> ChannelId {
        let mut hasher = Keccak256::new();
        hasher.update(self.challenge_duration.to_be_bytes());
        let mut nonce = [0u8; 32];
        self.nonce.to_big_endian(&mut nonce);
        hasher.update(nonce);
        for part in &self.participants {
            hasher.update(part.0);
        }
        Hash(hasher.finalize().into())
    }

    /// Version 0 state of the channel.
    pub fn initial_state(&self, init_bals: Allocation) -> State {
        State::new(self.channel_id(), init_bals)
    }
}
