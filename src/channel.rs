mod asset;
mod proposal;
mod state;

use crate::types::{Bytes32, Hash};

pub use asset::*;
pub use proposal::*;
pub use state::*;

/// Number of participants in a channel. Only two-party channels are
/// supported.
pub const PARTICIPANTS: usize = 2;

/// ID (Index) of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Uniquely identifies a channel instance.
pub type ChannelId = Hash;

/// The nonce added by each participant.
///
/// They are combined into a single [U256](crate::types::U256) using SHA3-256.
pub type NonceShare = Bytes32;
