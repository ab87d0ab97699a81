//! Assets: the denominations a channel's balances are kept in.
//!
//! Concrete asset kinds live behind the [Asset] trait so that a channel state
//! can hold assets from different backends. Comparing two assets of different
//! kinds is well defined (never equal) and never panics.

use core::{any::Any, fmt::Debug};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{Deserialize, Serialize};

use crate::{
    error::MalformedInput,
    types::{Address, U256},
};

/// Contract every asset kind has to fulfill.
pub trait Asset: Debug + Send + Sync + 'static {
    /// Canonical binary representation.
    fn encode(&self) -> Vec<u8>;

    /// Type-guarded equality: `false` if `other` is not the same concrete
    /// kind, regardless of its encoding.
    fn equals(&self, other: &dyn Asset) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Length of the binary representation of a [SimAsset], in bytes.
pub const SIM_ASSET_BINARY_LEN: usize = 8;

/// Simulated asset, only identified by a signed 64-bit ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SimAsset {
    pub id: i64,
}

impl SimAsset {
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    /// Big endian, like every integer in the channel state encoding.
    pub fn to_bytes(&self) -> [u8; SIM_ASSET_BINARY_LEN] {
        self.id.to_be_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedInput> {
        let bytes: [u8; SIM_ASSET_BINARY_LEN] =
            data.try_into().map_err(|_| MalformedInput {
                expected: SIM_ASSET_BINARY_LEN,
                got: data.len(),
            })?;
        Ok(Self {
            id: i64::from_be_bytes(bytes),
        })
    }
}

impl Asset for SimAsset {
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    fn equals(&self, other: &dyn Asset) -> bool {
        match other.as_any().downcast_ref::<SimAsset>() {
            Some(other) => self.id == other.id,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Distribution<SimAsset> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> SimAsset {
        SimAsset { id: rng.gen() }
    }
}

/// Uniquely identifies an on-chain asset by blockchain + AssetHolder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EthAsset {
    pub chain_id: U256,
    pub holder: Address,
}

/// Length of the binary representation of an [EthAsset], in bytes.
pub const ETH_ASSET_BINARY_LEN: usize = 32 + 20;

impl EthAsset {
    pub fn decode(data: &[u8]) -> Result<Self, MalformedInput> {
        if data.len() != ETH_ASSET_BINARY_LEN {
            return Err(MalformedInput {
                expected: ETH_ASSET_BINARY_LEN,
                got: data.len(),
            });
        }
        let mut holder = Address::default();
        holder.0.copy_from_slice(&data[32..]);
        Ok(Self {
            chain_id: U256::from_big_endian(&data[..32]),
            holder,
        })
    }
}

impl Asset for EthAsset {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ETH_ASSET_BINARY_LEN];
        self.chain_id.to_big_endian(&mut buf[..32]);
        buf[32..].copy_from_slice(&self.holder.0);
        buf
    }

    fn equals(&self, other: &dyn Asset) -> bool {
        match other.as_any().downcast_ref::<EthAsset>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
