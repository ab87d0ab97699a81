//! Channel state and the rules for moving from one state to the next.

use std::sync::Arc;

use thiserror::Error;

use super::{Asset, ChannelId, PartIdx, PARTICIPANTS};
use crate::types::U256;

/// Balance of every participant in one asset.
pub type ParticipantBalances = [U256; PARTICIPANTS];

/// Stores which participant has how much of each asset.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub assets: Vec<Arc<dyn Asset>>,
    /// Indexed by asset, then by participant.
    pub balances: Vec<ParticipantBalances>,
}

impl Allocation {
    pub fn new(assets: Vec<Arc<dyn Asset>>, balances: Vec<ParticipantBalances>) -> Self {
        debug_assert_eq!(assets.len(), balances.len());
        Self { assets, balances }
    }

    /// Allocation over a single asset.
    pub fn single<A: Asset>(asset: A, balances: ParticipantBalances) -> Self {
        let asset: Arc<dyn Asset> = Arc::new(asset);
        Self::new(vec![asset], vec![balances])
    }

    /// Sum over all participants, per asset.
    pub fn total_assets(&self) -> Vec<U256> {
        self.balances
            .iter()
            .map(|bals| {
                bals.iter()
                    .fold(U256::zero(), |acc, b| acc.saturating_add(*b))
            })
            .collect()
    }

    /// Assets are compared by kind-aware equality, not by encoding.
    pub fn same_assets(&self, other: &Allocation) -> bool {
        self.assets.len() == other.assets.len()
            && self
                .assets
                .iter()
                .zip(&other.assets)
                .all(|(a, b)| a.equals(b.as_ref()))
    }
}

/// Reasons a proposed state cannot follow the current one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidUpdate {
    #[error("channel ID mismatch")]
    InvalidChannelID,
    #[error("version must increase by one")]
    InvalidVersionNumber,
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("assets mismatch")]
    AssetsMismatch,
    #[error("total allocation amount mismatch")]
    TotalAllocationAmountMismatch,
    #[error("insufficient balance")]
    InsufficientBalance,
}

/// Stores the complete state of a channel.
#[derive(Debug, Clone)]
pub struct State {
    id: ChannelId,
    version: u64,
    pub outcome: Allocation,
    pub is_final: bool,
}

impl State {
    pub fn new(id: ChannelId, outcome: Allocation) -> Self {
        State {
            id,
            version: 0,
            outcome,
            is_final: false,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    /// Create a new state that will replace this state.
    ///
    /// Having id and version as private fields forces the caller to not
    /// accidentally write garbage to one of those fields.
    pub fn make_next_state(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            outcome: self.outcome.clone(),
            is_final: self.is_final,
        }
    }

    /// Move `amount` of asset `asset` from `from` to `to`.
    pub fn transfer(
        &mut self,
        asset: usize,
        from: PartIdx,
        to: PartIdx,
        amount: U256,
    ) -> Result<(), InvalidUpdate> {
        let bals = self
            .outcome
            .balances
            .get_mut(asset)
            .ok_or(InvalidUpdate::AssetsMismatch)?;
        let (remaining, underflow) = bals[from].overflowing_sub(amount);
        if underflow {
            return Err(InvalidUpdate::InsufficientBalance);
        }
        bals[from] = remaining;
        bals[to] = bals[to].saturating_add(amount);
        Ok(())
    }

    /// Checks the generic (app independent) rules for replacing `self` with
    /// `new_state`.
    pub fn check_valid_transition(&self, new_state: &State) -> Result<(), InvalidUpdate> {
        if new_state.channel_id() != self.channel_id() {
            Err(InvalidUpdate::InvalidChannelID)
        } else if self.is_final {
            Err(InvalidUpdate::CurrentStateIsFinal)
        } else if new_state.version() != self.version() + 1 {
            Err(InvalidUpdate::InvalidVersionNumber)
        } else if !new_state.outcome.same_assets(&self.outcome) {
            Err(InvalidUpdate::AssetsMismatch)
        } else if new_state.outcome.total_assets() != self.outcome.total_assets() {
            Err(InvalidUpdate::TotalAllocationAmountMismatch)
        } else {
            Ok(())
        }
    }
}

/// A proposed new state for an existing channel.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub state: State,
    /// Participant that proposed the update.
    pub actor_idx: PartIdx,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::EthAsset, types::Hash};

    fn build_test_state() -> State {
        State::new(
            Hash([0x11; 32]),
            Allocation::single(
                crate::channel::SimAsset::new(0x3333),
                [0x5555.into(), 0x6666.into()],
            ),
        )
    }

    #[test]
    fn transfer_is_valid_transition() {
        let state = build_test_state();
        let mut next = state.make_next_state();
        next.transfer(0, 0, 1, 5.into()).unwrap();

        assert_eq!(next.version(), 1);
        assert_eq!(
            next.outcome.balances[0],
            [U256::from(0x5550), U256::from(0x666b)]
        );
        assert_eq!(state.check_valid_transition(&next), Ok(()));
    }

    #[test]
    fn transfer_insufficient_balance() {
        let mut next = build_test_state().make_next_state();
        assert_eq!(
            next.transfer(0, 1, 0, 0x6667.into()),
            Err(InvalidUpdate::InsufficientBalance)
        );
        assert_eq!(
            next.transfer(1, 1, 0, 1.into()),
            Err(InvalidUpdate::AssetsMismatch)
        );
    }

    #[test]
    fn invalid_transitions() {
        let state = build_test_state();

        let skipped = state.make_next_state().make_next_state();
        assert_eq!(
            state.check_valid_transition(&skipped),
            Err(InvalidUpdate::InvalidVersionNumber)
        );

        let mut minted = state.make_next_state();
        minted.outcome.balances[0][0] += U256::from(1);
        assert_eq!(
            state.check_valid_transition(&minted),
            Err(InvalidUpdate::TotalAllocationAmountMismatch)
        );

        let mut other_id = State::new(Hash([0x22; 32]), state.outcome.clone());
        other_id.version = 1;
        assert_eq!(
            state.check_valid_transition(&other_id),
            Err(InvalidUpdate::InvalidChannelID)
        );

        let mut final_state = state.make_next_state();
        final_state.is_final = true;
        assert_eq!(
            final_state.check_valid_transition(&final_state.make_next_state()),
            Err(InvalidUpdate::CurrentStateIsFinal)
        );
    }

    #[test]
    fn asset_kind_change_is_rejected() {
        let state = build_test_state();
        let mut next = state.make_next_state();
        // Same numeric content, different kind.
        next.outcome.assets[0] = Arc::new(EthAsset {
            chain_id: 0x3333.into(),
            holder: Default::default(),
        });
        assert_eq!(
            state.check_valid_transition(&next),
            Err(InvalidUpdate::AssetsMismatch)
        );
    }
}
