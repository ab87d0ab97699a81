//! Participant side of Perun payment channel protocol runs.
//!
//! A [Role] drives one participant through proposing or accepting a channel,
//! exchanging updates and closing it. Several roles of the same run
//! synchronize on shared [Stages](role::Stages); see [exec] for the two-party
//! script.

pub mod channel;
pub mod client;
pub mod error;
pub mod exec;
pub mod role;
pub mod types;
pub mod wallet;
pub mod wire;

pub use error::{Error, FatalError, Result};
pub use role::{Role, RoleSetup};
pub use types::{Address, Hash, U256};
