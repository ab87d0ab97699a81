//! Error types returned by roles, bridges and the client collaborators.

use std::time::Duration;

use thiserror::Error;

use crate::{
    channel::{ChannelId, InvalidUpdate},
    types::{Address, U256},
};

/// Alias for `Result` using the crate wide [Error].
pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can go wrong while executing a channel protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No response within the configured bound.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The peer explicitly declined a proposal or update.
    #[error("rejected by peer: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Malformed(#[from] MalformedInput),

    /// A state transition failed the local validity checks.
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] InvalidUpdate),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("unknown peer: {0}")]
    UnknownPeer(Address),

    /// The other end of an internal handoff (client, bus or responder) went
    /// away before answering.
    #[error("connection closed")]
    Closed,

    /// A proposal decision arrived after the `next()` call waiting for it had
    /// already timed out. The decision is discarded.
    #[error("stale proposal decision discarded")]
    StaleDecision,

    #[error("expected transfer of {expected} but received {received}")]
    UnexpectedTransfer { expected: U256, received: U256 },

    #[error("expected a final state")]
    ExpectedFinal,

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl Error {
    /// Fatal errors indicate a misconfigured run and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Returned when an operation did not complete within its bound.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{op} timed out after {after:?}")]
pub struct TimeoutError {
    pub op: &'static str,
    pub after: Duration,
}

/// Binary input of the wrong length.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unexpected input length {got}, want {expected}")]
pub struct MalformedInput {
    pub expected: usize,
    pub got: usize,
}

/// Programming or configuration errors. These abort the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("number of stages don't match: have {have}, got {got}")]
    StageCountMismatch { have: usize, got: usize },

    #[error("all {0} stages have already been waited on")]
    StagesExhausted(usize),

    #[error("stage signaled more often than participants attached")]
    StageOverrun,

    #[error("identity {0} not in peers")]
    IdentityNotInPeers(Address),

    #[error("identity {identity} differs from client address {client}")]
    IdentityMismatch { identity: Address, client: Address },

    #[error("channel {0} registered twice")]
    DuplicateChannel(ChannelId),
}
