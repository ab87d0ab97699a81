//! Barriers to synchronize independently running roles.
//!
//! A [Stages] set is created by one role and handed to all others. Every
//! attached role arms each stage with one expected arrival; waiting on a stage
//! signals arrival and blocks until all attached roles arrived.

use std::{ops::Index, sync::Arc};

use tokio::sync::watch;

use crate::error::FatalError;

/// Countdown barrier: released once the pending count drops to zero.
#[derive(Debug)]
pub struct Stage {
    pending: watch::Sender<usize>,
}

impl Stage {
    fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self { pending }
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    fn add(&self, n: usize) {
        self.pending.send_modify(|p| *p += n);
    }

    fn done(&self) -> Result<(), FatalError> {
        let mut res = Ok(());
        self.pending.send_modify(|p| match p.checked_sub(1) {
            Some(left) => *p = left,
            None => res = Err(FatalError::StageOverrun),
        });
        res
    }

    async fn wait(&self) {
        let mut pending = self.pending.subscribe();
        while *pending.borrow_and_update() != 0 {
            // The sender lives in `self`, so this cannot fail while we wait.
            if pending.changed().await.is_err() {
                break;
            }
        }
    }

    /// Signal arrival, then block until every attached role arrived.
    ///
    /// Intentionally unbounded: a peer that never arrives is a bug in the
    /// protocol script.
    pub async fn arrive_and_wait(&self) -> Result<(), FatalError> {
        self.done()?;
        self.wait().await;
        Ok(())
    }
}

/// Shared, fixed-length sequence of [Stage]s.
#[derive(Debug, Clone)]
pub struct Stages(Arc<[Stage]>);

impl Stages {
    pub fn new(num_stages: usize) -> Self {
        Stages((0..num_stages).map(|_| Stage::new()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Expect one more participant at every stage.
    pub(crate) fn attach(&self) {
        for stage in self.0.iter() {
            stage.add(1);
        }
    }
}

impl Index<usize> for Stages {
    type Output = Stage;

    fn index(&self, index: usize) -> &Stage {
        &self.0[index]
    }
}
