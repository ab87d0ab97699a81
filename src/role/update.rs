use std::sync::Arc;

use tokio::time::timeout;
use tracing::warn;

use super::RoleContext;
use crate::{
    client::{Client, UpdateEvent},
    error::Error,
};

/// Reason sent to the peer for updates on channels we don't know.
pub const UNKNOWN_CHANNEL: &str = "unknown channel";

/// Routes incoming updates to the role's registered channels.
#[derive(Debug)]
pub struct RoleUpdateHandler<C: Client> {
    role: Arc<RoleContext<C>>,
}

impl<C: Client> Clone for RoleUpdateHandler<C> {
    fn clone(&self) -> Self {
        Self {
            role: self.role.clone(),
        }
    }
}

impl<C: Client> RoleUpdateHandler<C> {
    pub(super) fn new(role: Arc<RoleContext<C>>) -> Self {
        Self { role }
    }

    /// Handle `event` in the background. Never blocks.
    pub fn handle(&self, event: UpdateEvent) {
        let this = self.clone();
        tokio::spawn(async move { this.handle_update(event).await });
    }

    /// Delegate `event` to its channel, or reject it if the channel is not
    /// registered. Every update is answered.
    pub async fn handle_update(&self, event: UpdateEvent) {
        let UpdateEvent { update, responder } = event;
        let id = update.state.channel_id();
        match self.role.chans.lookup(&id).await {
            Some(ch) => ch.handle(update, responder).await,
            None => {
                warn!(role = %self.role.name, channel = %id, "Rejecting update on unknown channel");
                self.role.record(Error::UnknownChannel(id));
                match timeout(self.role.timeout, responder.reject(UNKNOWN_CHANNEL)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(role = %self.role.name, error = %e, "Could not reject update")
                    }
                    Err(_) => warn!(
                        role = %self.role.name,
                        error = %self.role.timeout_error("reject update"),
                        "Could not reject update"
                    ),
                }
            }
        }
    }
}
