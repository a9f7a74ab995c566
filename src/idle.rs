use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

use crate::controller::{Controller, GuildKey};

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("room membership unavailable")]
    Unavailable,
}

#[async_trait]
pub trait RoomMembership: Send + Sync {
    /// Number of non-bot participants sharing the bot's voice channel.
    async fn human_members(&self, guild: GuildKey) -> Result<usize, MembershipError>;
}

/// Periodically tears down sessions whose room is empty or whose last
/// activity is older than the controller's idle timeout.
pub struct IdleMonitor {
    controller: Arc<Controller>,
    membership: Arc<dyn RoomMembership>,
    check_interval: Duration,
    // Whether an unreachable membership source counts as "someone present".
    fail_open: bool,
}

impl IdleMonitor {
    pub fn new(
        controller: Arc<Controller>,
        membership: Arc<dyn RoomMembership>,
        check_interval: Duration,
        fail_open: bool,
    ) -> Self {
        Self {
            controller,
            membership,
            check_interval,
            fail_open,
        }
    }

    pub async fn run(self) {
        let mut ticker = time::interval(self.check_interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over the active sessions. The membership query happens
    /// before any session lock is taken; the controller re-validates the
    /// activity timestamp under the lock.
    pub async fn sweep(&self) {
        for guild in self.controller.active_sessions().await {
            let present = match self.membership.human_members(guild).await {
                Ok(count) => count > 0,
                Err(why) => {
                    warn!("Membership check for guild {guild} failed: {why}");
                    self.fail_open
                }
            };

            if self.controller.enforce_idle(guild, present).await {
                info!("Idle monitor disconnected guild {guild}");
            }
        }
    }
}
