//! What the engine needs to know from the local wallet.

use crate::types::{Amount, Pledge, Project};

/// Invoked with the pledge the wallet just revoked.
pub type RevokeCallback = Box<dyn Fn(&Pledge) + Send + Sync>;

pub trait Wallet: Send + Sync {
    /// The wallet holds the keys to claim this project.
    fn is_project_mine(&self, project: &Project) -> bool;

    /// The wallet's own pledge to this project, if it made one.
    fn pledge_for(&self, project: &Project) -> Option<Pledge>;

    fn pledged_amount_for(&self, project: &Project) -> Amount;

    /// Register a callback fired whenever the wallet revokes one of its
    /// pledges.
    fn on_revoke(&self, callback: RevokeCallback);
}
