//! Presentation helpers. Pure functions of engine outputs and the wallet;
//! nothing here touches the engine directly.

use serde::Serialize;

use crate::errors::ErrorKind;
use crate::tracker::ProjectSnapshot;
use crate::types::{Amount, CheckStatus, PledgeKey, Project, ProjectState, ProjectStateInfo};
use crate::wallet::Wallet;

/// What the primary action on a project should be for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    OpenForPledges,
    Pledged,
    CanClaim,
    Claimed,
}

/// A claimed project is always `Claimed`. Otherwise an owner of a fully
/// funded project can claim, and a backer with a live pledge can revoke.
pub fn action_mode(
    project: &Project,
    info: &ProjectStateInfo,
    total_pledged: Amount,
    wallet: Option<&dyn Wallet>,
) -> ActionMode {
    if info.state == ProjectState::Claimed {
        return ActionMode::Claimed;
    }
    let Some(wallet) = wallet else {
        return ActionMode::OpenForPledges;
    };
    if project.is_fully_funded(total_pledged) && wallet.is_project_mine(project) {
        ActionMode::CanClaim
    } else if wallet.pledged_amount_for(project) > 0 {
        ActionMode::Pledged
    } else {
        ActionMode::OpenForPledges
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingSummary {
    pub pledgers: usize,
    pub value_pledged: Amount,
    pub goal_amount: Amount,
    pub percent_funded: f64,
    /// Never negative, even when pledges overshoot the goal.
    pub remaining: Amount,
    pub fully_funded: bool,
    /// Key of the wallet's own pledge, if it is among the counted ones.
    pub yours: Option<PledgeKey>,
}

impl FundingSummary {
    pub fn from_snapshot(snapshot: &ProjectSnapshot, wallet: Option<&dyn Wallet>) -> Self {
        let project = &snapshot.project;
        let value = snapshot.info.value_pledged;
        let mine = wallet
            .and_then(|w| w.pledge_for(project))
            .and_then(|p| p.key());
        let yours = mine.filter(|key| {
            snapshot
                .open
                .iter()
                .chain(snapshot.claimed.iter())
                .any(|p| p.key() == Some(*key))
        });
        let percent_funded = if project.goal_amount == 0 {
            100.0
        } else {
            value as f64 / project.goal_amount as f64 * 100.0
        };

        Self {
            pledgers: snapshot.open.len() + snapshot.claimed.len(),
            value_pledged: value,
            goal_amount: project.goal_amount,
            percent_funded,
            remaining: project.goal_amount.saturating_sub(value),
            fully_funded: project.is_fully_funded(value),
            yours,
        }
    }
}

/// State to display: a failing check shows as `Error`, except that a
/// claimed project stays claimed and advisories never hide the state.
pub fn display_state(info: &ProjectStateInfo, check: Option<&CheckStatus>) -> ProjectState {
    match check.and_then(CheckStatus::error_kind) {
        Some(kind) if !kind.is_advisory() && info.state != ProjectState::Claimed => {
            ProjectState::Error
        }
        _ => info.state,
    }
}

/// User-facing text for a failed check, or `None` when the check passed.
pub fn describe_check_status(check: &CheckStatus) -> Option<String> {
    let CheckStatus::Error { kind, message, .. } = check else {
        return None;
    };
    let text = match kind {
        ErrorKind::NotFound => "Server error: 404 Not Found: project is not known".to_string(),
        ErrorKind::InconsistentAnswers => {
            "Bitcoin network returned inconsistent answers, please contact support".to_string()
        }
        _ if message.is_empty() => format!("Internal error: {kind:?}"),
        _ => format!("Error: {message}"),
    };
    Some(text)
}
