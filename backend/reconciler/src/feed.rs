//! Server-assisted status feed.
//!
//! A project server can hand out the pledges it has collected and the claim
//! it believes settled the project. None of it is trusted: every pledge goes
//! through the verifier, and a reported `claimed_by` only schedules a pass.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::FeedError;
use crate::types::{Amount, Pledge, ProjectId, TxHash};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project_id: ProjectId,
    /// Unix seconds at which the server produced this status.
    pub timestamp: i64,
    pub value_pledged_so_far: Amount,
    #[serde(default)]
    pub pledges: Vec<Pledge>,
    #[serde(default)]
    pub claimed_by: Option<TxHash>,
}

#[async_trait]
pub trait StatusFeed: Send + Sync {
    async fn fetch(&self, project_id: &ProjectId) -> Result<ProjectStatus, FeedError>;
}

/// `GET {base_url}/{project_id}` returning a JSON [`ProjectStatus`].
pub struct HttpStatusFeed {
    client: Client,
    base_url: String,
}

impl HttpStatusFeed {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusFeed for HttpStatusFeed {
    async fn fetch(&self, project_id: &ProjectId) -> Result<ProjectStatus, FeedError> {
        let url = format!("{}/{}", self.base_url, project_id);
        let resp = self.client.get(&url).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(FeedError::NotFound(project_id.clone())),
            s if !s.is_success() => {
                return Err(FeedError::Unavailable(format!("{url} returned {s}")));
            }
            _ => {}
        }

        let status: ProjectStatus = resp.json().await?;
        if &status.project_id != project_id {
            return Err(FeedError::BadResponse(format!(
                "asked for {project_id}, got {}",
                status.project_id
            )));
        }
        debug!(
            project = %project_id,
            pledges = status.pledges.len(),
            value = status.value_pledged_so_far,
            "fetched status from feed"
        );
        Ok(status)
    }
}
