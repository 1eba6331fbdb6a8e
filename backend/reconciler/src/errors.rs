//! Application-wide error types.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::source::SourceAnswer;
use crate::types::{Amount, OutPoint, ProjectId};

/// Failure reported by a single UTXO source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("malformed answer: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::BadResponse(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

/// Why a pledge could not be classified.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("UTXO source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("UTXO source {source_name} did not answer within {after:?}")]
    Timeout { source_name: String, after: Duration },

    #[error("UTXO sources returned inconsistent answers for {outpoint}")]
    InconsistentUtxoAnswers {
        outpoint: OutPoint,
        answers: Vec<SourceAnswer>,
    },

    #[error("malformed pledge: {0}")]
    MalformedPledge(String),

    #[error("pledge declares {declared} sat of inputs but the sources resolved {observed} sat")]
    InputValueMismatch { declared: Amount, observed: Amount },

    #[error("project {0} is not known")]
    NotFound(ProjectId),
}

impl VerificationError {
    pub fn from_source(source_name: &str, err: SourceError) -> Self {
        match err {
            SourceError::Timeout(after) => Self::Timeout {
                source_name: source_name.to_string(),
                after,
            },
            other => Self::SourceUnavailable {
                source_name: source_name.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable { .. } | Self::Timeout { .. } => ErrorKind::SourceUnavailable,
            Self::InconsistentUtxoAnswers { .. } => ErrorKind::InconsistentAnswers,
            Self::MalformedPledge(_) => ErrorKind::MalformedPledge,
            Self::InputValueMismatch { .. } => ErrorKind::InputValueMismatch,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Coarse classification of a [`VerificationError`] for callers that render
/// or retry without inspecting the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    InconsistentAnswers,
    MalformedPledge,
    InputValueMismatch,
    NotFound,
}

impl ErrorKind {
    /// Worth retrying with backoff.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::SourceUnavailable)
    }

    /// Does not stop a project's first pass from opening it.
    pub fn is_advisory(self) -> bool {
        matches!(self, Self::InputValueMismatch)
    }
}

/// Failure of the optional server-assisted status feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("project {0} is not known to the status feed")]
    NotFound(ProjectId),

    #[error("status feed unavailable: {0}")]
    Unavailable(String),

    #[error("status feed returned a malformed answer: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::BadResponse(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Status feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Unknown project: {0}")]
    UnknownProject(ProjectId),
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;
