//! UTXO sources — the peers the engine asks "is this output still unspent?".

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::SourceError;
use crate::types::{Amount, OutPoint, Transaction};

/// Spend status of one outpoint as seen by one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UtxoStatus {
    /// Still in the UTXO set. `value` is the output amount when the source
    /// resolved it.
    Unspent { value: Option<Amount> },
    /// Consumed by `by`.
    Spent { by: Transaction },
}

impl UtxoStatus {
    /// Whether two sources are telling the same story about an outpoint.
    pub fn agrees_with(&self, other: &UtxoStatus) -> bool {
        match (self, other) {
            (Self::Unspent { value: a }, Self::Unspent { value: b }) => match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            },
            (Self::Spent { by: a }, Self::Spent { by: b }) => a.txid == b.txid,
            _ => false,
        }
    }
}

/// One source's answer for a contested outpoint, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAnswer {
    pub source_name: String,
    pub status: UtxoStatus,
}

#[async_trait]
pub trait UtxoSource: Send + Sync {
    /// Short label used in logs and error reports.
    fn name(&self) -> &str;

    /// Spend status for every outpoint in `outpoints`, in one batch.
    async fn query_status(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<HashMap<OutPoint, UtxoStatus>, SourceError>;
}

pub type SharedSource = Arc<dyn UtxoSource>;

/// The current set of sources. Swappable so a retry can use fresh peers.
#[derive(Default)]
pub struct SourceSet {
    sources: RwLock<Vec<SharedSource>>,
}

impl SourceSet {
    pub fn new(sources: Vec<SharedSource>) -> Self {
        Self {
            sources: RwLock::new(sources),
        }
    }

    pub fn current(&self) -> Vec<SharedSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, sources: Vec<SharedSource>) {
        *self.sources.write().unwrap_or_else(PoisonError::into_inner) = sources;
    }

    pub fn len(&self) -> usize {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
