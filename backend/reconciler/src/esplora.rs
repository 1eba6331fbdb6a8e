//! Esplora REST client — a [`UtxoSource`] over an Esplora-compatible block
//! explorer API.
//!
//! ## Endpoints
//!
//! * `GET /tx/{txid}/outspend/{vout}` — spend status of one output.
//! * `GET /tx/{txid}` — transaction body; resolves output values and the
//!   spending transaction.
//! * `GET /blocks/tip/hash` — current chain tip.
//!
//! ## Resilience
//!
//! Rate-limit (429) and server (5xx) responses are retried with exponential
//! back-off starting at [`INITIAL_BACKOFF_MILLIS`] and capped at
//! [`MAX_BACKOFF_MILLIS`], for at most [`MAX_ATTEMPTS`] requests. After that
//! the source counts as unavailable for this call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::SourceError;
use crate::source::{UtxoSource, UtxoStatus};
use crate::types::{OutPoint, Transaction, TxHash, TxOut};

const INITIAL_BACKOFF_MILLIS: u64 = 250;
const MAX_BACKOFF_MILLIS: u64 = 4_000;
const MAX_ATTEMPTS: u32 = 6;

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Outspend {
    spent: bool,
    #[serde(default)]
    txid: Option<TxHash>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: TxHash,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    txid: TxHash,
    vout: u32,
    #[serde(default)]
    is_coinbase: bool,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey: String,
    value: u64,
}

impl TryFrom<EsploraTx> for Transaction {
    type Error = SourceError;

    fn try_from(tx: EsploraTx) -> Result<Self, Self::Error> {
        let outputs = tx
            .vout
            .into_iter()
            .map(|o| {
                let script = hex::decode(&o.scriptpubkey).map_err(|e| {
                    SourceError::BadResponse(format!("bad scriptpubkey in {}: {e}", tx.txid))
                })?;
                Ok(TxOut {
                    value: o.value,
                    script,
                })
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        Ok(Transaction {
            txid: tx.txid,
            inputs: tx
                .vin
                .into_iter()
                .filter(|i| !i.is_coinbase)
                .map(|i| OutPoint::new(i.txid, i.vout))
                .collect(),
            outputs,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct EsploraSource {
    name: String,
    base_url: String,
    client: Client,
}

impl EsploraSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            name: base_url.clone(),
            base_url,
            client,
        }
    }

    /// Hash of the current best block.
    pub async fn tip_hash(&self) -> Result<String, SourceError> {
        let url = format!("{}/blocks/tip/hash", self.base_url);
        let body = self.get_with_backoff(&url).await?;
        Ok(body.text().await?.trim().to_string())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        let resp = self.get_with_backoff(url).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SourceError::BadResponse(format!("{url}: {e}")))
    }

    async fn get_with_backoff(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let mut backoff = INITIAL_BACKOFF_MILLIS;
        let mut attempt = 1;

        loop {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt >= MAX_ATTEMPTS {
                    return Err(SourceError::Unavailable(format!(
                        "{url} still returned {status} after {attempt} attempts"
                    )));
                }
                warn!(source = %self.name, %status, "UTXO source busy (will retry in {backoff}ms)");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MILLIS);
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(SourceError::BadResponse(format!("{url} returned {status}")));
            }
            return Ok(resp);
        }
    }

    async fn fetch_tx(
        &self,
        txid: &TxHash,
        cache: &mut HashMap<TxHash, Transaction>,
    ) -> Result<Transaction, SourceError> {
        if let Some(tx) = cache.get(txid) {
            return Ok(tx.clone());
        }
        let raw: EsploraTx = self.get_json(&format!("{}/tx/{txid}", self.base_url)).await?;
        let tx = Transaction::try_from(raw)?;
        cache.insert(*txid, tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl UtxoSource for EsploraSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_status(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<HashMap<OutPoint, UtxoStatus>, SourceError> {
        let mut cache = HashMap::new();
        let mut statuses = HashMap::with_capacity(outpoints.len());

        for op in outpoints {
            let url = format!("{}/tx/{}/outspend/{}", self.base_url, op.txid, op.index);
            let outspend: Outspend = self.get_json(&url).await?;

            let status = match (outspend.spent, outspend.txid) {
                (true, Some(spender)) => UtxoStatus::Spent {
                    by: self.fetch_tx(&spender, &mut cache).await?,
                },
                (true, None) => {
                    return Err(SourceError::BadResponse(format!(
                        "{op} reported spent without a spending txid"
                    )));
                }
                (false, _) => {
                    let funding = self.fetch_tx(&op.txid, &mut cache).await?;
                    let value = funding.outputs.get(op.index as usize).map(|o| o.value);
                    if value.is_none() {
                        return Err(SourceError::BadResponse(format!(
                            "{op} does not exist in its transaction"
                        )));
                    }
                    UtxoStatus::Unspent { value }
                }
            };
            statuses.insert(*op, status);
        }

        debug!(source = %self.name, outpoints = outpoints.len(), "queried UTXO statuses");
        Ok(statuses)
    }
}
