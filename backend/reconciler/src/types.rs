//! # Types
//!
//! Decoded project and pledge structures, plus the per-project state the
//! engine derives from them.
//!
//! ## Identity
//!
//! - A [`Project`] is identified by [`ProjectId`], the hex SHA-256 of its
//!   serialized details. Owner-attached metadata never feeds the hash.
//! - A [`Pledge`] is identified by its [`PledgeKey`]: the `orig_hash` of the
//!   submission it was scrubbed from when present, otherwise the txid of its
//!   pledge transaction. A server-provided copy therefore replaces the
//!   submitter's local copy instead of being counted twice.
//!
//! ## Project lifecycle
//!
//! ```text
//! Unknown ──► Pending ──► Open ──► Claimed
//!                           ▲  │
//!                           └──┘ pledge added / revoked
//! ```
//!
//! `Claimed` is terminal until an explicit reset puts the project back into
//! `Pending`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::{ErrorKind, VerificationError};

/// Amounts in the smallest currency unit (satoshis).
pub type Amount = u64;

/// Identity of a pledge inside its project's pledge set.
pub type PledgeKey = TxHash;

// ─────────────────────────────────────────────────────────
// Hashes and outpoints
// ─────────────────────────────────────────────────────────

/// A 32-byte transaction hash, hex-encoded in every text form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_hex())
    }
}

impl FromStr for TxHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a single transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxHash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: TxHash, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction output: amount plus locking script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

/// The parts of a transaction the engine reasons about. Script validity and
/// fee policy are not checked here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: TxHash,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn spends(&self, outpoint: &OutPoint) -> bool {
        self.inputs.contains(outpoint)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Derive the id from the project's serialized details.
    pub fn derive(serialized_details: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(serialized_details)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published funding project. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    #[serde(default)]
    pub title: String,
    /// Target amount in satoshis.
    pub goal_amount: Amount,
    /// Outputs the settlement transaction must pay, in order. An amount of
    /// zero means "unspecified, fill to goal".
    pub outputs: Vec<TxOut>,
    #[serde(default)]
    pub min_pledge_size: Amount,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub expiry: Option<i64>,
    /// Hex-encoded public key that authorises privileged status queries.
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub payment_url: Option<String>,
}

impl Project {
    /// True when `outputs` begins with this project's outputs.
    pub fn outputs_match(&self, outputs: &[TxOut]) -> bool {
        !self.outputs.is_empty()
            && outputs.len() >= self.outputs.len()
            && self.outputs.iter().zip(outputs).all(|(want, got)| {
                want.script == got.script && (want.value == 0 || want.value == got.value)
            })
    }

    /// True when `tx` settles this project.
    pub fn is_claim(&self, tx: &Transaction) -> bool {
        !tx.inputs.is_empty() && self.outputs_match(&tx.outputs)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| now.timestamp() >= expiry)
    }

    pub fn is_fully_funded(&self, value_pledged: Amount) -> bool {
        value_pledged >= self.goal_amount
    }
}

// ─────────────────────────────────────────────────────────
// Pledges
// ─────────────────────────────────────────────────────────

/// A contribution toward a project. The last transaction is the pledge
/// transaction paying the project's outputs; any earlier ones are the
/// dependencies that created its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pledge {
    pub project_id: ProjectId,
    pub transactions: Vec<Transaction>,
    pub total_input_value: Amount,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub orig_hash: Option<TxHash>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub memo: String,
}

impl Pledge {
    pub fn pledge_tx(&self) -> Option<&Transaction> {
        self.transactions.last()
    }

    pub fn key(&self) -> Option<PledgeKey> {
        self.orig_hash.or_else(|| self.pledge_tx().map(|tx| tx.txid))
    }

    /// Outpoints whose spend status decides this pledge's fate.
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.pledge_tx()
            .map(|tx| tx.inputs.clone())
            .unwrap_or_default()
    }

    /// Structural checks applied before a pledge may enter a project's set.
    pub fn validate_for(&self, project: &Project) -> Result<(), VerificationError> {
        let malformed =
            |msg: String| -> Result<(), VerificationError> { Err(VerificationError::MalformedPledge(msg)) };

        if self.project_id != project.id {
            return malformed(format!(
                "pledge targets project {}, not {}",
                self.project_id, project.id
            ));
        }
        let Some(tx) = self.pledge_tx() else {
            return malformed("pledge contains no transactions".to_string());
        };
        if tx.inputs.is_empty() {
            return malformed(format!("pledge transaction {} has no inputs", tx.txid));
        }
        let mut inputs = tx.inputs.clone();
        inputs.sort();
        inputs.dedup();
        if inputs.len() != tx.inputs.len() {
            return malformed(format!("pledge transaction {} spends an input twice", tx.txid));
        }
        if self.total_input_value == 0 {
            return malformed("pledge declares a zero input value".to_string());
        }
        if self.total_input_value < project.min_pledge_size {
            return malformed(format!(
                "pledge of {} sat is below the project minimum of {} sat",
                self.total_input_value, project.min_pledge_size
            ));
        }
        if !project.outputs_match(&tx.outputs) {
            return malformed(format!(
                "pledge transaction {} does not pay the project's outputs",
                tx.txid
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Derived state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Unknown,
    Pending,
    Open,
    Claimed,
    /// Never assigned by the tracker; presentation layers fold a failing
    /// [`CheckStatus`] into this.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStateInfo {
    pub state: ProjectState,
    pub value_pledged: Amount,
    pub claimed_by: Option<TxHash>,
}

/// Outcome of the most recent reconciliation attempt for one project.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    Ok {
        at: DateTime<Utc>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        at: DateTime<Utc>,
        #[serde(skip)]
        error: Arc<VerificationError>,
    },
}

impl CheckStatus {
    pub fn ok() -> Self {
        Self::Ok { at: Utc::now() }
    }

    pub fn error(error: Arc<VerificationError>) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error { kind, .. } => Some(*kind),
            Self::Ok { .. } => None,
        }
    }
}

impl PartialEq for CheckStatus {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ok { at: a }, Self::Ok { at: b }) => a == b,
            (
                Self::Error {
                    kind: ka,
                    message: ma,
                    at: ta,
                    ..
                },
                Self::Error {
                    kind: kb,
                    message: mb,
                    at: tb,
                    ..
                },
            ) => ka == kb && ma == mb && ta == tb,
            _ => false,
        }
    }
}
