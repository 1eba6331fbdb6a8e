//! Pledge verification — fan a pledge's outpoints out to every UTXO source,
//! reconcile the answers, and classify the pledge.
//!
//! Querying and deciding are kept apart: [`PledgeVerifier::verify`] gathers
//! answers, [`reconcile`] turns them into [`Reconciled::Agreed`] or
//! [`Reconciled::Disagreed`], and only an agreed view is ever classified.
//! Disagreement is never settled by majority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::errors::VerificationError;
use crate::source::{SharedSource, SourceAnswer, UtxoStatus};
use crate::types::{Amount, OutPoint, Pledge, Project, Transaction, TxHash};

/// Classification of a pledge against the current UTXO set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PledgeStatus {
    /// Every input is unspent.
    Open,
    /// An input was consumed by a transaction paying the project's outputs.
    Claimed { settlement: Transaction },
    /// An input was consumed by some other transaction.
    Revoked { by: TxHash },
}

/// A successful verification. `advisory` carries an inconsistency worth
/// surfacing that does not change the classification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub status: PledgeStatus,
    pub advisory: Option<Arc<VerificationError>>,
}

/// Result of comparing every source's answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Agreed(HashMap<OutPoint, UtxoStatus>),
    Disagreed {
        outpoint: OutPoint,
        answers: Vec<SourceAnswer>,
    },
}

/// Compare per-source answers outpoint by outpoint. Each answer map must
/// cover every outpoint in `outpoints`.
pub fn reconcile(
    outpoints: &[OutPoint],
    answers: &[(String, HashMap<OutPoint, UtxoStatus>)],
) -> Reconciled {
    let mut agreed = HashMap::with_capacity(outpoints.len());

    for outpoint in outpoints {
        let statuses: Vec<(&str, &UtxoStatus)> = answers
            .iter()
            .filter_map(|(name, map)| map.get(outpoint).map(|s| (name.as_str(), s)))
            .collect();

        let Some((_, first)) = statuses.first() else {
            continue;
        };

        if statuses.iter().any(|(_, s)| !first.agrees_with(s)) {
            return Reconciled::Disagreed {
                outpoint: *outpoint,
                answers: statuses
                    .into_iter()
                    .map(|(name, status)| SourceAnswer {
                        source_name: name.to_string(),
                        status: status.clone(),
                    })
                    .collect(),
            };
        }

        // Keep the first resolved value when only some sources know it.
        let merged = match first {
            UtxoStatus::Unspent { value: None } => UtxoStatus::Unspent {
                value: statuses.iter().find_map(|(_, s)| match s {
                    UtxoStatus::Unspent { value } => *value,
                    UtxoStatus::Spent { .. } => None,
                }),
            },
            other => (*other).clone(),
        };
        agreed.insert(*outpoint, merged);
    }

    Reconciled::Agreed(agreed)
}

/// Classify a pledge from an agreed view of its outpoints.
pub fn classify(
    project: &Project,
    pledge: &Pledge,
    agreed: &HashMap<OutPoint, UtxoStatus>,
) -> Verification {
    let mut revoked_by = None;
    let mut observed: Option<Amount> = Some(0);

    for outpoint in pledge.outpoints() {
        match agreed.get(&outpoint) {
            Some(UtxoStatus::Spent { by }) if project.is_claim(by) => {
                return Verification {
                    status: PledgeStatus::Claimed {
                        settlement: by.clone(),
                    },
                    advisory: None,
                };
            }
            Some(UtxoStatus::Spent { by }) => {
                revoked_by.get_or_insert(by.txid);
            }
            Some(UtxoStatus::Unspent { value }) => {
                observed = observed.zip(*value).map(|(sum, v)| sum.saturating_add(v));
            }
            None => observed = None,
        }
    }

    if let Some(by) = revoked_by {
        return Verification {
            status: PledgeStatus::Revoked { by },
            advisory: None,
        };
    }

    let advisory = observed
        .filter(|&observed| observed != pledge.total_input_value)
        .map(|observed| {
            Arc::new(VerificationError::InputValueMismatch {
                declared: pledge.total_input_value,
                observed,
            })
        });

    Verification {
        status: PledgeStatus::Open,
        advisory,
    }
}

/// Queries sources for a pledge's inputs and classifies it. Stateless apart
/// from the per-source query bound.
#[derive(Debug, Clone)]
pub struct PledgeVerifier {
    query_timeout: Duration,
}

impl PledgeVerifier {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    pub async fn verify(
        &self,
        project: &Project,
        pledge: &Pledge,
        sources: &[SharedSource],
    ) -> Result<Verification, VerificationError> {
        pledge.validate_for(project)?;

        if sources.is_empty() {
            return Err(VerificationError::SourceUnavailable {
                source_name: "<none>".to_string(),
                reason: "no UTXO sources configured".to_string(),
            });
        }

        let outpoints = pledge.outpoints();
        let answers = self.query_all(sources, &outpoints).await?;

        match reconcile(&outpoints, &answers) {
            Reconciled::Agreed(agreed) => {
                let verification = classify(project, pledge, &agreed);
                debug!(
                    project = %project.id,
                    pledge = ?pledge.key(),
                    status = ?verification.status,
                    "pledge verified"
                );
                Ok(verification)
            }
            Reconciled::Disagreed { outpoint, answers } => {
                warn!(
                    project = %project.id,
                    %outpoint,
                    ?answers,
                    "UTXO sources disagree"
                );
                Err(VerificationError::InconsistentUtxoAnswers { outpoint, answers })
            }
        }
    }

    /// Ask every source concurrently, each under the query bound. Any source
    /// that fails, times out, or skips an outpoint fails the whole query.
    async fn query_all(
        &self,
        sources: &[SharedSource],
        outpoints: &[OutPoint],
    ) -> Result<Vec<(String, HashMap<OutPoint, UtxoStatus>)>, VerificationError> {
        let queries = sources.iter().map(|source| async move {
            let name = source.name().to_string();
            let result =
                tokio::time::timeout(self.query_timeout, source.query_status(outpoints)).await;
            (name, result)
        });

        let mut answers = Vec::with_capacity(sources.len());
        for (name, result) in join_all(queries).await {
            let map = match result {
                Err(_) => {
                    return Err(VerificationError::Timeout {
                        source_name: name,
                        after: self.query_timeout,
                    })
                }
                Ok(Err(e)) => return Err(VerificationError::from_source(&name, e)),
                Ok(Ok(map)) => map,
            };
            if let Some(missing) = outpoints.iter().find(|op| !map.contains_key(op)) {
                return Err(VerificationError::SourceUnavailable {
                    reason: format!("answer omitted outpoint {missing}"),
                    source_name: name,
                });
            }
            answers.push((name, map));
        }
        Ok(answers)
    }
}
