//! In-memory doubles and fixtures shared by the unit and scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::engine::{Engine, EngineConfig};
use crate::errors::{FeedError, SourceError};
use crate::feed::{ProjectStatus, StatusFeed};
use crate::source::{SharedSource, UtxoSource, UtxoStatus};
use crate::types::{Amount, OutPoint, Pledge, Project, ProjectId, Transaction, TxHash, TxOut};
use crate::wallet::{RevokeCallback, Wallet};

pub fn txhash(n: u8) -> TxHash {
    TxHash([n; 32])
}

pub fn outpoint(n: u8) -> OutPoint {
    OutPoint::new(TxHash([0xf0 ^ n; 32]), u32::from(n))
}

pub fn project_with_goal(goal: Amount) -> Project {
    let details = format!("project goal={goal}");
    Project {
        id: ProjectId::derive(details.as_bytes()),
        title: format!("Project {goal}"),
        goal_amount: goal,
        outputs: vec![TxOut {
            value: goal,
            script: vec![0x00, 0x14, 0xaa, 0xbb],
        }],
        min_pledge_size: 0,
        timestamp: 1_700_000_000,
        expiry: None,
        auth_key: None,
        memo: String::new(),
        payment_url: None,
    }
}

/// A single-transaction pledge spending `inputs` into the project's outputs.
/// The pledge txid is derived from the first input so fixtures stay distinct.
pub fn pledge_for(project: &Project, inputs: &[OutPoint], value: Amount) -> Pledge {
    let seed = inputs.first().map(|op| op.index as u8).unwrap_or(0);
    Pledge {
        project_id: project.id.clone(),
        transactions: vec![Transaction {
            txid: TxHash([0x50 ^ seed; 32]),
            inputs: inputs.to_vec(),
            outputs: project.outputs.clone(),
        }],
        total_input_value: value,
        timestamp: 1_700_000_000 + i64::from(seed),
        orig_hash: None,
        contact: Some(format!("backer{seed}@example.org")),
        memo: String::new(),
    }
}

pub fn settlement_tx(project: &Project, inputs: &[OutPoint]) -> Transaction {
    Transaction {
        txid: txhash(0xcc),
        inputs: inputs.to_vec(),
        outputs: project.outputs.clone(),
    }
}

pub fn unrelated_tx(inputs: &[OutPoint]) -> Transaction {
    Transaction {
        txid: txhash(0xdd),
        inputs: inputs.to_vec(),
        outputs: vec![TxOut {
            value: 1,
            script: vec![0x6a],
        }],
    }
}

/// Short timers so paused-clock tests advance quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        query_timeout: Duration::from_secs(2),
        debounce: Duration::from_millis(50),
        retry_initial_backoff: Duration::from_secs(1),
        retry_max_backoff: Duration::from_secs(4),
    }
}

pub fn engine_with(sources: &[&Arc<MockSource>], feed: Option<Arc<dyn StatusFeed>>) -> Arc<Engine> {
    let sources = sources
        .iter()
        .map(|s| (*s).clone() as SharedSource)
        .collect();
    Engine::new(test_config(), sources, feed)
}

/// Let spawned passes and timers run until the engine has nothing left to do.
/// A migrated in-memory store. One connection, since each in-memory
/// connection is a separate database.
pub async fn memory_pool() -> SqlitePool {
    crate::db::connect("sqlite::memory:", 1).await.unwrap()
}

pub async fn settle(engine: &Engine) {
    for _ in 0..10_000 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if engine.is_idle() {
            return;
        }
    }
    panic!("engine never went idle");
}

/// Scripted UTXO source that records call counts and concurrency.
#[derive(Default)]
pub struct MockSource {
    name: String,
    statuses: Mutex<HashMap<OutPoint, UtxoStatus>>,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSource {
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    pub fn set_unspent(&self, op: OutPoint, value: Option<Amount>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(op, UtxoStatus::Unspent { value });
    }

    pub fn set_spent(&self, op: OutPoint, by: Transaction) {
        self.statuses
            .lock()
            .unwrap()
            .insert(op, UtxoStatus::Spent { by });
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UtxoSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_status(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<HashMap<OutPoint, UtxoStatus>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("connection refused".to_string()));
        }
        let statuses = self.statuses.lock().unwrap();
        Ok(outpoints
            .iter()
            .filter_map(|op| statuses.get(op).map(|s| (*op, s.clone())))
            .collect())
    }
}

#[derive(Default)]
pub struct MockFeed {
    statuses: Mutex<HashMap<ProjectId, ProjectStatus>>,
    calls: AtomicUsize,
}

impl MockFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, status: ProjectStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.project_id.clone(), status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusFeed for MockFeed {
    async fn fetch(&self, project_id: &ProjectId) -> Result<ProjectStatus, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(project_id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(project_id.clone()))
    }
}

#[derive(Default)]
pub struct MockWallet {
    mine: Mutex<Vec<ProjectId>>,
    pledges: Mutex<HashMap<ProjectId, Pledge>>,
    callbacks: Mutex<Vec<RevokeCallback>>,
}

impl MockWallet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn own_project(&self, id: &ProjectId) {
        self.mine.lock().unwrap().push(id.clone());
    }

    pub fn hold_pledge(&self, pledge: Pledge) {
        self.pledges
            .lock()
            .unwrap()
            .insert(pledge.project_id.clone(), pledge);
    }

    /// Simulate the user revoking their pledge from the wallet.
    pub fn revoke(&self, project_id: &ProjectId) {
        let pledge = self.pledges.lock().unwrap().remove(project_id);
        if let Some(pledge) = pledge {
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(&pledge);
            }
        }
    }
}

impl Wallet for MockWallet {
    fn is_project_mine(&self, project: &Project) -> bool {
        self.mine.lock().unwrap().contains(&project.id)
    }

    fn pledge_for(&self, project: &Project) -> Option<Pledge> {
        self.pledges.lock().unwrap().get(&project.id).cloned()
    }

    fn pledged_amount_for(&self, project: &Project) -> Amount {
        self.pledge_for(project)
            .map(|p| p.total_input_value)
            .unwrap_or(0)
    }

    fn on_revoke(&self, callback: RevokeCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}
