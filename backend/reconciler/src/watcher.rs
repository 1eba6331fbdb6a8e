//! Long-running background tasks that feed the engine: the chain-tip watcher,
//! the status-feed poller and the store pruner. Each runs until its
//! [`CancellationToken`] fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db;
use crate::engine::Engine;
use crate::errors::{ReconcilerError, SourceError};
use crate::esplora::EsploraSource;
use crate::surface::StateEvent;

/// Anything that can report the current best block.
#[async_trait]
pub trait TipSource: Send + Sync {
    async fn tip_hash(&self) -> Result<String, SourceError>;
}

#[async_trait]
impl TipSource for EsploraSource {
    async fn tip_hash(&self) -> Result<String, SourceError> {
        EsploraSource::tip_hash(self).await
    }
}

/// Poll the tip every `interval`; each change fires
/// [`Engine::on_new_block`]. The first tip seen is only recorded.
pub async fn watch_chain_tip(
    engine: Arc<Engine>,
    tips: Arc<dyn TipSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Chain tip watcher starting — every {interval:?}");
    let mut last: Option<String> = None;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = tips.tip_hash() => polled,
        };
        match polled {
            Ok(tip) if last.as_deref() == Some(tip.as_str()) => {}
            Ok(tip) => {
                if last.is_some() {
                    info!(%tip, "new chain tip");
                    engine.on_new_block();
                } else {
                    debug!(%tip, "initial chain tip");
                }
                last = Some(tip);
            }
            Err(e) => error!("Chain tip poll error: {e}"),
        }
    }
    info!("Chain tip watcher stopped");
}

/// Refresh every tracked project from the status feed every `interval`.
pub async fn poll_status_feed(engine: Arc<Engine>, interval: Duration, cancel: CancellationToken) {
    info!("Status feed poller starting — every {interval:?}");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for id in engine.tracked_ids() {
            let refreshed = tokio::select! {
                _ = cancel.cancelled() => break,
                refreshed = engine.refresh(&id) => refreshed,
            };
            match refreshed {
                Ok(()) | Err(ReconcilerError::UnknownProject(_)) => {}
                Err(e) => error!(project = %id, "Status feed refresh error: {e}"),
            }
        }
    }
    info!("Status feed poller stopped");
}

/// Delete pledges from the store as soon as the engine finds them revoked.
pub async fn prune_revoked(engine: Arc<Engine>, pool: SqlitePool, cancel: CancellationToken) {
    let mut events = engine.subscribe();
    drop(engine);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        if let StateEvent::PledgeRevoked { key, .. } = event {
            if let Err(e) = db::delete_pledge(&pool, &key).await {
                error!(pledge = %key, "Failed to delete revoked pledge: {e}");
            }
        }
    }
}
