use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::SweeperConfig;
use crate::error::EngineResult;
use crate::store::Store;

/// Relays committed outbox rows to the broker. Publish happens before the
/// rows are marked SENT, so a crash between the two steps republishes the
/// batch on restart; consumers tolerate the duplicates.
pub struct Sweeper {
    store: Store,
    broker: Arc<Broker>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Store, broker: Arc<Broker>, config: SweeperConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Never returns. Scan failures (including a missing outbox table while
    /// migrations are still settling) back off and retry forever.
    pub async fn run(self) {
        info!(batch = self.config.batch_size, "outbox sweeper started");
        loop {
            match self.sweep_once().await {
                Ok(0) => tokio::time::sleep(self.config.idle_interval).await,
                Ok(relayed) => {
                    debug!(relayed, "outbox batch relayed");
                    tokio::time::sleep(self.config.batch_interval).await;
                }
                Err(err) => {
                    if err.is_missing_relation() {
                        warn!("outbox table not present yet, retrying");
                    } else {
                        error!("outbox sweep failed: {err}");
                    }
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
    }

    async fn sweep_once(&self) -> EngineResult<usize> {
        let entries = self.store.unsent_outbox(self.config.batch_size).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(entries.len());
        let mut payloads = Vec::with_capacity(entries.len());
        for entry in &entries {
            ids.push(entry.id);
            payloads.push(serde_json::to_string(entry)?);
        }

        // Publish first; marking SENT only after the broker accepted the
        // batch keeps the at-least-once guarantee.
        self.broker.publish_batch(&payloads).await?;
        self.store.mark_outbox_sent(&ids).await?;
        Ok(ids.len())
    }
}
