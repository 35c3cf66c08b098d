//! Settlement batch builder.
//!
//! Groups committed trades into batches by size threshold or time window,
//! whichever fills first, persists the batch, and hands it to the external
//! settlement adapter. Status machine: pending -> submitted -> confirmed or
//! failed. Failed batches are re-batched while attempts remain; a trade is
//! never dropped by the builder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{Store, StoreError};
use crate::metrics;
use crate::models::{Batch, BatchStatus, Trade};
use crate::services::health::HealthMonitor;
use crate::services::settlement::{SettlementCommand, SettlementLink, SettlementReport};

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush as soon as this many trades are buffered
    pub max_trades: usize,
    /// Flush whatever is buffered once the oldest trade has waited this long
    pub max_wait: Duration,
    pub retry_failed: bool,
    pub max_attempts: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_trades: 16,
            max_wait: Duration::from_secs(5),
            retry_failed: true,
            max_attempts: 3,
        }
    }
}

pub struct BatchBuilder {
    store: Arc<Store>,
    config: BatchConfig,
    monitor: HealthMonitor,
}

impl BatchBuilder {
    pub fn new(store: Arc<Store>, config: BatchConfig, monitor: HealthMonitor) -> Self {
        Self {
            store,
            config,
            monitor,
        }
    }

    pub fn spawn(
        self,
        trades: mpsc::Receiver<Trade>,
        link: SettlementLink,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(trades, link).await })
    }

    async fn run(self, mut trades: mpsc::Receiver<Trade>, mut link: SettlementLink) {
        info!(
            max_trades = self.config.max_trades,
            max_wait_ms = self.config.max_wait.as_millis() as u64,
            "batch builder started"
        );
        let mut buffer: Vec<Trade> = Vec::new();
        let mut deadline: Option<Instant> = None;
        // batch id -> (trades, attempt) until the adapter settles it
        let mut in_flight: HashMap<Uuid, (Vec<Trade>, u32)> = HashMap::new();
        let mut ingress_open = true;

        loop {
            let flush_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                trade = trades.recv(), if ingress_open => match trade {
                    Some(trade) => {
                        if buffer.is_empty() {
                            deadline = Some(Instant::now() + self.config.max_wait);
                        }
                        buffer.push(trade);
                        if buffer.len() >= self.config.max_trades {
                            let batch = std::mem::take(&mut buffer);
                            deadline = None;
                            self.dispatch(batch, 0, &link, &mut in_flight).await;
                        }
                    }
                    None => {
                        ingress_open = false;
                        if !buffer.is_empty() {
                            let batch = std::mem::take(&mut buffer);
                            deadline = None;
                            self.dispatch(batch, 0, &link, &mut in_flight).await;
                        }
                        if in_flight.is_empty() {
                            break;
                        }
                    }
                },
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    let batch = std::mem::take(&mut buffer);
                    deadline = None;
                    self.dispatch(batch, 0, &link, &mut in_flight).await;
                },
                report = link.reports.recv() => match report {
                    Some(report) => {
                        self.handle_report(report, &link, &mut in_flight).await;
                        if !ingress_open && in_flight.is_empty() && buffer.is_empty() {
                            break;
                        }
                    }
                    None => {
                        warn!("settlement adapter closed its report channel");
                        break;
                    }
                },
            }
        }
        info!("batch builder stopped");
    }

    /// Persist a new batch and hand it to the adapter.
    async fn dispatch(
        &self,
        trades: Vec<Trade>,
        attempt: u32,
        link: &SettlementLink,
        in_flight: &mut HashMap<Uuid, (Vec<Trade>, u32)>,
    ) {
        if trades.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let batch_id = Uuid::new_v4();
        let trade_ids: Vec<Uuid> = trades.iter().map(|t| t.id).collect();
        let batch = Batch::new(batch_id, trade_ids, now);

        self.persist_with_retry(&batch, &trades).await;

        info!(
            batch_id = %batch_id,
            trades = trades.len(),
            attempt,
            "batch dispatched to settlement adapter"
        );
        metrics::record_batch_created(trades.len());
        if link
            .commands
            .send(SettlementCommand::Submit {
                batch_id,
                trades: trades.clone(),
            })
            .await
            .is_err()
        {
            // the batch stays pending in the store and can be resubmitted
            warn!(batch_id = %batch_id, "settlement adapter gone, batch left pending");
            return;
        }
        in_flight.insert(batch_id, (trades, attempt));
    }

    async fn handle_report(
        &self,
        report: SettlementReport,
        link: &SettlementLink,
        in_flight: &mut HashMap<Uuid, (Vec<Trade>, u32)>,
    ) {
        let now = chrono::Utc::now().timestamp_millis();
        match report {
            SettlementReport::Submitted { batch_id, tx_hash } => {
                info!(batch_id = %batch_id, tx_hash = %tx_hash, "batch submitted");
                self.update_with_retry(batch_id, BatchStatus::Submitted, Some(&tx_hash), now)
                    .await;
            }
            SettlementReport::Confirmed {
                batch_id,
                block_number,
            } => {
                info!(batch_id = %batch_id, block_number, "batch confirmed");
                self.update_with_retry(batch_id, BatchStatus::Confirmed, None, now)
                    .await;
                metrics::record_batch_confirmed();
                in_flight.remove(&batch_id);
            }
            SettlementReport::Failed { batch_id, reason } => {
                error!(batch_id = %batch_id, reason = %reason, "batch failed");
                self.update_with_retry(batch_id, BatchStatus::Failed, None, now)
                    .await;
                metrics::record_batch_failed();
                let Some((trades, attempt)) = in_flight.remove(&batch_id) else {
                    return;
                };
                if self.config.retry_failed && attempt + 1 < self.config.max_attempts {
                    self.dispatch(trades, attempt + 1, link, in_flight).await;
                } else {
                    // trades stay persisted under the failed batch for
                    // operator-driven re-batching
                    error!(
                        batch_id = %batch_id,
                        trades = trades.len(),
                        "batch abandoned after {} attempts",
                        attempt + 1
                    );
                }
            }
        }
    }

    async fn persist_with_retry(&self, batch: &Batch, trades: &[Trade]) {
        let mut delay = RETRY_INITIAL;
        let mut marked_down = false;
        loop {
            match self.persist(batch, trades).await {
                Ok(()) => {
                    if marked_down {
                        self.monitor.set_store_down(false);
                    }
                    return;
                }
                Err(StoreError::Unavailable(e)) => {
                    metrics::record_store_write_failure();
                    if !marked_down {
                        self.monitor.set_store_down(true);
                        marked_down = true;
                    }
                    error!(batch_id = %batch.id, error = %e, "batch persist refused, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX);
                }
                Err(e) => {
                    warn!(batch_id = %batch.id, error = %e, "batch persist skipped");
                    return;
                }
            }
        }
    }

    async fn persist(&self, batch: &Batch, trades: &[Trade]) -> Result<(), StoreError> {
        self.store.create_batch(batch).await?;
        for trade in trades {
            self.store.attach_trade_to_batch(trade.id, batch.id).await?;
        }
        Ok(())
    }

    async fn update_with_retry(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        tx_hash: Option<&str>,
        at: i64,
    ) {
        let mut delay = RETRY_INITIAL;
        let mut marked_down = false;
        loop {
            match self.store.update_batch(batch_id, status, tx_hash, at).await {
                Ok(()) => {
                    if marked_down {
                        self.monitor.set_store_down(false);
                    }
                    return;
                }
                Err(StoreError::Unavailable(e)) => {
                    metrics::record_store_write_failure();
                    if !marked_down {
                        self.monitor.set_store_down(true);
                        marked_down = true;
                    }
                    error!(batch_id = %batch_id, error = %e, "batch update refused, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX);
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "batch update skipped");
                    return;
                }
            }
        }
    }
}
