//! Event persistence worker.
//!
//! One worker per market applies that market's event stream to the store in
//! sequence order, which keeps store writes serialized per market and
//! causally consistent with engine `seq`. A refused write marks the engine
//! degraded and is retried with backoff until the store acknowledges again;
//! a bus overflow means events were lost before they were persisted, which
//! latches the degraded state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{Store, StoreError};
use crate::events::{BusMessage, EventKind, EventStream, MarketEvent};
use crate::metrics;
use crate::models::{Pair, Trade, User};
use crate::services::health::HealthMonitor;

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// `committed_trades`, when given, receives every trade after its write has
/// been acknowledged; the batch builder only ever sees committed trades.
pub fn spawn_persistence_worker(
    store: Arc<Store>,
    pair: Pair,
    mut stream: EventStream,
    monitor: HealthMonitor,
    committed_trades: Option<mpsc::Sender<Trade>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(pair = %pair, "persistence worker started");
        while let Some(message) = stream.next().await {
            match message {
                BusMessage::Event(event) => {
                    apply_with_retry(&store, &pair, &event, &monitor).await;
                    if let (Some(sink), EventKind::TradeExecuted { trade }) =
                        (&committed_trades, &event.event)
                    {
                        if sink.send(trade.clone()).await.is_err() {
                            warn!(pair = %pair, "batch builder gone, trades no longer forwarded");
                        }
                    }
                }
                BusMessage::Lagged { dropped } => {
                    error!(
                        pair = %pair,
                        dropped,
                        "persistence consumer lost events, durability gap"
                    );
                    monitor.mark_stream_gap();
                }
            }
        }
        info!(pair = %pair, "persistence worker stopped");
    })
}

async fn apply_with_retry(
    store: &Store,
    pair: &Pair,
    event: &MarketEvent,
    monitor: &HealthMonitor,
) {
    let mut delay = RETRY_INITIAL;
    let mut marked_down = false;
    loop {
        match apply(store, event).await {
            Ok(()) => {
                if marked_down {
                    info!(pair = %pair, seq = event.seq, "store recovered");
                    monitor.set_store_down(false);
                }
                return;
            }
            Err(StoreError::Unavailable(e)) => {
                metrics::record_store_write_failure();
                if !marked_down {
                    monitor.set_store_down(true);
                    marked_down = true;
                }
                error!(
                    pair = %pair,
                    seq = event.seq,
                    error = %e,
                    "store write refused, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
            Err(e) => {
                // retrying cannot fix a missing or corrupt record
                warn!(pair = %pair, seq = event.seq, error = %e, "event skipped");
                return;
            }
        }
    }
}

async fn apply(store: &Store, event: &MarketEvent) -> Result<(), StoreError> {
    match &event.event {
        EventKind::OrderAdded { order } => {
            let mut user = User::new(order.user_id.clone(), order.timestamp);
            user.touch(order.nonce, order.timestamp);
            store.save_user(&user).await?;
            store.save_order(order).await
        }
        EventKind::OrderUpdated { order } => {
            store
                .update_order(&order.id, order.status, order.filled)
                .await
        }
        EventKind::OrderCancelled { order } | EventKind::OrderExpired { order } => {
            store.save_order(order).await
        }
        EventKind::TradeExecuted { trade } => store.save_trade(trade).await,
        // book snapshots are derived state and are not persisted
        EventKind::BookUpdated { .. } => Ok(()),
    }
}
