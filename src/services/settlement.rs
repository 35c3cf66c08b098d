//! Settlement adapter contract.
//!
//! The adapter itself is external; the core only speaks to it over a pair
//! of channels. Outbound: batch submissions. Inbound: asynchronous
//! lifecycle reports. A dev adapter that instantly confirms everything is
//! provided for local runs without a chain.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::models::Trade;

/// Core -> adapter.
#[derive(Debug, Clone)]
pub enum SettlementCommand {
    Submit {
        batch_id: Uuid,
        trades: Vec<Trade>,
    },
}

/// Adapter -> core.
#[derive(Debug, Clone)]
pub enum SettlementReport {
    Submitted { batch_id: Uuid, tx_hash: String },
    Confirmed { batch_id: Uuid, block_number: u64 },
    Failed { batch_id: Uuid, reason: String },
}

/// Batch builder's end of the adapter channel.
pub struct SettlementLink {
    pub commands: mpsc::Sender<SettlementCommand>,
    pub reports: mpsc::Receiver<SettlementReport>,
}

/// Adapter's end of the channel.
pub struct SettlementAdapter {
    pub commands: mpsc::Receiver<SettlementCommand>,
    pub reports: mpsc::Sender<SettlementReport>,
}

pub fn settlement_channel(capacity: usize) -> (SettlementLink, SettlementAdapter) {
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (report_tx, report_rx) = mpsc::channel(capacity);
    (
        SettlementLink {
            commands: command_tx,
            reports: report_rx,
        },
        SettlementAdapter {
            commands: command_rx,
            reports: report_tx,
        },
    )
}

/// Dev-mode adapter: acknowledges and confirms every batch immediately.
pub fn spawn_auto_confirm_adapter(mut adapter: SettlementAdapter) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("auto-confirm settlement adapter started");
        let mut block_number = 0u64;
        while let Some(SettlementCommand::Submit { batch_id, trades }) =
            adapter.commands.recv().await
        {
            block_number += 1;
            let tx_hash = format!("0x{}", hex::encode(batch_id.as_bytes()));
            info!(
                batch_id = %batch_id,
                trades = trades.len(),
                tx_hash = %tx_hash,
                "auto-confirming batch"
            );
            if adapter
                .reports
                .send(SettlementReport::Submitted {
                    batch_id,
                    tx_hash,
                })
                .await
                .is_err()
            {
                break;
            }
            if adapter
                .reports
                .send(SettlementReport::Confirmed {
                    batch_id,
                    block_number,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        info!("auto-confirm settlement adapter stopped");
    })
}
