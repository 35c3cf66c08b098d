use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Settlement batch lifecycle. Transitions only move forward; `Failed` is
/// terminal for this batch (the builder may re-batch its trades).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Submitted)
                | (BatchStatus::Pending, BatchStatus::Failed)
                | (BatchStatus::Submitted, BatchStatus::Confirmed)
                | (BatchStatus::Submitted, BatchStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Confirmed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Submitted => write!(f, "submitted"),
            BatchStatus::Confirmed => write!(f, "confirmed"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "submitted" => Ok(BatchStatus::Submitted),
            "confirmed" => Ok(BatchStatus::Confirmed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// A group of trades packaged for the external settlement adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub trade_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub created_at: i64,
    pub submitted_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub tx_hash: Option<String>,
}

impl Batch {
    pub fn new(id: Uuid, trade_ids: Vec<Uuid>, now: i64) -> Self {
        Self {
            id,
            trade_ids,
            status: BatchStatus::Pending,
            created_at: now,
            submitted_at: None,
            confirmed_at: None,
            failed_at: None,
            tx_hash: None,
        }
    }
}
