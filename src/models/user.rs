use serde::{Deserialize, Serialize};

/// A trading account, keyed by its address string. Created on first
/// reference and never destroyed; the matching engine only bumps `nonce`
/// and `last_activity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub nonce: i64,
    pub active: bool,
    /// Millisecond epoch
    pub created_at: i64,
    /// Millisecond epoch
    pub last_activity: i64,
}

impl User {
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            nonce: 0,
            active: true,
            created_at: now,
            last_activity: now,
        }
    }

    /// Record activity from an admitted intent. Nonces only move forward.
    pub fn touch(&mut self, nonce: i64, now: i64) {
        if nonce > self.nonce {
            self.nonce = nonce;
        }
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}
