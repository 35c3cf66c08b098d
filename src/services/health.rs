//! Engine health channel.
//!
//! The engine fails closed: while the durable store cannot acknowledge
//! writes, or a persistence consumer has lost events, every market refuses
//! new admissions until durability is restored.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineHealth {
    /// The store is currently refusing writes
    pub store_down: bool,
    /// A persistence consumer dropped events; durability has a gap
    pub stream_gap: bool,
}

impl EngineHealth {
    pub fn degraded(&self) -> bool {
        self.store_down || self.stream_gap
    }
}

/// Writer half, held by persistence workers.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    tx: watch::Sender<EngineHealth>,
}

impl HealthMonitor {
    pub fn channel() -> (HealthMonitor, watch::Receiver<EngineHealth>) {
        let (tx, rx) = watch::channel(EngineHealth::default());
        (HealthMonitor { tx }, rx)
    }

    pub fn set_store_down(&self, down: bool) {
        self.tx.send_modify(|h| h.store_down = down);
    }

    /// A stream gap cannot be repaired without replay, so it latches.
    pub fn mark_stream_gap(&self) {
        self.tx.send_modify(|h| h.stream_gap = true);
    }

    pub fn current(&self) -> EngineHealth {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_down_recovers() {
        let (monitor, rx) = HealthMonitor::channel();
        assert!(!rx.borrow().degraded());

        monitor.set_store_down(true);
        assert!(rx.borrow().degraded());

        monitor.set_store_down(false);
        assert!(!rx.borrow().degraded());
    }

    #[test]
    fn test_stream_gap_latches() {
        let (monitor, rx) = HealthMonitor::channel();
        monitor.mark_stream_gap();
        monitor.set_store_down(false);
        assert!(rx.borrow().degraded());
    }
}
