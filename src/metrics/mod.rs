//! Exchange core metrics.
//!
//! Prometheus-compatible counters, gauges and histograms for the matching
//! engine, persistence pipeline, broadcaster and batch builder.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Instant;

/// Metric names as constants for consistency
pub mod names {
    pub const ORDERS_PLACED_TOTAL: &str = "orders_placed_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const ORDERS_EXPIRED_TOTAL: &str = "orders_expired_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const TRADE_NOTIONAL_QUOTE: &str = "trade_notional_quote";

    pub const STORE_WRITE_FAILURES_TOTAL: &str = "store_write_failures_total";
    pub const ENGINE_DEGRADED: &str = "engine_degraded";

    pub const SUBSCRIBER_MESSAGES_SENT_TOTAL: &str = "subscriber_messages_sent_total";

    pub const BATCHES_CREATED_TOTAL: &str = "batches_created_total";
    pub const BATCH_TRADES_TOTAL: &str = "batch_trades_total";
    pub const BATCHES_CONFIRMED_TOTAL: &str = "batches_confirmed_total";
    pub const BATCHES_FAILED_TOTAL: &str = "batches_failed_total";
}

/// Label keys
pub mod labels {
    pub const SIDE: &str = "side";
    pub const ORDER_TYPE: &str = "order_type";
    pub const PAIR: &str = "pair";
}

/// Install the Prometheus recorder and return its render handle.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        )
        .expect("histogram buckets must be non-empty")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn record_order_placed(side: &str, order_type: &str) {
    counter!(
        names::ORDERS_PLACED_TOTAL,
        labels::SIDE => side.to_string(),
        labels::ORDER_TYPE => order_type.to_string()
    )
    .increment(1);
}

pub fn record_order_cancelled() {
    counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);
}

pub fn record_order_expired() {
    counter!(names::ORDERS_EXPIRED_TOTAL).increment(1);
}

pub fn record_match_duration(duration_secs: f64) {
    histogram!(names::ORDER_MATCH_DURATION_SECONDS).record(duration_secs);
}

pub fn record_trade_executed(pair: &str, notional: Decimal) {
    counter!(
        names::TRADES_EXECUTED_TOTAL,
        labels::PAIR => pair.to_string()
    )
    .increment(1);
    counter!(
        names::TRADE_NOTIONAL_QUOTE,
        labels::PAIR => pair.to_string()
    )
    .increment(notional.to_u64().unwrap_or(0));
}

pub fn record_store_write_failure() {
    counter!(names::STORE_WRITE_FAILURES_TOTAL).increment(1);
}

pub fn set_engine_degraded(degraded: bool) {
    gauge!(names::ENGINE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_subscriber_message() {
    counter!(names::SUBSCRIBER_MESSAGES_SENT_TOTAL).increment(1);
}

pub fn record_batch_created(trades: usize) {
    counter!(names::BATCHES_CREATED_TOTAL).increment(1);
    counter!(names::BATCH_TRADES_TOTAL).increment(trades as u64);
}

pub fn record_batch_confirmed() {
    counter!(names::BATCHES_CONFIRMED_TOTAL).increment(1);
}

pub fn record_batch_failed() {
    counter!(names::BATCHES_FAILED_TOTAL).increment(1);
}

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(names::ORDERS_PLACED_TOTAL, "orders_placed_total");
        assert_eq!(names::TRADES_EXECUTED_TOTAL, "trades_executed_total");
        assert_eq!(names::BATCHES_CREATED_TOTAL, "batches_created_total");
    }
}
