mod common;

use crate::common::*;
use std::time::Duration;
use tokio::time::timeout;

use clob_core::services::broadcaster::{
    BroadcasterConfig, MarketBroadcaster, SubscriberMessage, Subscription,
};
use clob_core::Side;
use rust_decimal_macros::dec;

fn broadcaster(core: &TestCore, heartbeat: Duration) -> MarketBroadcaster {
    let broadcaster = MarketBroadcaster::new(
        core.exchange.clone(),
        BroadcasterConfig {
            snapshot_depth: 10,
            subscriber_queue_depth: 64,
            heartbeat_interval: heartbeat,
        },
    );
    broadcaster.start();
    broadcaster
}

async fn next_message(sub: &mut Subscription) -> SubscriberMessage {
    timeout(Duration::from_secs(2), sub.messages.recv())
        .await
        .expect("timed out waiting for subscriber message")
        .expect("subscription closed")
}

/// Next message that is not a heartbeat.
async fn next_data_message(sub: &mut Subscription) -> SubscriberMessage {
    loop {
        match next_message(sub).await {
            SubscriberMessage::Heartbeat { .. } => continue,
            message => return message,
        }
    }
}

#[tokio::test]
async fn test_orderbook_subscription_snapshot_then_updates() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_secs(60));

    let mut sub = broadcaster.subscribe_orderbook(&eth_usdc()).await.unwrap();
    match next_data_message(&mut sub).await {
        SubscriberMessage::OrderbookSnapshot { bids, asks, .. } => {
            assert!(bids.is_empty());
            assert!(asks.is_empty());
        }
        other => panic!("expected initial snapshot, got {other:?}"),
    }

    // a cross empties the book; the first BookUpdated reaches subscribers
    // as a snapshot, later ones as deltas
    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "1", 2))
        .await
        .unwrap();

    match next_data_message(&mut sub).await {
        SubscriberMessage::OrderbookSnapshot { bids, asks, .. } => {
            assert!(bids.is_empty());
            assert!(asks.is_empty());
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    core.exchange
        .place(limit_intent("b2", "U1", eth_usdc(), Side::Buy, "1990", "2", 3))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s2", "U2", eth_usdc(), Side::Sell, "1990", "0.5", 4))
        .await
        .unwrap();

    match next_data_message(&mut sub).await {
        SubscriberMessage::OrderbookUpdate { changes, .. } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].side, Side::Buy);
            assert_eq!(changes[0].price, dec!(1990));
            assert_eq!(changes[0].new_aggregate, dec!(1.5));
            assert_eq!(changes[0].new_order_count, 1);
        }
        other => panic!("expected delta, got {other:?}"),
    }
}

#[tokio::test]
async fn test_trade_subscription_receives_fills() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_secs(60));
    let mut pair_sub = broadcaster.subscribe_trades(Some(&eth_usdc()));
    let mut all_sub = broadcaster.subscribe_trades(None);

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "1", 2))
        .await
        .unwrap();

    for sub in [&mut pair_sub, &mut all_sub] {
        match next_data_message(sub).await {
            SubscriberMessage::TradeExecuted { trade, .. } => {
                assert_eq!(trade.price, dec!(2000));
                assert_eq!(trade.taker_order_id, "s1");
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_user_order_subscription_is_scoped() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_secs(60));
    let mut maker_sub = broadcaster.subscribe_user_orders("U1");
    let mut other_sub = broadcaster.subscribe_user_orders("U3");

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "1", 2))
        .await
        .unwrap();

    match next_data_message(&mut maker_sub).await {
        SubscriberMessage::OrderFilled { order, .. } => {
            assert_eq!(order.id, "b1");
            assert_eq!(order.user_id, "U1");
        }
        other => panic!("expected order_filled, got {other:?}"),
    }

    // U3 took no part in the trade and must see nothing
    let nothing = timeout(Duration::from_millis(200), other_sub.messages.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_cancel_reaches_owner_subscription() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_secs(60));
    let mut sub = broadcaster.subscribe_user_orders("U1");

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    core.exchange
        .cancel(clob_core::CancelIntent {
            order_id: "b1".to_string(),
            requester_id: "U1".to_string(),
        })
        .await
        .unwrap();

    match next_data_message(&mut sub).await {
        SubscriberMessage::OrderCancelled { order, .. } => assert_eq!(order.id, "b1"),
        other => panic!("expected order_cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_carries_latest_seq() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_millis(50));
    let mut sub = broadcaster.subscribe_orderbook(&eth_usdc()).await.unwrap();

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();

    loop {
        match next_message(&mut sub).await {
            SubscriberMessage::Heartbeat { seq, ts } => {
                if seq > 0 {
                    assert!(ts > 0);
                    break;
                }
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let core = TestCore::start();
    let broadcaster = broadcaster(&core, Duration::from_secs(60));
    let mut sub = broadcaster.subscribe_trades(Some(&eth_usdc()));
    broadcaster.unsubscribe_trades(Some(&eth_usdc()), sub.id);

    core.exchange
        .place(limit_intent("b1", "U1", eth_usdc(), Side::Buy, "2000", "1", 1))
        .await
        .unwrap();
    core.exchange
        .place(limit_intent("s1", "U2", eth_usdc(), Side::Sell, "2000", "1", 2))
        .await
        .unwrap();

    let nothing = timeout(Duration::from_millis(200), sub.messages.recv()).await;
    // either the channel is already closed or it stays silent
    assert!(matches!(nothing, Err(_) | Ok(None)));
}
