//! Order engine against a shared asset inventory and tier book.

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use tierflow::engine::orders::{OrderEngine, OrderRejection, OrderRequest, ScriptedRandom};
use tierflow::market::{SharedTierBook, TierValues};
use tierflow::storage::{connect_in_memory, AssetStore, StoreKind};
use tierflow::types::{Asset, EngineError, OrderSide, Tier, TierAmounts};

async fn setup(draws: Vec<f64>) -> (Arc<OrderEngine>, AssetStore, SharedTierBook) {
    let assets = AssetStore::new(connect_in_memory(StoreKind::Assets).await.unwrap());
    let book = SharedTierBook::new(TierValues::new(
        TierAmounts::new(dec!(1000), dec!(1000), dec!(1000)),
        TierAmounts::ZERO,
    ));
    let engine = OrderEngine::new(assets.clone(), book.clone(), Arc::new(ScriptedRandom::new(draws)));
    (Arc::new(engine), assets, book)
}

fn order(asset_id: &str, tier: u8, side: OrderSide, amount: Decimal, price: Decimal) -> OrderRequest {
    OrderRequest {
        asset_id: asset_id.into(),
        tier_number: tier,
        asset_name: format!("{asset_id} holding"),
        amount_traded: amount,
        price,
        side,
    }
}

#[tokio::test]
async fn test_buy_then_sell_updates_inventory_and_book() {
    // Zero draw always fills.
    let (engine, assets, book) = setup(vec![0.0]).await;

    let bought = engine
        .execute(&order("muni-7", 2, OrderSide::Buy, dec!(10), dec!(5)))
        .await
        .unwrap();
    assert!(bought.is_executed());
    assert_eq!(book.snapshot().await.market_values.tier2, dec!(50));

    let sold = engine
        .execute(&order("muni-7", 2, OrderSide::Sell, dec!(4), dec!(5)))
        .await
        .unwrap();
    assert!(sold.is_executed());

    let asset = assets.get("muni-7").await.unwrap().unwrap();
    assert_eq!(asset.amount, dec!(6));
    assert_eq!(asset.tier, Tier::Two);
    assert_eq!(book.snapshot().await.market_values.tier2, dec!(30));
    // Pools are never debited by orders.
    assert_eq!(book.snapshot().await.pools.tier2, dec!(1000));
}

#[tokio::test]
async fn test_unlucky_draw_leaves_inventory_untouched_but_audited() {
    // Draw of 1.0 exceeds the 0.95 ceiling.
    let (engine, assets, book) = setup(vec![1.0]).await;

    let outcome = engine
        .execute(&order("corp-1", 3, OrderSide::Buy, dec!(10), dec!(2)))
        .await
        .unwrap();
    assert_eq!(outcome.rejection(), Some(OrderRejection::OrderRejected));
    assert!(assets.get("corp-1").await.unwrap().is_none());
    assert!(book.snapshot().await.market_values.is_zero());

    let log = assets.list_order_log(10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, "failed");
    assert_eq!(log[0].error.as_deref(), Some("order_rejected"));
    assert_eq!(log[0].draw, Some(1.0));
    assert!(log[0].execution_probability.is_some());
}

#[tokio::test]
async fn test_every_decision_lands_in_the_order_log() {
    let (engine, assets, _) = setup(vec![0.0]).await;

    engine
        .execute(&order("t-bill", 1, OrderSide::Buy, dec!(10), dec!(10)))
        .await
        .unwrap();
    engine
        .execute(&order("t-bill", 1, OrderSide::Buy, dec!(500), dec!(10)))
        .await
        .unwrap();
    engine
        .execute(&order("nowhere", 1, OrderSide::Sell, dec!(1), dec!(1)))
        .await
        .unwrap();

    let log = assets.list_order_log(10).await.unwrap();
    assert_eq!(log.len(), 3);
    let executed = log.iter().filter(|r| r.status == "executed").count();
    assert_eq!(executed, 1);
    let reasons: Vec<_> = log.iter().filter_map(|r| r.error.clone()).collect();
    assert!(reasons.contains(&"insufficient_funds".to_string()));
    assert!(reasons.contains(&"asset_not_found".to_string()));
}

#[tokio::test]
async fn test_concurrent_sells_never_oversell() {
    let (engine, assets, _) = setup(vec![0.0]).await;
    assets
        .insert(&Asset {
            asset_id: "agency-3".into(),
            tier: Tier::One,
            name: "Agency 3".into(),
            amount: dec!(20),
            price_per_unit: dec!(1),
            last_updated: Utc::now(),
        })
        .await
        .unwrap();

    let sell = order("agency-3", 1, OrderSide::Sell, dec!(1), dec!(1));
    let results = join_all((0..25).map(|_| engine.execute(&sell))).await;

    let mut executed = 0u32;
    for result in results {
        let outcome = result.unwrap();
        match outcome.rejection() {
            None => executed += 1,
            Some(OrderRejection::Conflict) => assert!(outcome.execution_probability().is_some()),
            Some(OrderRejection::InsufficientAssets) => {}
            Some(other) => panic!("unexpected rejection: {}", other.as_str()),
        }
    }
    assert!(executed > 0);

    let asset = assets.get("agency-3").await.unwrap().unwrap();
    assert!(asset.amount >= Decimal::ZERO);
    assert_eq!(asset.amount, dec!(20) - Decimal::from(executed));

    // Lost races included, every decision reached the log.
    let log = assets.list_order_log(100).await.unwrap();
    assert_eq!(log.len(), 25);
    assert_eq!(log.iter().filter(|r| r.status == "executed").count() as u32, executed);
}

#[tokio::test]
async fn test_stale_compare_and_set_is_refused() {
    let assets = AssetStore::new(connect_in_memory(StoreKind::Assets).await.unwrap());
    assets
        .insert(&Asset {
            asset_id: "muni-9".into(),
            tier: Tier::Three,
            name: "Muni 9".into(),
            amount: dec!(10),
            price_per_unit: dec!(3),
            last_updated: Utc::now(),
        })
        .await
        .unwrap();

    assets.compare_and_set_amount("muni-9", dec!(10), dec!(6)).await.unwrap();
    let stale = assets.compare_and_set_amount("muni-9", dec!(10), dec!(2)).await;
    assert!(matches!(stale, Err(EngineError::ConcurrentUpdate(_))));
    assert_eq!(assets.get("muni-9").await.unwrap().unwrap().amount, dec!(6));
}
