//! Two portfolio managers over one state file behave like two bot processes.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;
use tokio_test::assert_ok;

use shared_portfolio::{
    BotConfig, FileStateStore, PortfolioConfig, PortfolioError, PortfolioManager, StateStore,
};

fn make_config() -> PortfolioConfig {
    PortfolioConfig {
        total_balance: dec!(1000),
        ..Default::default()
    }
}

async fn open(dir: &TempDir) -> Arc<PortfolioManager> {
    let store = Arc::new(FileStateStore::new(dir.path().join("portfolio.json")));
    let manager = Arc::new(PortfolioManager::new(make_config(), store));
    manager.initialize().await.unwrap();
    manager
}

async fn register_with_retry(manager: &PortfolioManager, bot_id: &str, config: BotConfig) {
    for _ in 0..200 {
        match manager.register_bot(bot_id, config.clone()).await {
            Ok(_) => return,
            Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(e) => panic!("register {} failed: {}", bot_id, e),
        }
    }
    panic!("register {} never acquired the lock", bot_id);
}

#[tokio::test]
async fn test_processes_see_each_others_bots() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir).await;
    let b = open(&dir).await;

    assert_ok!(
        a.register_bot("grid-btc", BotConfig::new("BTCUSDT", dec!(10), dec!(0.5)))
            .await
    );
    assert_ok!(
        b.register_bot("dca-eth", BotConfig::new("ETHUSDT", dec!(5), dec!(0.3)))
            .await
    );

    // b reloaded before mutating, so it already knows about grid-btc
    assert!(b.get_allocation("grid-btc").await.is_some());
    assert_eq!(b.available_balance().await, dec!(200));

    // a catches up on its next sync
    assert!(a.get_allocation("dca-eth").await.is_none());
    assert!(a.sync_from_store().await.unwrap());
    assert_eq!(a.get_all_allocations().await.len(), 2);
    assert_eq!(a.version().await, b.version().await);
}

#[tokio::test]
async fn test_pool_cannot_be_overcommitted_across_processes() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir).await;
    let b = open(&dir).await;

    a.register_bot("grid-btc", BotConfig::new("BTCUSDT", dec!(10), dec!(0.6)))
        .await
        .unwrap();

    let err = b
        .register_bot("dca-eth", BotConfig::new("ETHUSDT", dec!(5), dec!(0.5)))
        .await
        .unwrap_err();
    assert!(matches!(err, PortfolioError::ExceedsAllocation { .. }));

    let state = b.store().load().await.unwrap();
    assert_eq!(state.allocations.len(), 1);
    assert_ok!(state.validate_invariants());
}

#[tokio::test]
async fn test_concurrent_registrations_are_serialized() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir).await;
    let b = open(&dir).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let manager = if i % 2 == 0 { a.clone() } else { b.clone() };
        tasks.push(tokio::spawn(async move {
            let bot_id = format!("bot-{}", i);
            register_with_retry(&manager, &bot_id, BotConfig::new("BTCUSDT", dec!(5), dec!(0.05)))
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let state = a.store().load().await.unwrap();
    assert_eq!(state.allocations.len(), 10);
    assert_eq!(state.version, 11);
    assert_eq!(state.total_allocated(), dec!(500));
    assert_ok!(state.validate_invariants());
    assert!(!dir.path().join("portfolio.json.lock").exists());
}

#[tokio::test]
async fn test_shared_profit_propagates() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir).await;
    let b = open(&dir).await;

    a.register_bot("grid-btc", BotConfig::new("BTCUSDT", dec!(10), dec!(0.5)))
        .await
        .unwrap();
    b.register_bot("dca-eth", BotConfig::new("ETHUSDT", dec!(5), dec!(0.3)))
        .await
        .unwrap();

    a.record_profit("grid-btc", dec!(100), true).await.unwrap();

    b.sync_from_store().await.unwrap();
    assert_eq!(b.total_balance().await, dec!(1100));
    assert_eq!(
        b.get_allocation("dca-eth").await.unwrap().allocated_balance,
        dec!(350)
    );
    assert_eq!(b.total_profit().await, dec!(100));

    // A loss recorded by b lands on top of a's profit
    b.record_profit("dca-eth", dec!(-30), false).await.unwrap();
    a.sync_from_store().await.unwrap();
    assert_eq!(a.total_profit().await, dec!(70));
    assert_eq!(
        a.get_allocation("dca-eth").await.unwrap().realized_pnl,
        dec!(-30)
    );
    assert_eq!(a.total_balance().await, dec!(1100));
    assert_eq!(a.get_allocation("grid-btc").await.unwrap().unrealized_pnl, Decimal::ZERO);
}

#[tokio::test]
async fn test_close_keeps_other_processes_commits() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir).await;
    let b = open(&dir).await;

    a.register_bot("grid-btc", BotConfig::new("BTCUSDT", dec!(10), dec!(0.5)))
        .await
        .unwrap();
    // a never syncs after b's registration
    b.register_bot("dca-eth", BotConfig::new("ETHUSDT", dec!(5), dec!(0.3)))
        .await
        .unwrap();
    let before = b.store().load().await.unwrap().version;

    a.close().await;

    let state = a.store().load().await.unwrap();
    assert!(state.allocations.contains_key("grid-btc"));
    assert!(state.allocations.contains_key("dca-eth"));
    assert_eq!(state.version, before + 1);
    assert_ok!(state.validate_invariants());

    // b sees a new version and keeps its bot
    assert!(b.sync_from_store().await.unwrap());
    assert!(b.get_allocation("dca-eth").await.is_some());
}
