//! Integration tests wiring the DataCache, CorrelationEngine and SignalBus together through a
//! scripted MarketConnector.

use async_trait::async_trait;
use barter_insight::{
    Balance, CacheConfig, Candle, CorrelationConfig, CorrelationEngine, DataCache, Direction,
    ExchangeInfo, KlineInterval, MarketConnector, PublishOutcome, RateLimiterConfig, Signal,
    SignalBus, error::ConnectorError,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;

#[derive(Default)]
struct ScriptedConnector {
    price: f64,
    delay: Duration,
    price_calls: AtomicUsize,
    kline_calls: AtomicUsize,
}

impl ScriptedConnector {
    fn new(price: f64, delay: Duration) -> Self {
        Self {
            price,
            delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MarketConnector for ScriptedConnector {
    async fn exchange_info(&self) -> Result<ExchangeInfo, ConnectorError> {
        Ok(ExchangeInfo::default())
    }

    async fn price(&self, _: &str) -> Result<f64, ConnectorError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.price)
    }

    async fn balances(&self) -> Result<Vec<Balance>, ConnectorError> {
        Ok(vec![Balance::new("USDT", 1000.0, 0.0)])
    }

    async fn klines(
        &self,
        symbol: &str,
        _: KlineInterval,
        limit: u16,
    ) -> Result<Vec<Candle>, ConnectorError> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        // Trending series whose slope sign depends on the symbol
        let slope = if symbol.starts_with("INV") { -1.0 } else { 1.0 };
        Ok((0..limit)
            .map(|index| {
                let step = f64::from(index);
                let close = 500.0 + slope * step + (step * 0.9).sin();
                let open_time =
                    DateTime::<Utc>::from_timestamp_millis(i64::from(index) * 300_000).unwrap();
                Candle {
                    open_time,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1.0,
                    close_time: open_time,
                }
            })
            .collect())
    }
}

#[tokio::test(start_paused = true)]
async fn test_price_is_cached_for_max_age_then_refetched() {
    let connector = Arc::new(ScriptedConnector::new(100.0, Duration::ZERO));
    let cache = DataCache::with_connector(CacheConfig::default(), connector.clone());
    let max_age = Duration::from_millis(1000);

    let first = cache.price("BTCUSDT", max_age, false).await.unwrap();
    let second = cache.price("BTCUSDT", max_age, false).await.unwrap();
    assert_eq!(first, 100.0);
    assert_eq!(second, 100.0);
    assert_eq!(connector.price_calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1001)).await;

    assert_eq!(cache.price("BTCUSDT", max_age, false).await, Ok(100.0));
    assert_eq!(connector.price_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_readers_share_one_upstream_call() {
    let connector = Arc::new(ScriptedConnector::new(
        64_000.0,
        Duration::from_millis(50),
    ));
    let cache = DataCache::with_connector(CacheConfig::default(), connector.clone());

    let handles = (0..32)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.price_default("BTCUSDT").await })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(64_000.0));
    }
    assert_eq!(connector.price_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_are_paced_by_the_limiter() {
    let connector = Arc::new(ScriptedConnector::new(1.0, Duration::ZERO));
    let cache = DataCache::with_connector(
        CacheConfig::default().with_limiter(RateLimiterConfig::new(2, Duration::from_secs(1))),
        connector.clone(),
    );
    let start = Instant::now();

    let results = join_all(
        ["AAAUSDT", "BBBUSDT", "CCCUSDT", "DDDUSDT"]
            .into_iter()
            .map(|symbol| cache.price_default(symbol)),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(connector.price_calls.load(Ordering::SeqCst), 4);
    assert!(
        start.elapsed() >= Duration::from_millis(1000),
        "elapsed {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_correlation_runs_reuse_cached_candles() {
    let connector = Arc::new(ScriptedConnector::new(1.0, Duration::from_millis(5)));
    let cache = DataCache::with_connector(
        CacheConfig::default().with_limiter(RateLimiterConfig::new(100, Duration::from_secs(1))),
        connector.clone(),
    );
    let engine = CorrelationEngine::new(
        CorrelationConfig::default().with_kline_limit(120),
        cache.clone(),
    );
    let universe = ["AAAUSDT", "BBBUSDT", "CCCUSDT", "INVUSDT"];

    let summary = engine.analyze(universe).await;
    assert_eq!(summary.symbols_analysed, 4);
    assert_eq!(summary.significant_pairs, 6);
    assert_eq!(summary.negative_pairs, 3);
    assert_eq!(engine.clusters(3).len(), 1);
    assert!(engine.correlation("INVUSDT", "AAAUSDT").unwrap() < -0.9);

    engine.analyze(universe).await;
    assert_eq!(connector.kline_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_single_consumer() {
    let bus = Arc::new(SignalBus::default());

    let producers = (0..8)
        .map(|producer| {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                (0..10)
                    .map(|index| {
                        let score = f64::from(producer * 10 + index) / 100.0;
                        let signal = Signal::new(format!("SYM{index}USDT"), Direction::Long)
                            .with_composite_score(score);
                        bus.publish(signal, &format!("producer-{producer}"))
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let mut accepted = 0;
    for producer in producers {
        accepted += producer
            .await
            .unwrap()
            .into_iter()
            .filter(PublishOutcome::is_accepted)
            .count();
    }

    // One signal per key survives, and it is the best scored one
    assert_eq!(bus.len(), 10);
    let stats = bus.stats();
    assert_eq!(stats.published as usize, accepted);
    assert_eq!(stats.published + stats.dropped, 80);

    let batch = bus.next_batch(3);
    let scores = batch.iter().map(Signal::score).collect::<Vec<_>>();
    assert_eq!(scores, vec![0.79, 0.78, 0.77]);
    assert_eq!(bus.len(), 7);
}
