use barter_insight::{
    BinanceConnector, CacheConfig, CorrelationConfig, CorrelationEngine, DataCache, Direction,
    Signal, SignalBus, SignalBusConfig,
};
use std::sync::Arc;
use tracing::{info, warn};

const UNIVERSE_SIZE: usize = 40;

#[tokio::main]
async fn main() {
    // Initialise INFO Tracing log subscriber
    init_logging();

    // Binance spot connector behind the rate limited, coalescing DataCache
    let connector = BinanceConnector::from_env().unwrap();
    let cache = DataCache::with_connector(CacheConfig::from_env(), Arc::new(connector));

    // Restrict the universe to the first USDT quoted symbols to keep the demo quick
    let info = cache.exchange_info(false).await.unwrap();
    let universe = info
        .symbols
        .iter()
        .filter(|symbol| symbol.is_trading() && symbol.quote_asset == "USDT")
        .map(|symbol| symbol.symbol.clone())
        .take(UNIVERSE_SIZE)
        .collect::<Vec<_>>();

    let engine = CorrelationEngine::new(CorrelationConfig::from_env(), cache.clone());
    let summary = engine.analyze(&universe).await;
    info!(?summary, "correlation analysis finished");

    for correlation in engine.high_confidence_pairs(10) {
        info!(pair = %correlation.pair, r = correlation.coefficient, "high confidence pair");
    }
    for cluster in engine.clusters(3) {
        info!(id = cluster.id, size = cluster.size(), symbols = ?cluster.symbols, "cluster");
    }

    // Publish one signal per strongly correlated pair, scored by |r|
    let bus = Arc::new(SignalBus::new(SignalBusConfig::from_env()));
    for correlation in engine.correlations_above(0.9, 20) {
        let direction = if correlation.coefficient > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        let signal = Signal::new(&correlation.pair.a, direction)
            .with_timeframe("5m")
            .with_category("correlation")
            .with_composite_score(correlation.coefficient.abs());

        bus.publish(signal, "correlation_scan");
    }

    for signal in bus.next_batch(5) {
        match cache.price_default(&signal.symbol).await {
            Ok(price) => info!(
                symbol = %signal.symbol,
                score = signal.score(),
                price,
                "top signal"
            ),
            Err(error) => warn!(symbol = %signal.symbol, %error, "failed to price signal"),
        }
    }

    info!(stats = ?bus.stats(), limiter = ?cache.limiter_stats(), "done");
}

// Initialise an INFO `Subscriber` for `Tracing` logs and install it as the global default.
fn init_logging() {
    tracing_subscriber::fmt()
        // Filter messages based on the INFO
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // Disable colours on release builds
        .with_ansi(cfg!(debug_assertions))
        // Install this Tracing subscriber as global default
        .init()
}
