/// Barter Insight - market data access and analytics core
///
/// This library provides the shared building blocks used by trading services that read venue
/// market data and act on derived opportunities:
/// - limiter: token bucket admission control with FIFO fairness
/// - cache: rate limited, request coalescing market data cache over a MarketConnector
/// - signal: priority, de-duplicating queue of trading signals
/// - correlation: pairwise Pearson correlation matrix and cluster detection
///
/// The library also includes a Binance spot REST connector.
pub mod binance;
pub mod cache;
pub mod config;
pub mod connector;
pub mod correlation;
pub mod error;
pub mod flight;
pub mod limiter;
pub mod signal;

// Re-export commonly used types for convenience
pub use binance::{BinanceConfig, BinanceConnector};
pub use cache::{CacheConfig, CacheEvent, CacheKey, DataCache};
pub use connector::{
    Balance, Candle, ExchangeInfo, KlineInterval, MarketConnector, MarketUpdate, SymbolFilter,
    SymbolFilters, SymbolInfo,
};
pub use error::{CacheError, ConnectorError};
pub use limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};

pub use correlation::{
    AnalysisSummary, Cluster, Correlation, CorrelationConfig, CorrelationEngine,
    CorrelationInsights, PairKey, PeerCorrelation, pearson,
};
pub use signal::{
    Direction, PublishOutcome, Signal, SignalBus, SignalBusConfig, SignalEvent, SignalFilter,
    SignalKey, SignalStats,
};
