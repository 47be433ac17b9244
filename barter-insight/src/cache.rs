//! Rate limited, request coalescing cache over a single [`MarketConnector`].
//!
//! Every read follows the same contract:
//! 1. A fresh cached value (and no forced refresh) is returned without touching the network or
//!    the [`RateLimiter`].
//! 2. Otherwise a fetch already in flight for the exact same key is joined.
//! 3. Otherwise a limiter token is acquired, the connector is called, the result is stored with
//!    a fresh timestamp and handed to every waiter. Failures reach every waiter and are never
//!    cached.

use crate::{
    config::env_millis_or,
    connector::{
        Balance, Candle, ExchangeInfo, KlineInterval, MarketConnector, MarketUpdate, SymbolFilters,
        normalise_symbol,
    },
    error::{CacheError, ConnectorError},
    flight::InFlight,
    limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats},
};
use derive_more::Display;
use fnv::FnvHashMap;
use futures::StreamExt;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, trace, warn};

/// Identifies one cached value and, equally, one in-flight fetch.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Display)]
pub enum CacheKey {
    #[display("exchange_info")]
    ExchangeInfo,
    #[display("price:{_0}")]
    Price(SmolStr),
    #[display("balances")]
    Balances,
    #[display("klines:{symbol}:{interval}:{limit}")]
    Klines {
        symbol: SmolStr,
        interval: KlineInterval,
        limit: u16,
    },
}

/// Capacity of the [`CacheEvent`] broadcast channel.
pub const CACHE_EVENT_BUFFER: usize = 1024;

/// Change notification published after the [`DataCache`] stores a value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// Exchange info was fetched or preloaded.
    ExchangeInfo(Arc<ExchangeInfo>),
    /// A price was fetched or pushed.
    Price { symbol: SmolStr, price: f64 },
    /// A single asset balance was pushed.
    Balance(Balance),
    /// Balances were fetched. Carries the full merged snapshot.
    Balances(Vec<Balance>),
}

/// Cached value and the instant it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub observed_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            observed_at: Instant::now(),
        }
    }

    pub fn is_fresh(&self, max_age: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.observed_at) < max_age
    }
}

/// [`DataCache`] configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Default max age of a cached price.
    pub price_ttl: Duration,
    /// Default max age of cached balances.
    pub balance_ttl: Duration,
    /// Max age of cached exchange info.
    pub exchange_info_ttl: Duration,
    /// Default max age of cached candles.
    pub kline_ttl: Duration,
    /// Upper bound on a single connector call, excluding time spent waiting for a token.
    pub upstream_timeout: Duration,
    /// Admission control applied to every connector call.
    pub limiter: RateLimiterConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            price_ttl: Duration::from_secs(1),
            balance_ttl: Duration::from_secs(5),
            exchange_info_ttl: Duration::from_secs(600),
            kline_ttl: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(10),
            limiter: RateLimiterConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Read `DS_PRICE_TTL_MS`, `DS_BAL_TTL_MS`, `DS_EXINFO_TTL_MS`, `DS_KLINE_TTL_MS`,
    /// `DS_UPSTREAM_TIMEOUT_MS` and the [`RateLimiterConfig`] variables.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            price_ttl: env_millis_or("DS_PRICE_TTL_MS", default.price_ttl),
            balance_ttl: env_millis_or("DS_BAL_TTL_MS", default.balance_ttl),
            exchange_info_ttl: env_millis_or("DS_EXINFO_TTL_MS", default.exchange_info_ttl),
            kline_ttl: env_millis_or("DS_KLINE_TTL_MS", default.kline_ttl),
            upstream_timeout: env_millis_or("DS_UPSTREAM_TIMEOUT_MS", default.upstream_timeout),
            limiter: RateLimiterConfig::from_env(),
        }
    }

    pub fn with_price_ttl(mut self, ttl: Duration) -> Self {
        self.price_ttl = ttl;
        self
    }

    pub fn with_balance_ttl(mut self, ttl: Duration) -> Self {
        self.balance_ttl = ttl;
        self
    }

    pub fn with_exchange_info_ttl(mut self, ttl: Duration) -> Self {
        self.exchange_info_ttl = ttl;
        self
    }

    pub fn with_kline_ttl(mut self, ttl: Duration) -> Self {
        self.kline_ttl = ttl;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }
}

/// Shared handle to the market data cache. Cheap to clone.
#[derive(Clone)]
pub struct DataCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    limiter: RateLimiter,
    connector: RwLock<Option<Arc<dyn MarketConnector>>>,
    updates_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<CacheEvent>,

    exchange_info: Mutex<Option<CacheEntry<Arc<ExchangeInfo>>>>,
    prices: Mutex<FnvHashMap<SmolStr, CacheEntry<f64>>>,
    balances: Mutex<FnvHashMap<SmolStr, CacheEntry<Balance>>>,
    klines: Mutex<FnvHashMap<CacheKey, CacheEntry<Arc<Vec<Candle>>>>>,

    exchange_info_flights: InFlight<CacheKey, Arc<ExchangeInfo>>,
    price_flights: InFlight<CacheKey, f64>,
    balance_flights: InFlight<CacheKey, Vec<Balance>>,
    kline_flights: InFlight<CacheKey, Arc<Vec<Candle>>>,
}

impl DataCache {
    pub fn new(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(CACHE_EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                config,
                limiter: RateLimiter::new(config.limiter),
                connector: RwLock::new(None),
                updates_task: Mutex::new(None),
                events,
                exchange_info: Mutex::new(None),
                prices: Mutex::new(FnvHashMap::default()),
                balances: Mutex::new(FnvHashMap::default()),
                klines: Mutex::new(FnvHashMap::default()),
                exchange_info_flights: InFlight::new(),
                price_flights: InFlight::new(),
                balance_flights: InFlight::new(),
                kline_flights: InFlight::new(),
            }),
        }
    }

    /// Construct a [`DataCache`] with the provided connector already attached.
    pub fn with_connector(config: CacheConfig, connector: Arc<dyn MarketConnector>) -> Self {
        let cache = Self::new(config);
        cache.attach_connector(connector);
        cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribe to [`CacheEvent`]s published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Attach the [`MarketConnector`] used on cache misses.
    ///
    /// If the connector exposes a push update stream, a task is spawned that feeds every update
    /// into the cache, so this must then be called from within a tokio runtime.
    pub fn attach_connector(&self, connector: Arc<dyn MarketConnector>) {
        let updates = connector.updates();
        *self.inner.connector.write() = Some(connector);

        let task = updates.map(|updates| {
            info!("DataCache ingesting connector push updates");
            let cache = Arc::downgrade(&self.inner);
            tokio::spawn(ingest_updates(cache, updates))
        });

        if let Some(previous) = std::mem::replace(&mut *self.inner.updates_task.lock(), task) {
            previous.abort();
        }
    }

    /// Detach the current connector, returning it. Cached values are kept.
    pub fn detach_connector(&self) -> Option<Arc<dyn MarketConnector>> {
        if let Some(task) = self.inner.updates_task.lock().take() {
            task.abort();
        }
        self.inner.connector.write().take()
    }

    pub fn has_connector(&self) -> bool {
        self.inner.connector.read().is_some()
    }

    /// Venue metadata, refreshed once older than [`CacheConfig::exchange_info_ttl`].
    pub async fn exchange_info(&self, force_refresh: bool) -> Result<Arc<ExchangeInfo>, CacheError> {
        let max_age = self.inner.config.exchange_info_ttl;
        if !force_refresh {
            if let Some(info) = self.inner.fresh_exchange_info(max_age) {
                return Ok(info);
            }
        }

        let connector = self.inner.connector("exchange_info")?;
        let inner = Arc::clone(&self.inner);

        self.inner
            .exchange_info_flights
            .join_or_spawn(
                CacheKey::ExchangeInfo,
                || {
                    (!force_refresh)
                        .then(|| self.inner.fresh_exchange_info(max_age))
                        .flatten()
                },
                move || async move {
                    let key = CacheKey::ExchangeInfo;
                    let info = inner.upstream(&key, connector.exchange_info()).await?;
                    debug!(symbols = info.symbols.len(), "DataCache fetched exchange info");
                    Ok(inner.store_exchange_info(info))
                },
            )
            .resolve()
            .await
    }

    /// Latest price of `symbol` no older than `max_age`.
    pub async fn price(
        &self,
        symbol: &str,
        max_age: Duration,
        force_refresh: bool,
    ) -> Result<f64, CacheError> {
        let symbol = normalise_symbol(symbol);
        if !force_refresh {
            if let Some(price) = self.inner.fresh_price(&symbol, max_age) {
                trace!(%symbol, price, "DataCache price hit");
                return Ok(price);
            }
        }

        let connector = self.inner.connector("price")?;
        let inner = Arc::clone(&self.inner);
        let key = CacheKey::Price(symbol.clone());
        let fetch_symbol = symbol.clone();

        self.inner
            .price_flights
            .join_or_spawn(
                key.clone(),
                || {
                    (!force_refresh)
                        .then(|| self.inner.fresh_price(&symbol, max_age))
                        .flatten()
                },
                move || async move {
                    let symbol = fetch_symbol;
                    let price = inner.upstream(&key, connector.price(&symbol)).await?;
                    if !price.is_finite() {
                        warn!(%key, price, "DataCache rejected non-finite price");
                        return Err(CacheError::InvalidValue {
                            key: key.to_string(),
                            reason: format!("non-finite price {price}"),
                        });
                    }
                    inner.store_price(symbol, price);
                    Ok(price)
                },
            )
            .resolve()
            .await
    }

    /// [`DataCache::price`] using [`CacheConfig::price_ttl`].
    pub async fn price_default(&self, symbol: &str) -> Result<f64, CacheError> {
        self.price(symbol, self.inner.config.price_ttl, false).await
    }

    /// Snapshot of every cached asset balance, sorted by asset.
    ///
    /// Balances are fresh if at least one asset is cached and the most recently observed one is
    /// younger than `max_age`. A fetch merges the reported assets into the cache.
    pub async fn balances(
        &self,
        max_age: Duration,
        force_refresh: bool,
    ) -> Result<Vec<Balance>, CacheError> {
        if !force_refresh {
            if let Some(balances) = self.inner.fresh_balances(max_age) {
                return Ok(balances);
            }
        }

        let connector = self.inner.connector("balances")?;
        let inner = Arc::clone(&self.inner);

        self.inner
            .balance_flights
            .join_or_spawn(
                CacheKey::Balances,
                || {
                    (!force_refresh)
                        .then(|| self.inner.fresh_balances(max_age))
                        .flatten()
                },
                move || async move {
                    let key = CacheKey::Balances;
                    let balances = inner.upstream(&key, connector.balances()).await?;
                    inner.store_balances(balances);
                    let snapshot = inner.balances_snapshot();
                    inner.publish(CacheEvent::Balances(snapshot.clone()));
                    Ok(snapshot)
                },
            )
            .resolve()
            .await
    }

    /// [`DataCache::balances`] using [`CacheConfig::balance_ttl`].
    pub async fn balances_default(&self) -> Result<Vec<Balance>, CacheError> {
        self.balances(self.inner.config.balance_ttl, false).await
    }

    /// Up to `limit` historical candles of `symbol`, cached per `(symbol, interval, limit)`.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u16,
        max_age: Duration,
        force_refresh: bool,
    ) -> Result<Arc<Vec<Candle>>, CacheError> {
        let symbol = normalise_symbol(symbol);
        let key = CacheKey::Klines {
            symbol: symbol.clone(),
            interval,
            limit,
        };
        if !force_refresh {
            if let Some(candles) = self.inner.fresh_klines(&key, max_age) {
                return Ok(candles);
            }
        }

        let connector = self.inner.connector("klines")?;
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        self.inner
            .kline_flights
            .join_or_spawn(
                key.clone(),
                || {
                    (!force_refresh)
                        .then(|| self.inner.fresh_klines(&key, max_age))
                        .flatten()
                },
                move || async move {
                    let candles = inner
                        .upstream(&task_key, connector.klines(&symbol, interval, limit))
                        .await?;
                    debug!(key = %task_key, candles = candles.len(), "DataCache fetched klines");
                    Ok(inner.store_klines(task_key, candles))
                },
            )
            .resolve()
            .await
    }

    /// [`DataCache::klines`] using [`CacheConfig::kline_ttl`].
    pub async fn klines_default(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u16,
    ) -> Result<Arc<Vec<Candle>>, CacheError> {
        self.klines(symbol, interval, limit, self.inner.config.kline_ttl, false)
            .await
    }

    /// Record a pushed ticker price, bypassing the limiter and in-flight machinery.
    ///
    /// Returns `false` and ignores the update if the symbol is empty or the price non-finite.
    pub fn record_ticker_update(&self, symbol: &str, price: f64) -> bool {
        let symbol = normalise_symbol(symbol);
        if symbol.is_empty() || !price.is_finite() {
            debug!(%symbol, price, "DataCache ignored malformed ticker update");
            return false;
        }
        self.inner.store_price(symbol, price);
        true
    }

    /// Record a pushed balance, bypassing the limiter and in-flight machinery.
    ///
    /// Returns `false` and ignores the update if the asset is empty or an amount non-finite.
    pub fn record_balance_update(&self, asset: &str, free: f64, locked: f64) -> bool {
        let balance = Balance::new(asset, free, locked);
        if !is_valid_balance(&balance) {
            debug!(?balance, "DataCache ignored malformed balance update");
            return false;
        }
        self.inner.store_balances([balance.clone()]);
        self.inner.publish(CacheEvent::Balance(balance));
        true
    }

    /// Seed the exchange info entry, eg/ from a snapshot loaded at start-up.
    pub fn preload_exchange_info(&self, info: ExchangeInfo) {
        self.inner.store_exchange_info(info);
    }

    /// Order filters of `symbol` from the cached exchange info, regardless of its age.
    pub fn symbol_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        let info = self.inner.exchange_info.lock().as_ref()?.value.clone();
        info.symbol(symbol).map(|info| info.filters())
    }

    /// Symbols currently `TRADING` according to the cached exchange info, sorted.
    pub fn tradable_symbols(&self) -> Vec<SmolStr> {
        let Some(info) = self
            .inner
            .exchange_info
            .lock()
            .as_ref()
            .map(|entry| Arc::clone(&entry.value))
        else {
            return Vec::new();
        };

        info.symbols
            .iter()
            .filter(|symbol| symbol.is_trading())
            .map(|symbol| normalise_symbol(&symbol.symbol))
            .sorted()
            .dedup()
            .collect()
    }

    /// Cached price of `symbol` regardless of its age. Never fetches.
    pub fn cached_price(&self, symbol: &str) -> Option<f64> {
        self.inner
            .prices
            .lock()
            .get(&normalise_symbol(symbol))
            .map(|entry| entry.value)
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.inner.limiter.stats()
    }

    /// Number of fetches currently in flight across every key.
    pub fn in_flight(&self) -> usize {
        self.inner.exchange_info_flights.len()
            + self.inner.price_flights.len()
            + self.inner.balance_flights.len()
            + self.inner.kline_flights.len()
    }

    fn apply_update(&self, update: MarketUpdate) {
        match update {
            MarketUpdate::Ticker { symbol, price } => {
                self.record_ticker_update(&symbol, price);
            }
            MarketUpdate::Balance(balance) => {
                self.record_balance_update(&balance.asset, balance.free, balance.locked);
            }
        }
    }
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("config", &self.inner.config)
            .field("has_connector", &self.has_connector())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Inner {
    fn connector(&self, operation: &'static str) -> Result<Arc<dyn MarketConnector>, CacheError> {
        self.connector
            .read()
            .clone()
            .ok_or(CacheError::ConnectorMissing(operation))
    }

    /// Acquire a limiter token, then run the connector call bounded by the upstream timeout.
    async fn upstream<T, Call>(&self, key: &CacheKey, call: Call) -> Result<T, CacheError>
    where
        Call: Future<Output = Result<T, ConnectorError>>,
    {
        self.limiter.acquire().await;
        debug!(%key, "DataCache fetching from upstream");

        match tokio::time::timeout(self.config.upstream_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => {
                warn!(%key, %source, "DataCache upstream fetch failed");
                Err(CacheError::Upstream {
                    key: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(%key, timeout = ?self.config.upstream_timeout, "DataCache upstream fetch timed out");
                Err(CacheError::Timeout {
                    key: key.to_string(),
                    timeout: self.config.upstream_timeout,
                })
            }
        }
    }

    fn fresh_exchange_info(&self, max_age: Duration) -> Option<Arc<ExchangeInfo>> {
        let now = Instant::now();
        self.exchange_info
            .lock()
            .as_ref()
            .filter(|entry| entry.is_fresh(max_age, now))
            .map(|entry| Arc::clone(&entry.value))
    }

    fn fresh_price(&self, symbol: &SmolStr, max_age: Duration) -> Option<f64> {
        let now = Instant::now();
        self.prices
            .lock()
            .get(symbol)
            .filter(|entry| entry.is_fresh(max_age, now))
            .map(|entry| entry.value)
    }

    fn fresh_balances(&self, max_age: Duration) -> Option<Vec<Balance>> {
        let now = Instant::now();
        let balances = self.balances.lock();
        let newest = balances.values().map(|entry| entry.observed_at).max()?;

        if now.saturating_duration_since(newest) < max_age {
            Some(snapshot(&balances))
        } else {
            None
        }
    }

    fn fresh_klines(&self, key: &CacheKey, max_age: Duration) -> Option<Arc<Vec<Candle>>> {
        let now = Instant::now();
        self.klines
            .lock()
            .get(key)
            .filter(|entry| entry.is_fresh(max_age, now))
            .map(|entry| Arc::clone(&entry.value))
    }

    fn store_exchange_info(&self, info: ExchangeInfo) -> Arc<ExchangeInfo> {
        let info = Arc::new(info);
        *self.exchange_info.lock() = Some(CacheEntry::new(Arc::clone(&info)));
        self.publish(CacheEvent::ExchangeInfo(Arc::clone(&info)));
        info
    }

    fn store_price(&self, symbol: SmolStr, price: f64) {
        self.prices
            .lock()
            .insert(symbol.clone(), CacheEntry::new(price));
        self.publish(CacheEvent::Price { symbol, price });
    }

    fn store_balances(&self, balances: impl IntoIterator<Item = Balance>) {
        let mut cached = self.balances.lock();
        for balance in balances {
            let balance = Balance::new(&balance.asset, balance.free, balance.locked);
            if !is_valid_balance(&balance) {
                debug!(?balance, "DataCache skipped malformed balance");
                continue;
            }
            cached.insert(balance.asset.clone(), CacheEntry::new(balance));
        }
    }

    fn store_klines(&self, key: CacheKey, candles: Vec<Candle>) -> Arc<Vec<Candle>> {
        let candles = Arc::new(candles);
        self.klines
            .lock()
            .insert(key, CacheEntry::new(Arc::clone(&candles)));
        candles
    }

    fn balances_snapshot(&self) -> Vec<Balance> {
        snapshot(&self.balances.lock())
    }

    fn publish(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.updates_task.get_mut().take() {
            task.abort();
        }
    }
}

fn snapshot(balances: &FnvHashMap<SmolStr, CacheEntry<Balance>>) -> Vec<Balance> {
    balances
        .values()
        .map(|entry| entry.value.clone())
        .sorted_by(|a, b| a.asset.cmp(&b.asset))
        .collect()
}

fn is_valid_balance(balance: &Balance) -> bool {
    !balance.asset.is_empty() && balance.free.is_finite() && balance.locked.is_finite()
}

async fn ingest_updates(
    cache: Weak<Inner>,
    mut updates: futures::stream::BoxStream<'static, MarketUpdate>,
) {
    while let Some(update) = updates.next().await {
        let Some(inner) = cache.upgrade() else {
            break;
        };
        DataCache { inner }.apply_update(update);
    }
    debug!("DataCache push update stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{SymbolFilter, SymbolInfo};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::{future::join_all, stream::BoxStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct MockConnector {
        price: Mutex<f64>,
        failures: AtomicUsize,
        delay: Duration,
        balances: Mutex<Vec<Balance>>,
        exchange_info: Mutex<ExchangeInfo>,
        updates: Mutex<Option<mpsc::UnboundedReceiver<MarketUpdate>>>,
        price_calls: AtomicUsize,
        balance_calls: AtomicUsize,
        kline_calls: AtomicUsize,
        exchange_info_calls: AtomicUsize,
    }

    impl MockConnector {
        fn with_price(price: f64) -> Self {
            Self {
                price: Mutex::new(price),
                ..Default::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(self, failures: usize) -> Self {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }

        async fn respond<T>(&self, value: T) -> Result<T, ConnectorError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ConnectorError::Http("connection reset".to_string()));
            }
            Ok(value)
        }
    }

    #[async_trait]
    impl MarketConnector for MockConnector {
        async fn exchange_info(&self) -> Result<ExchangeInfo, ConnectorError> {
            self.exchange_info_calls.fetch_add(1, Ordering::SeqCst);
            let info = self.exchange_info.lock().clone();
            self.respond(info).await
        }

        async fn price(&self, _: &str) -> Result<f64, ConnectorError> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            let price = *self.price.lock();
            self.respond(price).await
        }

        async fn balances(&self) -> Result<Vec<Balance>, ConnectorError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            let balances = self.balances.lock().clone();
            self.respond(balances).await
        }

        async fn klines(
            &self,
            _: &str,
            _: KlineInterval,
            limit: u16,
        ) -> Result<Vec<Candle>, ConnectorError> {
            self.kline_calls.fetch_add(1, Ordering::SeqCst);
            let candles = (0..limit)
                .map(|index| candle(index as i64, 100.0 + f64::from(index)))
                .collect();
            self.respond(candles).await
        }

        fn updates(&self) -> Option<BoxStream<'static, MarketUpdate>> {
            let updates = self.updates.lock().take()?;
            Some(
                futures::stream::unfold(updates, |mut updates| async move {
                    updates.recv().await.map(|update| (update, updates))
                })
                .boxed(),
            )
        }
    }

    fn candle(index: i64, close: f64) -> Candle {
        let open_time = DateTime::<Utc>::from_timestamp_millis(index * 300_000).unwrap();
        Candle {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            close_time: open_time,
        }
    }

    fn cache_with(connector: Arc<MockConnector>) -> DataCache {
        DataCache::with_connector(CacheConfig::default(), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_served_from_cache_within_max_age() {
        let connector = Arc::new(MockConnector::with_price(100.0));
        let cache = cache_with(Arc::clone(&connector));
        let max_age = Duration::from_millis(1000);

        assert_eq!(cache.price("BTCUSDT", max_age, false).await, Ok(100.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.price("BTCUSDT", max_age, false).await, Ok(100.0));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(cache.price("btcusdt", max_age, false).await, Ok(100.0));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_price_reads_coalesce_into_one_call() {
        let connector =
            Arc::new(MockConnector::with_price(42_000.0).with_delay(Duration::from_millis(20)));
        let cache = cache_with(Arc::clone(&connector));

        let results = join_all(
            (0..16).map(|_| cache.price("BTCUSDT", Duration::from_secs(1), false)),
        )
        .await;

        assert!(results.iter().all(|result| *result == Ok(42_000.0)));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_value() {
        let connector = Arc::new(MockConnector::with_price(1.0));
        let cache = cache_with(Arc::clone(&connector));

        cache.price("ETHUSDT", Duration::from_secs(60), false).await.unwrap();
        *connector.price.lock() = 2.0;

        assert_eq!(
            cache.price("ETHUSDT", Duration::from_secs(60), true).await,
            Ok(2.0)
        );
        assert_eq!(cache.cached_price("ETHUSDT"), Some(2.0));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fresh_hit_consumes_no_token() {
        let connector = Arc::new(MockConnector::with_price(1.0));
        let cache = DataCache::with_connector(
            CacheConfig::default()
                .with_limiter(RateLimiterConfig::new(2, Duration::from_secs(3600))),
            connector,
        );

        cache.price_default("ETHUSDT").await.unwrap();
        assert_eq!(cache.limiter_stats().available, 1);

        for _ in 0..10 {
            cache.price("ETHUSDT", Duration::from_secs(60), false).await.unwrap();
        }
        assert_eq!(cache.limiter_stats().available, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached_and_retried_on_next_access() {
        let connector = Arc::new(MockConnector::with_price(10.0).failing(1));
        let cache = cache_with(Arc::clone(&connector));

        let error = cache.price_default("SOLUSDT").await.unwrap_err();
        assert!(matches!(error, CacheError::Upstream { .. }));
        assert_eq!(cache.cached_price("SOLUSDT"), None);

        assert_eq!(cache.price_default("SOLUSDT").await, Ok(10.0));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_coalesced_waiter() {
        let connector = Arc::new(
            MockConnector::with_price(10.0)
                .with_delay(Duration::from_millis(10))
                .failing(1),
        );
        let cache = cache_with(Arc::clone(&connector));

        let results = join_all((0..4).map(|_| cache.price_default("SOLUSDT"))).await;

        assert!(
            results
                .iter()
                .all(|result| matches!(result, Err(CacheError::Upstream { .. })))
        );
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_connector_is_a_configuration_error() {
        let cache = DataCache::new(CacheConfig::default());

        assert_eq!(
            cache.price_default("BTCUSDT").await,
            Err(CacheError::ConnectorMissing("price"))
        );
        assert_eq!(
            cache.balances_default().await,
            Err(CacheError::ConnectorMissing("balances"))
        );
        assert!(
            cache
                .klines_default("BTCUSDT", KlineInterval::Minute5, 10)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_non_finite_price_is_rejected() {
        let connector = Arc::new(MockConnector::with_price(f64::NAN));
        let cache = cache_with(connector);

        assert!(matches!(
            cache.price_default("BTCUSDT").await,
            Err(CacheError::InvalidValue { .. })
        ));
        assert_eq!(cache.cached_price("BTCUSDT"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        let connector =
            Arc::new(MockConnector::with_price(1.0).with_delay(Duration::from_secs(30)));
        let cache = DataCache::with_connector(
            CacheConfig::default().with_upstream_timeout(Duration::from_secs(2)),
            connector,
        );

        assert!(matches!(
            cache.price_default("BTCUSDT").await,
            Err(CacheError::Timeout { .. })
        ));
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ticker_updates_warm_the_cache() {
        let connector = Arc::new(MockConnector::with_price(1.0));
        let cache = cache_with(Arc::clone(&connector));

        assert!(cache.record_ticker_update("btcusdt", 65_000.0));
        assert!(!cache.record_ticker_update("", 1.0));
        assert!(!cache.record_ticker_update("ETHUSDT", f64::INFINITY));

        assert_eq!(cache.price_default("BTCUSDT").await, Ok(65_000.0));
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.cached_price("ETHUSDT"), None);
    }

    #[tokio::test]
    async fn test_connector_push_stream_is_ingested() {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            updates: Mutex::new(Some(rx)),
            ..MockConnector::with_price(1.0)
        });
        let cache = cache_with(Arc::clone(&connector));

        tx.send(MarketUpdate::Ticker {
            symbol: SmolStr::new("ethusdt"),
            price: 3_000.0,
        })
        .unwrap();
        tx.send(MarketUpdate::Balance(Balance::new("usdt", 250.0, 50.0)))
            .unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.price_default("ETHUSDT").await, Ok(3_000.0));
        assert_eq!(
            cache.balances_default().await,
            Ok(vec![Balance::new("USDT", 250.0, 50.0)])
        );
        assert_eq!(connector.price_calls.load(Ordering::SeqCst), 0);
        assert_eq!(connector.balance_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_update_ingestion() {
        let (tx, rx) = mpsc::unbounded_channel::<MarketUpdate>();
        let connector = Arc::new(MockConnector {
            updates: Mutex::new(Some(rx)),
            ..MockConnector::with_price(1.0)
        });
        let cache = cache_with(connector);
        let handle = cache.clone();

        // A remaining handle keeps the ingestion task alive
        drop(cache);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!tx.is_closed());

        // The last handle aborts it, dropping the connector update stream
        drop(handle);
        let stopped = tokio::time::timeout(Duration::from_secs(1), tx.closed()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_observe_cache_changes() {
        let connector = Arc::new(MockConnector::with_price(42.0));
        *connector.balances.lock() = vec![Balance::new("BTC", 1.0, 0.0)];
        let cache = cache_with(Arc::clone(&connector));
        let mut events = cache.subscribe();

        assert!(cache.record_ticker_update("ethusdt", 3_000.0));
        assert!(!cache.record_ticker_update("", 1.0));
        assert!(cache.record_balance_update("usdt", 10.0, 0.0));
        cache.preload_exchange_info(ExchangeInfo::default());
        assert_eq!(cache.price_default("BTCUSDT").await, Ok(42.0));
        assert_eq!(
            cache
                .balances(Duration::ZERO, true)
                .await
                .map(|balances| balances.len()),
            Ok(2)
        );

        // Fresh hits publish nothing
        assert_eq!(cache.price_default("BTCUSDT").await, Ok(42.0));

        let expected = vec![
            CacheEvent::Price {
                symbol: SmolStr::new("ETHUSDT"),
                price: 3_000.0,
            },
            CacheEvent::Balance(Balance::new("USDT", 10.0, 0.0)),
            CacheEvent::ExchangeInfo(Arc::new(ExchangeInfo::default())),
            CacheEvent::Price {
                symbol: SmolStr::new("BTCUSDT"),
                price: 42.0,
            },
            CacheEvent::Balances(vec![
                Balance::new("BTC", 1.0, 0.0),
                Balance::new("USDT", 10.0, 0.0),
            ]),
        ];

        for (index, expected) in expected.into_iter().enumerate() {
            let actual = events.try_recv().unwrap();
            assert_eq!(actual, expected, "TC{} failed", index);
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_balances_merge_and_expire() {
        let connector = Arc::new(MockConnector::default());
        *connector.balances.lock() = vec![
            Balance::new("USDT", 100.0, 0.0),
            Balance::new("BTC", 0.5, 0.1),
            Balance::new("", 1.0, 0.0),
        ];
        let cache = cache_with(Arc::clone(&connector));
        cache.record_balance_update("eth", 2.0, 0.0);

        // Fresh push update satisfies the read
        assert_eq!(cache.balances_default().await.unwrap().len(), 1);
        assert_eq!(connector.balance_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;

        let balances = cache.balances_default().await.unwrap();
        let assets = balances
            .iter()
            .map(|balance| balance.asset.as_str())
            .collect::<Vec<_>>();
        assert_eq!(assets, vec!["BTC", "ETH", "USDT"]);
        assert_eq!(connector.balance_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_klines_are_cached_per_symbol_interval_and_limit() {
        let connector = Arc::new(MockConnector::default());
        let cache = cache_with(Arc::clone(&connector));

        let candles = cache
            .klines_default("BTCUSDT", KlineInterval::Minute5, 20)
            .await
            .unwrap();
        assert_eq!(candles.len(), 20);
        assert_eq!(candles.last().map(|candle| candle.close), Some(119.0));

        cache
            .klines_default("btcusdt", KlineInterval::Minute5, 20)
            .await
            .unwrap();
        assert_eq!(connector.kline_calls.load(Ordering::SeqCst), 1);

        cache
            .klines_default("BTCUSDT", KlineInterval::Minute5, 30)
            .await
            .unwrap();
        cache
            .klines_default("BTCUSDT", KlineInterval::Hour1, 20)
            .await
            .unwrap();
        assert_eq!(connector.kline_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exchange_info_filters_and_tradable_symbols() {
        let connector = Arc::new(MockConnector::default());
        *connector.exchange_info.lock() = ExchangeInfo {
            server_time: None,
            symbols: vec![
                SymbolInfo {
                    symbol: SmolStr::new("ETHUSDT"),
                    status: SmolStr::new("TRADING"),
                    base_asset: SmolStr::new("ETH"),
                    quote_asset: SmolStr::new("USDT"),
                    filters: vec![SymbolFilter::MinNotional { min_notional: 5.0 }],
                },
                SymbolInfo {
                    symbol: SmolStr::new("LUNAUSDT"),
                    status: SmolStr::new("BREAK"),
                    base_asset: SmolStr::new("LUNA"),
                    quote_asset: SmolStr::new("USDT"),
                    filters: vec![],
                },
            ],
        };
        let cache = cache_with(Arc::clone(&connector));

        assert!(cache.tradable_symbols().is_empty());
        assert!(cache.symbol_filters("ETHUSDT").is_none());

        let info = cache.exchange_info(false).await.unwrap();
        assert_eq!(info.symbols.len(), 2);
        cache.exchange_info(false).await.unwrap();
        assert_eq!(connector.exchange_info_calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.tradable_symbols(), vec![SmolStr::new("ETHUSDT")]);
        assert_eq!(
            cache.symbol_filters("ethusdt").and_then(|filters| filters.min_notional),
            Some(SymbolFilter::MinNotional { min_notional: 5.0 })
        );

        cache.exchange_info(true).await.unwrap();
        assert_eq!(connector.exchange_info_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preloaded_exchange_info_needs_no_connector() {
        let cache = DataCache::new(CacheConfig::default());
        cache.preload_exchange_info(ExchangeInfo::default());

        assert_eq!(
            cache.exchange_info(false).await.map(|info| info.symbols.len()),
            Ok(0)
        );
        assert!(!cache.has_connector());
    }

    #[test]
    fn test_cache_key_display() {
        struct TestCase {
            input: CacheKey,
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: singleton exchange info key
                input: CacheKey::ExchangeInfo,
                expected: "exchange_info",
            },
            TestCase {
                // TC1: price key
                input: CacheKey::Price(SmolStr::new("BTCUSDT")),
                expected: "price:BTCUSDT",
            },
            TestCase {
                // TC2: kline key
                input: CacheKey::Klines {
                    symbol: SmolStr::new("BTCUSDT"),
                    interval: KlineInterval::Minute5,
                    limit: 500,
                },
                expected: "klines:BTCUSDT:5m:500",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.input.to_string(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.price_ttl, Duration::from_secs(1));
        assert_eq!(config.balance_ttl, Duration::from_secs(5));
        assert_eq!(config.exchange_info_ttl, Duration::from_secs(600));
        assert_eq!(config.kline_ttl, Duration::from_secs(60));
        assert_eq!(config.limiter, RateLimiterConfig::default());
    }
}
