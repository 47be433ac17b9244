//! Pairwise Pearson correlation and clustering over a universe of symbols.
//!
//! Each [`CorrelationEngine::analyze`] run pulls candles through the [`DataCache`], recomputes
//! the full correlation matrix and cluster set, then atomically swaps them in for the query
//! methods to read.

use crate::{
    cache::DataCache,
    config::{env_millis_or, env_or},
    connector::{KlineInterval, normalise_symbol},
    error::CacheError,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use futures::future::join_all;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};

/// Pearson correlation coefficient of the common trailing `window` of `a` and `b`.
///
/// Returns 0.0 if fewer than two points overlap or either series is constant.
pub fn pearson(a: &[f64], b: &[f64], window: usize) -> f64 {
    let n = a.len().min(b.len()).min(window);
    if n < 2 {
        return 0.0;
    }

    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let len = n as f64;
    let mean_a = a.iter().sum::<f64>() / len;
    let mean_b = b.iter().sum::<f64>() / len;

    let (cov, var_a, var_b) = a.iter().zip(b).fold(
        (0.0, 0.0, 0.0),
        |(cov, var_a, var_b), (x, y)| {
            let diff_a = x - mean_a;
            let diff_b = y - mean_b;
            (
                cov + diff_a * diff_b,
                var_a + diff_a * diff_a,
                var_b + diff_b * diff_b,
            )
        },
    );

    let den = (var_a * var_b).sqrt();
    if den == 0.0 || !den.is_finite() {
        return 0.0;
    }

    (cov / den).clamp(-1.0, 1.0)
}

/// Unordered symbol pair, stored with `a < b`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize)]
#[display("{a}|{b}")]
pub struct PairKey {
    pub a: SmolStr,
    pub b: SmolStr,
}

impl PairKey {
    pub fn new(x: &str, y: &str) -> Self {
        let (x, y) = (normalise_symbol(x), normalise_symbol(y));
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Correlation {
    pub pair: PairKey,
    pub coefficient: f64,
}

/// Correlation of one symbol to the symbol it was queried against.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PeerCorrelation {
    pub symbol: SmolStr,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Cluster {
    /// 1-based position in the queried cluster list.
    pub id: usize,
    pub symbols: Vec<SmolStr>,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.symbols.len()
    }
}

/// Outcome of one [`CorrelationEngine::analyze`] run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalysisSummary {
    /// Distinct symbols considered after truncation to `max_symbols`.
    pub symbols_requested: usize,
    /// Symbols with enough closes to be correlated.
    pub symbols_analysed: usize,
    /// Symbols whose candle fetch failed.
    pub symbols_failed: usize,
    /// Symbols with fewer than `min_points` usable closes.
    pub symbols_insufficient: usize,
    pub pairs_evaluated: usize,
    /// Pairs with `|r| >= significant_threshold`.
    pub significant_pairs: usize,
    pub positive_pairs: usize,
    pub negative_pairs: usize,
    pub high_confidence_pairs: usize,
    pub clusters: usize,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CorrelationInsights {
    /// Up to five pairs with `|r| >= 0.9`.
    pub strongest: Vec<Correlation>,
    /// Up to five pairs at or above the high confidence threshold.
    pub high_confidence: Vec<Correlation>,
    pub clusters: Vec<Cluster>,
    pub summary: Option<AnalysisSummary>,
}

/// [`CorrelationEngine`] configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CorrelationConfig {
    pub significant_threshold: f64,
    pub high_confidence_threshold: f64,
    /// Trailing closes correlated per pair.
    pub window: usize,
    /// Symbols with fewer closes are excluded from a run.
    pub min_points: usize,
    pub interval: KlineInterval,
    pub kline_limit: u16,
    pub kline_max_age: Duration,
    pub max_symbols: usize,
    /// Candle fetches issued concurrently.
    pub fetch_batch: usize,
    pub min_cluster_size: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            significant_threshold: 0.7,
            high_confidence_threshold: 0.85,
            window: 100,
            min_points: 10,
            interval: KlineInterval::Minute5,
            kline_limit: 500,
            kline_max_age: Duration::from_secs(60),
            max_symbols: 1000,
            fetch_batch: 20,
            min_cluster_size: 3,
        }
    }
}

impl CorrelationConfig {
    /// Read the `CORRELATION_*` environment variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            significant_threshold: env_or(
                "CORRELATION_THRESHOLD",
                default.significant_threshold,
            ),
            high_confidence_threshold: env_or(
                "CORRELATION_HIGH_CONFIDENCE_THRESHOLD",
                default.high_confidence_threshold,
            ),
            window: env_or("CORRELATION_WINDOW", default.window),
            min_points: env_or("CORRELATION_MIN_POINTS", default.min_points),
            interval: default.interval,
            kline_limit: env_or("CORRELATION_KLINE_LIMIT", default.kline_limit),
            kline_max_age: env_millis_or("CORRELATION_KLINE_MAX_AGE_MS", default.kline_max_age),
            max_symbols: env_or("CORRELATION_MAX_SYMBOLS", default.max_symbols),
            fetch_batch: env_or("CORRELATION_FETCH_BATCH", default.fetch_batch),
            min_cluster_size: env_or("CORRELATION_MIN_CLUSTER_SIZE", default.min_cluster_size),
        }
    }

    pub fn with_thresholds(mut self, significant: f64, high_confidence: f64) -> Self {
        self.significant_threshold = significant;
        self.high_confidence_threshold = high_confidence;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    pub fn with_interval(mut self, interval: KlineInterval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_kline_limit(mut self, kline_limit: u16) -> Self {
        self.kline_limit = kline_limit;
        self
    }

    pub fn with_kline_max_age(mut self, kline_max_age: Duration) -> Self {
        self.kline_max_age = kline_max_age;
        self
    }

    pub fn with_max_symbols(mut self, max_symbols: usize) -> Self {
        self.max_symbols = max_symbols;
        self
    }

    pub fn with_fetch_batch(mut self, fetch_batch: usize) -> Self {
        self.fetch_batch = fetch_batch;
        self
    }

    pub fn with_min_cluster_size(mut self, min_cluster_size: usize) -> Self {
        self.min_cluster_size = min_cluster_size;
        self
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    matrix: FnvHashMap<PairKey, f64>,
    peers: FnvHashMap<SmolStr, Vec<PeerCorrelation>>,
    clusters: Vec<Vec<SmolStr>>,
    summary: Option<AnalysisSummary>,
}

#[derive(Debug, Default)]
struct Fetched {
    series: BTreeMap<SmolStr, Vec<f64>>,
    failed: usize,
    insufficient: usize,
}

/// Computes and serves the correlation matrix of a symbol universe.
#[derive(Debug)]
pub struct CorrelationEngine {
    config: CorrelationConfig,
    cache: DataCache,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig, cache: DataCache) -> Self {
        Self {
            config,
            cache,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Recompute every correlation and cluster of `universe`.
    ///
    /// Symbols whose candle fetch fails are skipped for this run only.
    pub async fn analyze<Symbols, S>(&self, universe: Symbols) -> AnalysisSummary
    where
        Symbols: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started = tokio::time::Instant::now();
        let universe = universe
            .into_iter()
            .map(|symbol| normalise_symbol(symbol.as_ref()))
            .filter(|symbol| !symbol.is_empty())
            .unique()
            .take(self.config.max_symbols)
            .collect::<Vec<_>>();

        info!(symbols = universe.len(), "CorrelationEngine starting analysis");

        let fetched = self.fetch_closes(&universe).await;
        let mut snapshot = correlate(&fetched.series, &self.config);

        let summary = AnalysisSummary {
            symbols_requested: universe.len(),
            symbols_analysed: fetched.series.len(),
            symbols_failed: fetched.failed,
            symbols_insufficient: fetched.insufficient,
            pairs_evaluated: fetched.series.len() * fetched.series.len().saturating_sub(1) / 2,
            significant_pairs: snapshot.matrix.len(),
            positive_pairs: snapshot.matrix.values().filter(|r| **r > 0.0).count(),
            negative_pairs: snapshot.matrix.values().filter(|r| **r < 0.0).count(),
            high_confidence_pairs: snapshot
                .matrix
                .values()
                .filter(|r| r.abs() >= self.config.high_confidence_threshold)
                .count(),
            clusters: snapshot.clusters.len(),
            duration: started.elapsed(),
            completed_at: Utc::now(),
        };
        snapshot.summary = Some(summary.clone());
        *self.snapshot.write() = Arc::new(snapshot);

        info!(
            analysed = summary.symbols_analysed,
            failed = summary.symbols_failed,
            insufficient = summary.symbols_insufficient,
            significant = summary.significant_pairs,
            clusters = summary.clusters,
            duration = ?summary.duration,
            "CorrelationEngine analysis complete"
        );
        summary
    }

    /// [`CorrelationEngine::analyze`] over every `TRADING` symbol of the venue.
    pub async fn analyze_tradable(&self) -> Result<AnalysisSummary, CacheError> {
        let info = self.cache.exchange_info(false).await?;
        let universe = info
            .symbols
            .iter()
            .filter(|symbol| symbol.is_trading())
            .map(|symbol| symbol.symbol.clone())
            .sorted()
            .collect::<Vec<_>>();

        Ok(self.analyze(universe).await)
    }

    /// Retained correlation of `a` and `b`, in either order.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        self.snapshot.read().matrix.get(&PairKey::new(a, b)).copied()
    }

    /// Strongest positive correlations of `symbol`, descending.
    pub fn top_correlations(&self, symbol: &str, limit: usize) -> Vec<PeerCorrelation> {
        self.peers(symbol, limit, |peer| peer.coefficient > 0.0, |a, b| {
            b.coefficient.total_cmp(&a.coefficient)
        })
    }

    /// Strongest negative correlations of `symbol`, most negative first.
    pub fn top_negative_correlations(&self, symbol: &str, limit: usize) -> Vec<PeerCorrelation> {
        self.peers(symbol, limit, |peer| peer.coefficient < 0.0, |a, b| {
            a.coefficient.total_cmp(&b.coefficient)
        })
    }

    /// Retained pairs with `|r| >= threshold`, strongest first.
    pub fn correlations_above(&self, threshold: f64, limit: usize) -> Vec<Correlation> {
        self.snapshot
            .read()
            .matrix
            .iter()
            .filter(|(_, coefficient)| coefficient.abs() >= threshold)
            .map(|(pair, coefficient)| Correlation {
                pair: pair.clone(),
                coefficient: *coefficient,
            })
            .sorted_by(|a, b| {
                b.coefficient
                    .abs()
                    .total_cmp(&a.coefficient.abs())
                    .then_with(|| a.pair.cmp(&b.pair))
            })
            .take(limit)
            .collect()
    }

    /// Pairs at or above the high confidence threshold, strongest first.
    pub fn high_confidence_pairs(&self, limit: usize) -> Vec<Correlation> {
        self.correlations_above(self.config.high_confidence_threshold, limit)
    }

    /// Clusters with at least `min_size` members, in discovery order.
    pub fn clusters(&self, min_size: usize) -> Vec<Cluster> {
        self.snapshot
            .read()
            .clusters
            .iter()
            .filter(|symbols| symbols.len() >= min_size)
            .enumerate()
            .map(|(index, symbols)| Cluster {
                id: index + 1,
                symbols: symbols.clone(),
            })
            .collect()
    }

    pub fn largest_cluster(&self) -> Option<Cluster> {
        self.clusters(0)
            .into_iter()
            .rev()
            .max_by_key(|cluster| cluster.size())
    }

    pub fn insights(&self) -> CorrelationInsights {
        CorrelationInsights {
            strongest: self.correlations_above(0.9, 5),
            high_confidence: self.high_confidence_pairs(5),
            clusters: self.clusters(self.config.min_cluster_size),
            summary: self.last_summary(),
        }
    }

    pub fn last_summary(&self) -> Option<AnalysisSummary> {
        self.snapshot.read().summary.clone()
    }

    /// `true` once an analysis run has completed.
    pub fn is_ready(&self) -> bool {
        self.snapshot.read().summary.is_some()
    }

    fn peers<Keep, Order>(
        &self,
        symbol: &str,
        limit: usize,
        keep: Keep,
        order: Order,
    ) -> Vec<PeerCorrelation>
    where
        Keep: Fn(&PeerCorrelation) -> bool,
        Order: FnMut(&PeerCorrelation, &PeerCorrelation) -> std::cmp::Ordering,
    {
        let snapshot = self.snapshot.read().clone();
        let Some(peers) = snapshot.peers.get(&normalise_symbol(symbol)) else {
            return Vec::new();
        };

        let mut peers = peers.iter().filter(|peer| keep(peer)).cloned().collect::<Vec<_>>();
        peers.sort_by(order);
        peers.truncate(limit);
        peers
    }

    async fn fetch_closes(&self, universe: &[SmolStr]) -> Fetched {
        let mut fetched = Fetched::default();

        for batch in universe.chunks(self.config.fetch_batch.max(1)) {
            let results = join_all(batch.iter().map(|symbol| {
                self.cache.klines(
                    symbol,
                    self.config.interval,
                    self.config.kline_limit,
                    self.config.kline_max_age,
                    false,
                )
            }))
            .await;

            for (symbol, result) in batch.iter().zip(results) {
                let candles = match result {
                    Ok(candles) => candles,
                    Err(error) => {
                        debug!(%symbol, %error, "CorrelationEngine skipping symbol");
                        fetched.failed += 1;
                        continue;
                    }
                };

                let closes = candles
                    .iter()
                    .rev()
                    .take(self.config.window)
                    .map(|candle| candle.close)
                    .collect::<Vec<_>>();

                if closes.len() < self.config.min_points
                    || closes.iter().any(|close| !close.is_finite())
                {
                    debug!(%symbol, closes = closes.len(), "CorrelationEngine insufficient closes");
                    fetched.insufficient += 1;
                    continue;
                }

                fetched
                    .series
                    .insert(symbol.clone(), closes.into_iter().rev().collect());
            }
        }

        fetched
    }
}

fn correlate(series: &BTreeMap<SmolStr, Vec<f64>>, config: &CorrelationConfig) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let mut graph = BTreeMap::<SmolStr, Vec<(SmolStr, f64)>>::new();

    for ((a, closes_a), (b, closes_b)) in series.iter().tuple_combinations() {
        let coefficient = pearson(closes_a, closes_b, config.window);
        if coefficient.abs() < config.significant_threshold {
            continue;
        }

        snapshot.matrix.insert(PairKey::new(a, b), coefficient);
        for (symbol, peer) in [(a, b), (b, a)] {
            snapshot
                .peers
                .entry(symbol.clone())
                .or_default()
                .push(PeerCorrelation {
                    symbol: peer.clone(),
                    coefficient,
                });
            graph
                .entry(symbol.clone())
                .or_default()
                .push((peer.clone(), coefficient.abs()));
        }
    }

    snapshot.clusters = find_clusters(&graph, config.significant_threshold)
        .into_iter()
        .filter(|cluster| cluster.len() >= config.min_cluster_size)
        .collect();
    snapshot
}

/// Connected components of `graph`, following only edges with weight at or above `threshold`.
fn find_clusters(
    graph: &BTreeMap<SmolStr, Vec<(SmolStr, f64)>>,
    threshold: f64,
) -> Vec<Vec<SmolStr>> {
    let mut visited = HashSet::new();
    let mut clusters = Vec::new();

    for start in graph.keys() {
        if !visited.insert(start.clone()) {
            continue;
        }

        let mut cluster = Vec::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(symbol) = queue.pop_front() {
            for (neighbour, weight) in graph.get(&symbol).into_iter().flatten() {
                if *weight >= threshold && visited.insert(neighbour.clone()) {
                    queue.push_back(neighbour.clone());
                }
            }
            cluster.push(symbol);
        }

        clusters.push(cluster);
    }

    clusters
}
