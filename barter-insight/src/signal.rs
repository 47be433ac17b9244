//! Priority, de-duplicating queue of trading [`Signal`]s.
//!
//! Any number of producers [`SignalBus::publish`] while a single consumer drains the queue with
//! [`SignalBus::next_batch`]. The bus holds at most one [`Signal`] per [`SignalKey`]; a newer
//! publish for an occupied key only replaces the queued signal if it ranks strictly higher.

use crate::{config::env_or, connector::normalise_symbol};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default `limit` of a [`SignalFilter`].
pub const DEFAULT_PEEK_LIMIT: usize = 10;

/// Upper bound on a [`SignalFilter`] `limit`.
pub const MAX_PEEK_LIMIT: usize = 100;

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[display("long")]
    Long,
    #[display("short")]
    Short,
    #[default]
    #[display("neutral")]
    Neutral,
}

/// Trading opportunity published by a producer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Signal {
    pub symbol: SmolStr,
    pub timeframe: Option<SmolStr>,
    pub direction: Direction,
    pub potential_profit: Option<f64>,
    pub confidence: Option<f64>,
    pub composite_score: Option<f64>,
    pub category: Option<SmolStr>,
    /// Stamped by [`SignalBus::publish`].
    pub source: SmolStr,
    /// Stamped by [`SignalBus::publish`] and refreshed by [`SignalBus::requeue`].
    pub published_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: impl AsRef<str>, direction: Direction) -> Self {
        Self {
            symbol: SmolStr::new(symbol.as_ref()),
            timeframe: None,
            direction,
            potential_profit: None,
            confidence: None,
            composite_score: None,
            category: None,
            source: SmolStr::new_static("unknown"),
            published_at: Utc::now(),
        }
    }

    pub fn with_timeframe(mut self, timeframe: impl AsRef<str>) -> Self {
        self.timeframe = Some(SmolStr::new(timeframe.as_ref()));
        self
    }

    pub fn with_potential_profit(mut self, potential_profit: f64) -> Self {
        self.potential_profit = Some(potential_profit);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_composite_score(mut self, composite_score: f64) -> Self {
        self.composite_score = Some(composite_score);
        self
    }

    pub fn with_category(mut self, category: impl AsRef<str>) -> Self {
        self.category = Some(SmolStr::new(category.as_ref()));
        self
    }

    /// De-duplication key of this signal.
    pub fn key(&self) -> SignalKey {
        SignalKey::new(&self.symbol, self.timeframe.as_deref())
    }

    /// Priority of this signal.
    ///
    /// The first finite metric of [`SCORE_STRATEGIES`] wins. Signals without any metric fall back
    /// to a near-zero value derived from `published_at`, so they sort last but deterministically.
    pub fn score(&self) -> f64 {
        SCORE_STRATEGIES
            .iter()
            .find_map(|strategy| strategy(self).filter(|score| score.is_finite()))
            .unwrap_or_else(|| self.published_at.timestamp_millis() as f64 / 1e15)
    }

    /// Total ranking order, highest priority first.
    ///
    /// Higher score first, then the more recently published, then by key.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .score()
            .total_cmp(&self.score())
            .then_with(|| other.published_at.cmp(&self.published_at))
            .then_with(|| self.key().cmp(&other.key()))
    }

    fn outranks(&self, queued: &Self) -> bool {
        match self.score().total_cmp(&queued.score()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.published_at > queued.published_at,
        }
    }

    fn boost(&mut self, boost: f64) {
        if let Some(score) = self.composite_score.filter(|score| score.is_finite()) {
            self.composite_score = Some((score + boost).clamp(0.0, 1.0));
        } else if let Some(profit) = self.potential_profit.filter(|profit| profit.is_finite()) {
            self.potential_profit = Some(profit * (1.0 + boost));
        } else if let Some(confidence) = self.confidence.filter(|confidence| confidence.is_finite())
        {
            self.confidence = Some((confidence + boost).clamp(0.0, 1.0));
        }
        self.published_at = Utc::now();
    }
}

type ScoreStrategy = fn(&Signal) -> Option<f64>;

fn composite_score(signal: &Signal) -> Option<f64> {
    signal.composite_score
}

fn potential_profit(signal: &Signal) -> Option<f64> {
    signal.potential_profit
}

fn confidence(signal: &Signal) -> Option<f64> {
    signal.confidence
}

/// Metrics consulted, in order, by [`Signal::score`].
pub const SCORE_STRATEGIES: [ScoreStrategy; 3] = [composite_score, potential_profit, confidence];

/// `SYMBOL` or `SYMBOL:timeframe`, eg/ "BTCUSDT:5m".
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize)]
pub struct SignalKey(SmolStr);

impl SignalKey {
    pub fn new(symbol: &str, timeframe: Option<&str>) -> Self {
        let symbol = normalise_symbol(symbol);
        match timeframe.map(str::trim).filter(|timeframe| !timeframe.is_empty()) {
            Some(timeframe) => Self(SmolStr::new(format!(
                "{symbol}:{}",
                timeframe.to_ascii_lowercase()
            ))),
            None => Self(symbol),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of [`SignalBus::publish`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum PublishOutcome {
    /// No signal was queued for the key.
    Queued,
    /// The queued signal for the key was outranked and replaced.
    Replaced,
    /// The queued signal for the key ranks at least as high, the new one was dropped.
    Dropped,
    /// The signal has no symbol.
    Invalid,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Queued | Self::Replaced)
    }
}

/// Notification emitted by the [`SignalBus`].
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Published(Signal),
    Consumed(Vec<Signal>),
    Discarded(SignalKey),
    Cleared { removed: usize },
}

/// Non-destructive query used by [`SignalBus::peek_filtered`].
///
/// Symbol matching is case-insensitive, as is category and source matching.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct SignalFilter {
    pub symbol: Option<SmolStr>,
    pub category: Option<SmolStr>,
    pub source: Option<SmolStr>,
    pub offset: usize,
    /// Clamped to `1..=100`, defaults to 10.
    pub limit: Option<usize>,
}

impl SignalFilter {
    pub fn with_symbol(mut self, symbol: impl AsRef<str>) -> Self {
        self.symbol = Some(SmolStr::new(symbol.as_ref()));
        self
    }

    pub fn with_category(mut self, category: impl AsRef<str>) -> Self {
        self.category = Some(SmolStr::new(category.as_ref()));
        self
    }

    pub fn with_source(mut self, source: impl AsRef<str>) -> Self {
        self.source = Some(SmolStr::new(source.as_ref()));
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PEEK_LIMIT)
            .clamp(1, MAX_PEEK_LIMIT)
    }

    fn matches(&self, signal: &Signal) -> bool {
        fn eq(filter: &Option<SmolStr>, value: Option<&str>) -> bool {
            match filter {
                Some(filter) => {
                    value.is_some_and(|value| value.trim().eq_ignore_ascii_case(filter.trim()))
                }
                None => true,
            }
        }

        eq(&self.symbol, Some(signal.symbol.as_str()))
            && eq(&self.category, signal.category.as_deref())
            && eq(&self.source, Some(signal.source.as_str()))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct SignalStats {
    pub published: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub queued: usize,
}

/// [`SignalBus`] configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SignalBusConfig {
    /// Capacity of the [`SignalEvent`] broadcast channel.
    pub event_buffer: usize,
    /// Number of discarded signals remembered for [`SignalBus::requeue`].
    pub discard_retention: usize,
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            discard_retention: 256,
        }
    }
}

impl SignalBusConfig {
    /// Read `SIGNAL_EVENT_BUFFER` and `SIGNAL_DISCARD_RETENTION`.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            event_buffer: env_or("SIGNAL_EVENT_BUFFER", default.event_buffer),
            discard_retention: env_or("SIGNAL_DISCARD_RETENTION", default.discard_retention),
        }
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    pub fn with_discard_retention(mut self, discard_retention: usize) -> Self {
        self.discard_retention = discard_retention;
        self
    }
}

#[derive(Debug, Default)]
struct State {
    queue: FnvHashMap<SignalKey, Signal>,
    discarded: IndexMap<SignalKey, Signal>,
    published: u64,
    consumed: u64,
    dropped: u64,
}

impl State {
    fn ranked(&self) -> impl Iterator<Item = &Signal> {
        self.queue.values().sorted_by(|a, b| a.rank(b))
    }

    fn retain_discarded(&mut self, key: SignalKey, signal: Signal, retention: usize) {
        if retention == 0 {
            return;
        }
        self.discarded.shift_remove(&key);
        self.discarded.insert(key, signal);
        while self.discarded.len() > retention {
            self.discarded.shift_remove_index(0);
        }
    }
}

/// Shared priority queue of [`Signal`]s.
///
/// Every mutation is serialised behind a single lock. Construct one per process and share it
/// via `Arc`.
#[derive(Debug)]
pub struct SignalBus {
    config: SignalBusConfig,
    state: Mutex<State>,
    events: broadcast::Sender<SignalEvent>,
}

impl SignalBus {
    pub fn new(config: SignalBusConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Subscribe to [`SignalEvent`]s emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    /// Stamp `source` and `published_at` onto `signal` and queue it if its key is vacant or the
    /// queued signal is outranked.
    pub fn publish(&self, mut signal: Signal, source: &str) -> PublishOutcome {
        if signal.symbol.trim().is_empty() {
            debug!(?signal, "SignalBus rejected signal without symbol");
            return PublishOutcome::Invalid;
        }

        signal.symbol = normalise_symbol(&signal.symbol);
        signal.timeframe = signal
            .timeframe
            .as_deref()
            .map(str::trim)
            .filter(|timeframe| !timeframe.is_empty())
            .map(|timeframe| SmolStr::new(timeframe.to_ascii_lowercase()));
        signal.source = SmolStr::new(source);
        signal.published_at = Utc::now();

        let key = signal.key();
        let mut state = self.state.lock();

        let outcome = match state.queue.get(&key) {
            None => PublishOutcome::Queued,
            Some(queued) if signal.outranks(queued) => PublishOutcome::Replaced,
            Some(_) => {
                state.dropped += 1;
                trace!(%key, score = signal.score(), "SignalBus dropped outranked signal");
                return PublishOutcome::Dropped;
            }
        };

        state.published += 1;
        state.queue.insert(key.clone(), signal.clone());
        drop(state);

        debug!(%key, %outcome, score = signal.score(), source, "SignalBus published signal");
        let _ = self.events.send(SignalEvent::Published(signal));
        outcome
    }

    /// Remove and return up to `max` signals, highest priority first.
    pub fn next_batch(&self, max: usize) -> Vec<Signal> {
        let mut state = self.state.lock();
        let batch = state.ranked().take(max).cloned().collect::<Vec<_>>();
        for signal in &batch {
            state.queue.remove(&signal.key());
        }
        state.consumed += batch.len() as u64;
        drop(state);

        if !batch.is_empty() {
            debug!(consumed = batch.len(), "SignalBus consumed batch");
            let _ = self.events.send(SignalEvent::Consumed(batch.clone()));
        }
        batch
    }

    /// Up to `max` queued signals, highest priority first, without removing them.
    pub fn peek(&self, max: usize) -> Vec<Signal> {
        self.state.lock().ranked().take(max).cloned().collect()
    }

    /// One page of the queued signals matching `filter`, highest priority first.
    pub fn peek_filtered(&self, filter: &SignalFilter) -> Vec<Signal> {
        self.state
            .lock()
            .ranked()
            .filter(|signal| filter.matches(signal))
            .skip(filter.offset)
            .take(filter.limit())
            .cloned()
            .collect()
    }

    /// Remove the signal queued for `symbol` and `timeframe`. Returns `false` if none was queued.
    pub fn discard(&self, symbol: &str, timeframe: Option<&str>) -> bool {
        let key = SignalKey::new(symbol, timeframe);
        let mut state = self.state.lock();
        let Some(signal) = state.queue.remove(&key) else {
            return false;
        };
        state.retain_discarded(key.clone(), signal, self.config.discard_retention);
        drop(state);

        debug!(%key, "SignalBus discarded signal");
        let _ = self.events.send(SignalEvent::Discarded(key));
        true
    }

    /// Boost the queued or previously discarded signal for `symbol` and `timeframe` and publish
    /// it again with a refreshed `published_at`. Returns `false` if neither exists.
    pub fn requeue(&self, symbol: &str, timeframe: Option<&str>, boost: f64) -> bool {
        let key = SignalKey::new(symbol, timeframe);
        let boost = if boost.is_finite() { boost } else { 0.0 };

        let mut state = self.state.lock();
        let Some(mut signal) = state
            .queue
            .remove(&key)
            .or_else(|| state.discarded.shift_remove(&key))
        else {
            return false;
        };

        signal.boost(boost);
        state.queue.insert(key.clone(), signal.clone());
        drop(state);

        debug!(%key, boost, score = signal.score(), "SignalBus requeued signal");
        let _ = self.events.send(SignalEvent::Published(signal));
        true
    }

    /// Remove every queued signal, returning the number removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.queue.len();
            state.queue.clear();
            removed
        };

        debug!(removed, "SignalBus cleared");
        let _ = self.events.send(SignalEvent::Cleared { removed });
        removed
    }

    pub fn stats(&self) -> SignalStats {
        let state = self.state.lock();
        SignalStats {
            published: state.published,
            consumed: state.consumed,
            dropped: state.dropped,
            queued: state.queue.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(SignalBusConfig::default())
    }
}
