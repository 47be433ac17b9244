use crate::error::ConnectorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

/// Upstream venue primitives consumed by the [`DataCache`](crate::cache::DataCache).
///
/// Implementations are expected to carry their own transport timeouts. The cache additionally
/// bounds every call with its configured upstream timeout.
#[async_trait]
pub trait MarketConnector: Send + Sync {
    /// Fetch venue metadata (tradable symbols and their order filters).
    async fn exchange_info(&self) -> Result<ExchangeInfo, ConnectorError>;

    /// Fetch the latest traded price for `symbol`.
    async fn price(&self, symbol: &str) -> Result<f64, ConnectorError>;

    /// Fetch account balances for every asset the venue reports.
    async fn balances(&self) -> Result<Vec<Balance>, ConnectorError>;

    /// Fetch up to `limit` historical candles for `symbol`, oldest first.
    async fn klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u16,
    ) -> Result<Vec<Candle>, ConnectorError>;

    /// Optional push stream of ticker and balance updates.
    fn updates(&self) -> Option<BoxStream<'static, MarketUpdate>> {
        None
    }
}

/// Push update emitted by a [`MarketConnector`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum MarketUpdate {
    Ticker { symbol: SmolStr, price: f64 },
    Balance(Balance),
}

/// Free and locked amount of a single asset.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Balance {
    pub asset: SmolStr,
    #[serde(deserialize_with = "de_str_or_f64")]
    pub free: f64,
    #[serde(deserialize_with = "de_str_or_f64")]
    pub locked: f64,
}

impl Balance {
    pub fn new(asset: impl AsRef<str>, free: f64, locked: f64) -> Self {
        Self {
            asset: normalise_symbol(asset.as_ref()),
            free,
            locked,
        }
    }

    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Normalised OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: DateTime<Utc>,
}

/// Candle interval in venue notation.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Display, Deserialize, Serialize,
)]
pub enum KlineInterval {
    #[display("1m")]
    #[serde(rename = "1m")]
    Minute1,
    #[display("3m")]
    #[serde(rename = "3m")]
    Minute3,
    #[default]
    #[display("5m")]
    #[serde(rename = "5m")]
    Minute5,
    #[display("15m")]
    #[serde(rename = "15m")]
    Minute15,
    #[display("30m")]
    #[serde(rename = "30m")]
    Minute30,
    #[display("1h")]
    #[serde(rename = "1h")]
    Hour1,
    #[display("2h")]
    #[serde(rename = "2h")]
    Hour2,
    #[display("4h")]
    #[serde(rename = "4h")]
    Hour4,
    #[display("6h")]
    #[serde(rename = "6h")]
    Hour6,
    #[display("8h")]
    #[serde(rename = "8h")]
    Hour8,
    #[display("12h")]
    #[serde(rename = "12h")]
    Hour12,
    #[display("1d")]
    #[serde(rename = "1d")]
    Day1,
    #[display("3d")]
    #[serde(rename = "3d")]
    Day3,
    #[display("1w")]
    #[serde(rename = "1w")]
    Week1,
    #[display("1M")]
    #[serde(rename = "1M")]
    Month1,
}

/// Venue metadata.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub server_time: Option<i64>,
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

impl ExchangeInfo {
    /// Find the [`SymbolInfo`] for `symbol`, case-insensitively.
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols
            .iter()
            .find(|info| info.symbol.eq_ignore_ascii_case(symbol))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: SmolStr,
    #[serde(default)]
    pub status: SmolStr,
    #[serde(default)]
    pub base_asset: SmolStr,
    #[serde(default)]
    pub quote_asset: SmolStr,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status.eq_ignore_ascii_case("TRADING")
    }

    /// Collect the recognised order filters for this symbol.
    pub fn filters(&self) -> SymbolFilters {
        self.filters
            .iter()
            .fold(SymbolFilters::default(), |mut filters, filter| {
                match filter {
                    SymbolFilter::PriceFilter { .. } => filters.price_filter = Some(filter.clone()),
                    SymbolFilter::LotSize { .. } => filters.lot_size = Some(filter.clone()),
                    SymbolFilter::MarketLotSize { .. } => {
                        filters.market_lot_size = Some(filter.clone())
                    }
                    SymbolFilter::MinNotional { .. } => filters.min_notional = Some(filter.clone()),
                    SymbolFilter::Other => {}
                }
                filters
            })
    }
}

/// Order filter attached to a [`SymbolInfo`].
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/filters>
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "filterType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolFilter {
    #[serde(rename_all = "camelCase")]
    PriceFilter {
        #[serde(deserialize_with = "de_str_or_f64")]
        min_price: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        max_price: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        tick_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    LotSize {
        #[serde(deserialize_with = "de_str_or_f64")]
        min_qty: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        max_qty: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        step_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    MarketLotSize {
        #[serde(deserialize_with = "de_str_or_f64")]
        min_qty: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        max_qty: f64,
        #[serde(deserialize_with = "de_str_or_f64")]
        step_size: f64,
    },
    #[serde(rename_all = "camelCase")]
    MinNotional {
        #[serde(deserialize_with = "de_str_or_f64")]
        min_notional: f64,
    },
    #[serde(other)]
    Other,
}

/// The order filters of one symbol that callers typically need when sizing orders.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SymbolFilters {
    pub price_filter: Option<SymbolFilter>,
    pub lot_size: Option<SymbolFilter>,
    pub market_lot_size: Option<SymbolFilter>,
    pub min_notional: Option<SymbolFilter>,
}

/// Upper-case and trim a symbol or asset name.
pub fn normalise_symbol(symbol: &str) -> SmolStr {
    SmolStr::new(symbol.trim().to_ascii_uppercase())
}

/// Deserialise a venue number that may be encoded either as a JSON string or a JSON number.
pub fn de_str_or_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrF64 {
        Str(String),
        Number(f64),
    }

    match StrOrF64::deserialize(deserializer)? {
        StrOrF64::Str(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
        StrOrF64::Number(value) => Ok(value),
    }
}
