//! [`MarketConnector`] for the Binance spot REST API.
//!
//! See docs: <https://developers.binance.com/docs/binance-spot-api-docs/rest-api>

use crate::{
    config::{env_millis_or, env_or},
    connector::{
        Balance, Candle, ExchangeInfo, KlineInterval, MarketConnector, de_str_or_f64,
    },
    error::ConnectorError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize, de::DeserializeOwned, de::IgnoredAny};
use sha2::Sha256;
use std::{fmt, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// Binance spot REST base url.
pub const BASE_URL_BINANCE_SPOT: &str = "https://api.binance.com";

/// Header carrying the API key on signed requests.
const HEADER_API_KEY: &str = "X-MBX-APIKEY";

type HmacSha256 = Hmac<Sha256>;

/// [`BinanceConnector`] configuration.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Validity window of signed requests, sent as `recvWindow`.
    pub recv_window: Duration,
    /// Transport timeout of every request.
    pub request_timeout: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: BASE_URL_BINANCE_SPOT.to_string(),
            api_key: None,
            api_secret: None,
            recv_window: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for BinanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .field("recv_window", &self.recv_window)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl BinanceConfig {
    /// Read `BINANCE_API_KEY`, `BINANCE_API_SECRET`, `BINANCE_BASE_URL`,
    /// `BINANCE_RECV_WINDOW_MS` and `BINANCE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let default = Self::default();
        let non_empty = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            base_url: env_or("BINANCE_BASE_URL", default.base_url),
            api_key: non_empty("BINANCE_API_KEY"),
            api_secret: non_empty("BINANCE_API_SECRET"),
            recv_window: env_millis_or("BINANCE_RECV_WINDOW_MS", default.recv_window),
            request_timeout: env_millis_or("BINANCE_TIMEOUT_MS", default.request_timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_credentials(
        mut self,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        self.api_key = Some(api_key.into());
        self.api_secret = Some(api_secret.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

/// Binance spot REST [`MarketConnector`].
#[derive(Debug, Clone)]
pub struct BinanceConnector {
    config: BinanceConfig,
    http: reqwest::Client,
}

impl BinanceConnector {
    pub fn new(config: BinanceConfig) -> Result<Self, ConnectorError> {
        Url::parse(&config.base_url)
            .map_err(|error| ConnectorError::Http(format!("invalid base url: {error}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        debug!(
            base_url = %config.base_url,
            authenticated = config.has_credentials(),
            "BinanceConnector initialised"
        );
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, ConnectorError> {
        Self::new(BinanceConfig::from_env())
    }

    pub fn config(&self) -> &BinanceConfig {
        &self.config
    }

    fn url(&self, path: &str, query: &str) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&self.config.base_url)
            .and_then(|base| base.join(path))
            .map_err(|error| ConnectorError::Http(format!("invalid url {path}: {error}")))?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    async fn get<T, Params>(&self, path: &str, params: &Params) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
        Params: Serialize + ?Sized,
    {
        let url = self.url(path, &encode(params)?)?;
        self.send(self.http.get(url)).await
    }

    async fn get_signed<T>(
        &self,
        path: &str,
        operation: &'static str,
    ) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
    {
        let (Some(api_key), Some(api_secret)) = (&self.config.api_key, &self.config.api_secret)
        else {
            return Err(ConnectorError::Credentials(operation));
        };

        let query = encode(&[
            ("recvWindow", self.config.recv_window.as_millis().to_string()),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ])?;
        let signature = sign(api_secret, &query)?;
        let url = self.url(path, &format!("{query}&signature={signature}"))?;

        self.send(self.http.get(url).header(HEADER_API_KEY, api_key))
            .await
    }

    async fn send<T>(&self, request: reqwest::RequestBuilder) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<BinanceErrorBody>(&body)
                .map(|error| format!("{} (code {})", error.msg, error.code))
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

            warn!(status = status.as_u16(), %message, "BinanceConnector request rejected");
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&body).map_err(ConnectorError::from)
    }
}

#[async_trait]
impl MarketConnector for BinanceConnector {
    async fn exchange_info(&self) -> Result<ExchangeInfo, ConnectorError> {
        self.get("/api/v3/exchangeInfo", &[] as &[(&str, &str)]).await
    }

    async fn price(&self, symbol: &str) -> Result<f64, ConnectorError> {
        self.get::<BinanceTickerPrice, _>("/api/v3/ticker/price", &[("symbol", symbol)])
            .await
            .map(|ticker| ticker.price)
    }

    async fn balances(&self) -> Result<Vec<Balance>, ConnectorError> {
        self.get_signed::<BinanceAccount>("/api/v3/account", "balances")
            .await
            .map(|account| account.balances)
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u16,
    ) -> Result<Vec<Candle>, ConnectorError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        self.get::<Vec<BinanceKline>, _>("/api/v3/klines", &params)
            .await?
            .into_iter()
            .map(Candle::try_from)
            .collect()
    }
}

fn encode<Params>(params: &Params) -> Result<String, ConnectorError>
where
    Params: Serialize + ?Sized,
{
    serde_urlencoded::to_string(params)
        .map_err(|error| ConnectorError::Http(format!("failed to encode query: {error}")))
}

/// Hex encoded HMAC-SHA256 of `query` keyed by `secret`.
fn sign(secret: &str, query: &str) -> Result<String, ConnectorError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ConnectorError::Credentials("valid api secret"))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

/// ### Raw Payload Examples
/// ```json
/// {"symbol":"BTCUSDT","price":"67123.45000000"}
/// ```
#[derive(Debug, Deserialize)]
struct BinanceTickerPrice {
    #[serde(deserialize_with = "de_str_or_f64")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    #[serde(default)]
    balances: Vec<Balance>,
}

/// ### Raw Payload Examples
/// ```json
/// [
///   1499040000000, "0.01634790", "0.80000000", "0.01575800", "0.01577100", "148976.11427815",
///   1499644799999, "2434.19055334", 308, "1756.87402397", "28.46694368", "0"
/// ]
/// ```
#[derive(Debug, Deserialize)]
struct BinanceKline(
    i64,
    #[serde(deserialize_with = "de_str_or_f64")] f64,
    #[serde(deserialize_with = "de_str_or_f64")] f64,
    #[serde(deserialize_with = "de_str_or_f64")] f64,
    #[serde(deserialize_with = "de_str_or_f64")] f64,
    #[serde(deserialize_with = "de_str_or_f64")] f64,
    i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

impl TryFrom<BinanceKline> for Candle {
    type Error = ConnectorError;

    fn try_from(kline: BinanceKline) -> Result<Self, Self::Error> {
        let time = |millis: i64| {
            DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                ConnectorError::Deserialise(format!("kline timestamp out of range: {millis}"))
            })
        };

        Ok(Candle {
            open_time: time(kline.0)?,
            open: kline.1,
            high: kline.2,
            low: kline.3,
            close: kline.4,
            volume: kline.5,
            close_time: time(kline.6)?,
        })
    }
}
