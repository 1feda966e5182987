use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use crate::data::series::{HistoryPoint, RawFields};
use crate::error::FetchError;

/// Upstream price feed. Implementations only perform the network call and
/// never touch the series store.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_current(&self, ids: &[String]) -> Result<HashMap<String, RawFields>, FetchError>;

    async fn fetch_history(&self, id: &str, days: u32) -> Result<Vec<HistoryPoint>, FetchError>;
}

pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    vs_currency: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: &str, vs_currency: &str, timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            vs_currency: vs_currency.to_lowercase(),
        })
    }

    fn quote_currencies(&self) -> String {
        if self.vs_currency == "eur" {
            "eur".to_string()
        } else {
            format!("{},eur", self.vs_currency)
        }
    }

    pub fn current_url(&self, ids: &[String]) -> String {
        let ids = ids
            .iter()
            .map(|id| urlencoding::encode(id).into_owned())
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}/simple/price?ids={}&vs_currencies={}&include_24hr_change=true&include_24hr_vol=true&include_market_cap=true",
            self.base_url,
            ids,
            self.quote_currencies()
        )
    }

    pub fn history_url(&self, id: &str, days: u32) -> String {
        format!(
            "{}/coins/{}/market_chart?vs_currency={}&days={}&interval=daily",
            self.base_url,
            urlencoding::encode(id),
            self.vs_currency,
            days
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        debug!("GET {}", url);
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))
    }
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    async fn fetch_current(&self, ids: &[String]) -> Result<HashMap<String, RawFields>, FetchError> {
        let body = self.get_json(&self.current_url(ids)).await?;
        parse_current(body)
    }

    async fn fetch_history(&self, id: &str, days: u32) -> Result<Vec<HistoryPoint>, FetchError> {
        let body = self.get_json(&self.history_url(id, days)).await?;
        parse_history(body)
    }
}

/// `{"bitcoin": {"usd": 1.0, ...}, ...}`. Entries that are not objects are skipped.
pub fn parse_current(body: Value) -> Result<HashMap<String, RawFields>, FetchError> {
    let Value::Object(entries) = body else {
        return Err(FetchError::Parse("expected a JSON object of assets".to_string()));
    };

    let mut records = HashMap::with_capacity(entries.len());
    for (id, value) in entries {
        match value {
            Value::Object(fields) => {
                records.insert(id, fields);
            }
            other => warn!("Skipping malformed price entry for {}: {}", id, other),
        }
    }

    Ok(records)
}

/// `{"prices": [[timestamp_ms, price], ...], ...}`. A missing `prices` key
/// yields an empty history; malformed pairs are skipped.
pub fn parse_history(body: Value) -> Result<Vec<HistoryPoint>, FetchError> {
    let Value::Object(mut chart) = body else {
        return Err(FetchError::Parse("expected a JSON object with a prices array".to_string()));
    };

    let Some(Value::Array(pairs)) = chart.remove("prices") else {
        return Ok(Vec::new());
    };

    let points = pairs
        .iter()
        .filter_map(|pair| {
            let pair = pair.as_array()?;
            let timestamp_ms = pair.first()?.as_f64()? as i64;
            let price = pair.get(1)?.as_f64()?;
            Some(HistoryPoint { timestamp_ms, price })
        })
        .collect();

    Ok(points)
}
