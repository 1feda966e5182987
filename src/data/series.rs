use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SerializationError, StoreError};

/// Raw per-asset fields exactly as returned by the price feed.
pub type RawFields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetStats {
    pub year_change: f64,
    pub year_high: f64,
    pub year_low: f64,
    pub market_cap: Option<f64>,
}

impl AssetStats {
    /// Derives stats from the first historical point as the year-ago reference.
    /// With no history the current price stands in for reference, high and low.
    pub fn compute(historical: &[HistoryPoint], price: f64, market_cap: Option<f64>) -> Self {
        let (reference, year_high, year_low) = match historical.first() {
            Some(first) => historical.iter().fold(
                (first.price, first.price, first.price),
                |(reference, high, low), point| (reference, high.max(point.price), low.min(point.price)),
            ),
            None => (price, price, price),
        };

        let year_change = if reference != 0.0 {
            (price - reference) / reference * 100.0
        } else {
            0.0
        };

        Self {
            year_change,
            year_high,
            year_low,
            market_cap,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AssetSeries {
    current: RawFields,
    recent: VecDeque<(f64, DateTime<Utc>)>,
    historical: Vec<HistoryPoint>,
    stats: AssetStats,
}

impl AssetSeries {
    fn view(&self, max_recent: usize) -> AssetView {
        let skip = self.recent.len().saturating_sub(max_recent);
        let (prices, timestamps) = self.recent.iter().skip(skip).copied().unzip();

        AssetView {
            current: self.current.clone(),
            stats: self.stats,
            prices,
            timestamps,
            historical_prices: self.historical.iter().map(|p| p.price).collect(),
            historical_timestamps: self.historical.iter().map(|p| p.timestamp_ms).collect(),
        }
    }
}

/// Self-contained copy of one asset, as pushed to viewers and returned by the query API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetView {
    pub current: RawFields,
    pub stats: AssetStats,
    pub prices: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub historical_prices: Vec<f64>,
    pub historical_timestamps: Vec<i64>,
}

/// Immutable copy of every tracked asset at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub data: BTreeMap<String, AssetView>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct SnapshotEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a BTreeMap<String, AssetView>,
    timestamp: &'a DateTime<Utc>,
}

impl Snapshot {
    pub const MESSAGE_TYPE: &'static str = "crypto_update";

    pub fn to_json(&self) -> Result<String, SerializationError> {
        let envelope = SnapshotEnvelope {
            kind: Self::MESSAGE_TYPE,
            data: &self.data,
            timestamp: &self.timestamp,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn asset_count(&self) -> usize {
        self.data.len()
    }
}

/// Per-asset rolling price series. Written only by the update cycle; read by
/// the broadcaster, new connections and the query API.
pub struct SeriesStore {
    assets: RwLock<HashMap<String, AssetSeries>>,
    capacity: usize,
    price_field: String,
}

impl SeriesStore {
    pub fn new(capacity: usize, vs_currency: &str) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            price_field: vs_currency.to_lowercase(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AssetSeries>> {
        self.assets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AssetSeries>> {
        self.assets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the year-long history for `id`. Accepted only while the asset has
    /// no history yet, so repeated warm-ups never duplicate points.
    pub fn ingest_history(&self, id: &str, points: Vec<HistoryPoint>) -> bool {
        if points.is_empty() {
            debug!("Empty history for {}, nothing to load", id);
            return false;
        }

        let mut assets = self.write();
        let series = assets.entry(id.to_string()).or_default();

        if !series.historical.is_empty() {
            debug!("History for {} already loaded, ignoring {} points", id, points.len());
            return false;
        }

        info!("Loaded {} historical points for {}", points.len(), id);
        series.historical = points;
        true
    }

    pub fn ingest_current(&self, id: &str, fields: RawFields) {
        self.ingest_current_at(id, fields, Utc::now());
    }

    pub fn ingest_current_at(&self, id: &str, fields: RawFields, at: DateTime<Utc>) {
        let price = fields
            .get(&self.price_field)
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let market_cap = fields
            .get(&format!("{}_market_cap", self.price_field))
            .and_then(Value::as_f64);

        let mut assets = self.write();
        let series = assets.entry(id.to_string()).or_default();

        series.recent.push_back((price, at));
        while series.recent.len() > self.capacity {
            series.recent.pop_front();
        }

        series.stats = AssetStats::compute(&series.historical, price, market_cap);
        series.current = fields;
    }

    pub fn snapshot(&self, max_recent: usize) -> Snapshot {
        let assets = self.read();
        let data = assets
            .iter()
            .map(|(id, series)| (id.clone(), series.view(max_recent)))
            .collect();

        Snapshot {
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn get_asset(&self, id: &str) -> Result<AssetView, StoreError> {
        self.read()
            .get(id)
            .map(|series| series.view(self.capacity))
            .ok_or_else(|| StoreError::UnknownAsset(id.to_string()))
    }

    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
