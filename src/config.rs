use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::{info, warn};

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:5000";

// Upstream Configuration
pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3";
pub const DEFAULT_TRACKED_ASSETS: &[&str] = &[
    "bitcoin", "ethereum", "binancecoin", "cardano", "solana", "dogecoin", "polygon",
];
pub const DEFAULT_VS_CURRENCY: &str = "usd";
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HISTORY_DAYS: u32 = 365;
pub const DEFAULT_HISTORY_PACING_MS: u64 = 1200;

// Series Configuration
pub const DEFAULT_RECENT_CAPACITY: usize = 100;
pub const DEFAULT_SNAPSHOT_RECENT_POINTS: usize = 100;

// Broadcast Configuration
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

// Wallet Configuration
pub const DEFAULT_ETH_RPC_URL: &str = "https://mainnet.infura.io/v3";
pub const DEFAULT_ETHERSCAN_API_URL: &str = "https://api.etherscan.io/api";
pub const DEFAULT_BINANCE_API_URL: &str = "https://api.binance.com";
pub const DEFAULT_BINANCE_TESTNET_URL: &str = "https://testnet.binance.vision";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub price_api_url: String,
    pub tracked_assets: Vec<String>,
    pub vs_currency: String,
    pub update_interval: Duration,
    pub history_days: u32,
    pub history_pacing: Duration,
    pub recent_capacity: usize,
    pub snapshot_recent_points: usize,
    pub subscriber_buffer: usize,
    pub fetch_timeout: Option<Duration>,
    pub eth_rpc_url: String,
    pub etherscan_api_url: String,
    pub infura_project_id: Option<String>,
    pub etherscan_api_key: Option<String>,
    pub binance_api_url: String,
    pub binance_testnet_url: String,
    pub log_level: String,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_assets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            price_api_url: DEFAULT_PRICE_API_URL.to_string(),
            tracked_assets: DEFAULT_TRACKED_ASSETS.iter().map(|s| s.to_string()).collect(),
            vs_currency: DEFAULT_VS_CURRENCY.to_string(),
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
            history_days: DEFAULT_HISTORY_DAYS,
            history_pacing: Duration::from_millis(DEFAULT_HISTORY_PACING_MS),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            snapshot_recent_points: DEFAULT_SNAPSHOT_RECENT_POINTS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            fetch_timeout: None,
            eth_rpc_url: DEFAULT_ETH_RPC_URL.to_string(),
            etherscan_api_url: DEFAULT_ETHERSCAN_API_URL.to_string(),
            infura_project_id: None,
            etherscan_api_key: None,
            binance_api_url: DEFAULT_BINANCE_API_URL.to_string(),
            binance_testnet_url: DEFAULT_BINANCE_TESTNET_URL.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or(defaults.bind_address),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or(defaults.api_bind_address),
            price_api_url: env::var("PRICE_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.price_api_url),
            tracked_assets: env::var("TRACKED_ASSETS")
                .map(|raw| parse_assets(&raw))
                .unwrap_or(defaults.tracked_assets),
            vs_currency: env::var("VS_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.vs_currency),
            update_interval: Duration::from_secs(
                parse_or("UPDATE_INTERVAL_SECS", DEFAULT_UPDATE_INTERVAL_SECS),
            ),
            history_days: parse_or("HISTORY_DAYS", DEFAULT_HISTORY_DAYS),
            history_pacing: Duration::from_millis(
                parse_or("HISTORY_PACING_MS", DEFAULT_HISTORY_PACING_MS),
            ),
            recent_capacity: parse_or("RECENT_CAPACITY", DEFAULT_RECENT_CAPACITY),
            snapshot_recent_points: parse_or("SNAPSHOT_RECENT_POINTS", DEFAULT_SNAPSHOT_RECENT_POINTS),
            subscriber_buffer: parse_or("SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER),
            fetch_timeout: env::var("FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            eth_rpc_url: env::var("ETH_RPC_URL")
                .unwrap_or(defaults.eth_rpc_url),
            etherscan_api_url: env::var("ETHERSCAN_API_URL")
                .unwrap_or(defaults.etherscan_api_url),
            infura_project_id: env::var("INFURA_PROJECT_ID").ok(),
            etherscan_api_key: env::var("ETHERSCAN_API_KEY").ok(),
            binance_api_url: env::var("BINANCE_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.binance_api_url),
            binance_testnet_url: env::var("BINANCE_TESTNET_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.binance_testnet_url),
            log_level: env::var("RUST_LOG")
                .unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tracked_assets.is_empty() {
            return Err("TRACKED_ASSETS must name at least one asset".to_string());
        }

        if self.update_interval.is_zero() {
            return Err("UPDATE_INTERVAL_SECS must be greater than 0".to_string());
        }

        if self.recent_capacity == 0 {
            return Err("RECENT_CAPACITY must be greater than 0".to_string());
        }

        if self.subscriber_buffer == 0 {
            return Err("SUBSCRIBER_BUFFER must be greater than 0".to_string());
        }

        if self.snapshot_recent_points > self.recent_capacity {
            warn!(
                "SNAPSHOT_RECENT_POINTS ({}) exceeds RECENT_CAPACITY ({}); snapshots carry at most {} points",
                self.snapshot_recent_points, self.recent_capacity, self.recent_capacity
            );
        }

        if self.fetch_timeout.is_none() {
            warn!("FETCH_TIMEOUT_SECS not set, upstream requests wait indefinitely");
        }

        Ok(())
    }

    pub fn log_config(&self) {
        info!("Server Configuration:");
        info!("  WebSocket Address: {}", self.bind_address);
        info!("  API Address: {}", self.api_bind_address);
        info!("  Price API: {}", self.price_api_url);
        info!("  Assets: {}", self.tracked_assets.join(","));
        info!("  Quote Currency: {}", self.vs_currency);
        info!("  Update Interval: {:?}", self.update_interval);
        info!("  History: {} days, pacing {:?}", self.history_days, self.history_pacing);
        info!("  Rolling Window: {} points", self.recent_capacity);
        info!("  Binance API: {} (testnet {})", self.binance_api_url, self.binance_testnet_url);
        info!("  Log Level: {}", self.log_level);
    }
}
