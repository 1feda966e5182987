use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::Config;
use crate::error::{FetchError, WalletError};

type HmacSha256 = Hmac<Sha256>;

const WEI_PER_ETH: f64 = 1e18;
const BINANCE_ACCOUNT_PATH: &str = "/api/v3/account";
const BINANCE_API_KEY_HEADER: &str = "X-MBX-APIKEY";
pub const DEFAULT_TRANSACTION_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletType {
    #[serde(rename = "binance")]
    Binance,
    #[serde(rename = "metamask")]
    Metamask,
    #[serde(rename = "trust_wallet")]
    TrustWallet,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::Binance => "binance",
            WalletType::Metamask => "metamask",
            WalletType::TrustWallet => "trust_wallet",
        }
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(WalletType::Binance),
            "metamask" => Ok(WalletType::Metamask),
            "trust_wallet" => Ok(WalletType::TrustWallet),
            other => Err(WalletError::UnsupportedWallet(other.to_string())),
        }
    }
}

/// Web3 wallets send `address`; exchange wallets send API credentials, or
/// omit them to fall back to `BINANCE_<user>_API_KEY` / `BINANCE_<user>_SECRET_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectWalletRequest {
    pub wallet_type: WalletType,
    pub address: Option<String>,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    #[serde(rename = "type")]
    pub wallet_type: WalletType,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_wei: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_eth: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub balances: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    pub last_update: DateTime<Utc>,
}

impl WalletInfo {
    pub fn connected(wallet_type: WalletType, address: String, balance_wei: u128) -> Self {
        Self {
            wallet_type,
            status: "connected".to_string(),
            address: Some(address),
            balance_wei: Some(balance_wei.to_string()),
            balance_eth: Some(balance_wei as f64 / WEI_PER_ETH),
            balances: Vec::new(),
            permissions: Vec::new(),
            last_update: Utc::now(),
        }
    }

    pub fn exchange(balances: Vec<Value>, permissions: Vec<String>) -> Self {
        Self {
            wallet_type: WalletType::Binance,
            status: "connected".to_string(),
            address: None,
            balance_wei: None,
            balance_eth: None,
            balances,
            permissions,
            last_update: Utc::now(),
        }
    }

    fn same_wallet(&self, other: &WalletInfo) -> bool {
        self.wallet_type == other.wallet_type
            && match (&self.address, &other.address) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Per-user linked wallets. Lives beside the price core and shares no
/// state with it.
pub struct WalletManager {
    http: reqwest::Client,
    rpc_url: String,
    explorer_url: String,
    binance_url: String,
    binance_testnet_url: String,
    infura_project_id: Option<String>,
    etherscan_api_key: Option<String>,
    user_wallets: Arc<Mutex<HashMap<String, Vec<WalletInfo>>>>,
}

impl WalletManager {
    pub fn new(config: &Config) -> Result<Self, WalletError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.fetch_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            rpc_url: config.eth_rpc_url.trim_end_matches('/').to_string(),
            explorer_url: config.etherscan_api_url.clone(),
            binance_url: config.binance_api_url.trim_end_matches('/').to_string(),
            binance_testnet_url: config.binance_testnet_url.trim_end_matches('/').to_string(),
            infura_project_id: config.infura_project_id.clone(),
            etherscan_api_key: config.etherscan_api_key.clone(),
            user_wallets: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn wallets(&self) -> MutexGuard<'_, HashMap<String, Vec<WalletInfo>>> {
        self.user_wallets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn connect(&self, user_id: &str, request: ConnectWalletRequest) -> Result<WalletInfo, WalletError> {
        let info = match request.wallet_type {
            WalletType::Binance => self.connect_exchange(user_id, request).await?,
            WalletType::Metamask | WalletType::TrustWallet => self.connect_web3(request).await?,
        };

        self.link(user_id, info.clone());
        info!("Connected {} wallet for user {}", info.wallet_type, user_id);
        Ok(info)
    }

    async fn connect_web3(&self, request: ConnectWalletRequest) -> Result<WalletInfo, WalletError> {
        let address = request.address.unwrap_or_default();
        if !is_valid_address(&address) {
            return Err(WalletError::InvalidAddress(address));
        }

        let project_id = self
            .infura_project_id
            .as_deref()
            .ok_or(WalletError::MissingCredential("INFURA_PROJECT_ID"))?;

        let url = format!("{}/{}", self.rpc_url, project_id);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "eth_getBalance",
            "params": [address, "latest"],
            "id": 1
        });

        let response = self.http.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                status: response.status().as_u16(),
                url: self.rpc_url.clone(),
            }
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        let balance_wei = parse_balance(&body)?;

        Ok(WalletInfo::connected(request.wallet_type, address, balance_wei))
    }

    /// Reads the signed account endpoint; the secret never leaves this call.
    async fn connect_exchange(&self, user_id: &str, request: ConnectWalletRequest) -> Result<WalletInfo, WalletError> {
        let api_key = request
            .api_key
            .or_else(|| exchange_credential(user_id, "API_KEY"))
            .ok_or(WalletError::MissingCredential("BINANCE_API_KEY"))?;
        let secret_key = request
            .secret_key
            .or_else(|| exchange_credential(user_id, "SECRET_KEY"))
            .ok_or(WalletError::MissingCredential("BINANCE_SECRET_KEY"))?;

        let base_url = if request.testnet {
            &self.binance_testnet_url
        } else {
            &self.binance_url
        };
        let query = format!("timestamp={}", Utc::now().timestamp_millis());
        let signature = sign(&secret_key, &query)?;
        let url = format!("{}{}?{}&signature={}", base_url, BINANCE_ACCOUNT_PATH, query, signature);

        debug!("Fetching exchange account for user {} from {}", user_id, base_url);
        let response = self
            .http
            .get(&url)
            .header(BINANCE_API_KEY_HEADER, api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("msg").and_then(Value::as_str).map(str::to_string));
            return Err(match message {
                Some(message) => WalletError::Rejected(message),
                None => FetchError::BadStatus {
                    status: status.as_u16(),
                    url: format!("{}{}", base_url, BINANCE_ACCOUNT_PATH),
                }
                .into(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        let (balances, permissions) = parse_account(body);
        Ok(WalletInfo::exchange(balances, permissions))
    }

    fn link(&self, user_id: &str, info: WalletInfo) {
        let mut wallets = self.wallets();
        let linked = wallets.entry(user_id.to_string()).or_default();
        linked.retain(|w| !w.same_wallet(&info));
        linked.push(info);
    }

    pub fn list(&self, user_id: &str) -> Vec<WalletInfo> {
        self.wallets().get(user_id).cloned().unwrap_or_default()
    }

    /// Drops every wallet of `wallet_type`; false when the user has none linked at all.
    pub fn disconnect(&self, user_id: &str, wallet_type: WalletType) -> bool {
        let mut wallets = self.wallets();
        match wallets.get_mut(user_id) {
            Some(linked) => {
                linked.retain(|w| w.wallet_type != wallet_type);
                info!("Disconnected {} wallet for user {}", wallet_type, user_id);
                true
            }
            None => false,
        }
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        wallet_type: WalletType,
        limit: usize,
    ) -> Result<Vec<Value>, WalletError> {
        let wallet = self
            .list(user_id)
            .into_iter()
            .find(|w| w.wallet_type == wallet_type)
            .ok_or_else(|| WalletError::NotConnected(wallet_type.to_string()))?;

        // exchange trade history needs a symbol per request
        let Some(address) = wallet.address else {
            debug!("No transaction listing for {} wallets", wallet_type);
            return Ok(Vec::new());
        };

        let Some(api_key) = self.etherscan_api_key.as_deref() else {
            warn!("ETHERSCAN_API_KEY not set, no transactions for {}", address);
            return Ok(Vec::new());
        };

        let url = format!(
            "{}?module=account&action=txlist&address={}&startblock=0&endblock=99999999&page=1&offset={}&sort=desc&apikey={}",
            self.explorer_url,
            urlencoding::encode(&address),
            limit,
            urlencoding::encode(api_key)
        );

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::BadStatus {
                status: response.status().as_u16(),
                url: self.explorer_url.clone(),
            }
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(parse_transactions(body))
    }
}

fn exchange_credential(user_id: &str, key: &str) -> Option<String> {
    env::var(format!("BINANCE_{}_{}", user_id, key)).ok()
}

/// Hex HMAC-SHA256 of the query string, as the exchange expects in `signature`.
pub fn sign(secret: &str, query: &str) -> Result<String, WalletError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WalletError::MissingCredential("BINANCE_SECRET_KEY"))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn is_valid_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn parse_balance(body: &Value) -> Result<u128, FetchError> {
    if let Some(message) = body.pointer("/error/message").and_then(Value::as_str) {
        return Err(FetchError::Parse(format!("rpc error: {}", message)));
    }

    let hex = body
        .get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::Parse("missing result".to_string()))?;

    u128::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| FetchError::Parse(format!("bad balance {}: {}", hex, e)))
}

fn parse_account(body: Value) -> (Vec<Value>, Vec<String>) {
    let Value::Object(mut map) = body else {
        return (Vec::new(), Vec::new());
    };

    let balances = match map.remove("balances") {
        Some(Value::Array(balances)) => balances,
        _ => Vec::new(),
    };
    let permissions = match map.remove("permissions") {
        Some(Value::Array(permissions)) => permissions
            .into_iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    (balances, permissions)
}

/// Explorer answers `{"status": "0", "result": "<message>"}` on errors; only an array counts.
fn parse_transactions(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut map) => match map.remove("result") {
            Some(Value::Array(txs)) => txs,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::RawQuery;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    const ADDRESS: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    fn manager() -> WalletManager {
        WalletManager::new(&Config::default()).unwrap()
    }

    fn web3_request(address: &str) -> ConnectWalletRequest {
        ConnectWalletRequest {
            wallet_type: WalletType::Metamask,
            address: Some(address.to_string()),
            api_key: None,
            secret_key: None,
            testnet: false,
        }
    }

    fn exchange_request(api_key: &str, secret_key: &str) -> ConnectWalletRequest {
        ConnectWalletRequest {
            wallet_type: WalletType::Binance,
            address: None,
            api_key: Some(api_key.to_string()),
            secret_key: Some(secret_key.to_string()),
            testnet: false,
        }
    }

    /// Local stand-in for the exchange account endpoint. Accepts only the
    /// key "good-key" with a query signed by "good-secret".
    async fn account_server() -> String {
        async fn account(headers: HeaderMap, RawQuery(query): RawQuery) -> (StatusCode, Json<Value>) {
            let query = query.unwrap_or_default();
            let signed = query
                .rsplit_once("&signature=")
                .map(|(payload, signature)| sign("good-secret", payload).unwrap() == signature)
                .unwrap_or(false);
            let key_ok = headers
                .get(BINANCE_API_KEY_HEADER)
                .map(|v| v.as_bytes() == b"good-key")
                .unwrap_or(false);

            if signed && key_ok {
                (StatusCode::OK, Json(json!({
                    "canTrade": true,
                    "balances": [
                        { "asset": "BTC", "free": "0.5", "locked": "0.0" },
                        { "asset": "ETH", "free": "2.0", "locked": "0.1" }
                    ],
                    "permissions": ["SPOT"]
                })))
            } else {
                (StatusCode::UNAUTHORIZED, Json(json!({
                    "code": -1022,
                    "msg": "Signature for this request is not valid."
                })))
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(BINANCE_ACCOUNT_PATH, get(account));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_wallet_type_from_str() {
        assert_eq!("MetaMask".parse::<WalletType>().unwrap(), WalletType::Metamask);
        assert_eq!("trust_wallet".parse::<WalletType>().unwrap(), WalletType::TrustWallet);
        assert_eq!("Binance".parse::<WalletType>().unwrap(), WalletType::Binance);
        assert!(matches!(
            "coinbase".parse::<WalletType>(),
            Err(WalletError::UnsupportedWallet(_))
        ));
    }

    #[test]
    fn test_sign_matches_hmac_sha256_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign("Jefe", "what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(ADDRESS));
        assert!(!is_valid_address("52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("0xZZ908400098527886E0F7030069857D2E4169EE7"));
    }

    #[test]
    fn test_parse_balance() {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "result": "0xde0b6b3a7640000" });
        assert_eq!(parse_balance(&body).unwrap(), 1_000_000_000_000_000_000);

        let error = json!({ "error": { "code": -32602, "message": "invalid argument" } });
        assert!(parse_balance(&error).is_err());
    }

    #[test]
    fn test_parse_account() {
        let (balances, permissions) = parse_account(json!({
            "balances": [{ "asset": "BTC", "free": "1.0", "locked": "0.0" }],
            "permissions": ["SPOT", 7, "MARGIN"]
        }));
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0]["asset"], "BTC");
        assert_eq!(permissions, vec!["SPOT", "MARGIN"]);

        let (balances, permissions) = parse_account(json!({ "code": -2014 }));
        assert!(balances.is_empty());
        assert!(permissions.is_empty());
    }

    #[test]
    fn test_parse_transactions() {
        let txs = parse_transactions(json!({ "status": "1", "result": [{ "hash": "0xabc" }] }));
        assert_eq!(txs.len(), 1);
        assert!(parse_transactions(json!({ "status": "0", "result": "Invalid API Key" })).is_empty());
    }

    #[test]
    fn test_link_list_disconnect() {
        let manager = manager();
        assert!(!manager.disconnect("alice", WalletType::Metamask));

        let info = WalletInfo::connected(WalletType::Metamask, ADDRESS.to_string(), 2_000_000_000_000_000_000);
        assert_eq!(info.balance_eth, Some(2.0));
        manager.link("alice", info.clone());
        manager.link("alice", info);
        manager.link("alice", WalletInfo::exchange(Vec::new(), Vec::new()));
        manager.link("alice", WalletInfo::exchange(Vec::new(), vec!["SPOT".to_string()]));
        assert_eq!(manager.list("alice").len(), 2);
        assert!(manager.list("bob").is_empty());

        assert!(manager.disconnect("alice", WalletType::Metamask));
        let remaining = manager.list("alice");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].permissions, vec!["SPOT"]);
    }

    #[test]
    fn test_list_survives_poisoned_lock() {
        let manager = manager();
        manager.link("alice", WalletInfo::connected(WalletType::Metamask, ADDRESS.to_string(), 0));

        let wallets = manager.user_wallets.clone();
        let poisoner = std::thread::spawn(move || {
            let _guard = wallets.lock().unwrap();
            panic!("writer panicked while holding the wallet lock");
        });
        assert!(poisoner.join().is_err());
        assert!(manager.user_wallets.is_poisoned());

        assert_eq!(manager.list("alice").len(), 1);
        assert!(manager.disconnect("alice", WalletType::Metamask));
        assert!(manager.list("alice").is_empty());
    }

    #[test]
    fn test_exchange_wallet_serializes_without_web3_fields() {
        let info = WalletInfo::exchange(vec![json!({ "asset": "BTC" })], vec!["SPOT".to_string()]);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "binance");
        assert_eq!(value["balances"][0]["asset"], "BTC");
        assert!(value.get("address").is_none());
        assert!(value.get("balance_eth").is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_credentials() {
        let manager = manager();
        assert!(matches!(
            manager.connect("alice", web3_request(ADDRESS)).await,
            Err(WalletError::MissingCredential("INFURA_PROJECT_ID"))
        ));

        assert!(matches!(
            manager.connect("alice", web3_request("nope")).await,
            Err(WalletError::InvalidAddress(_))
        ));

        let no_keys = ConnectWalletRequest {
            wallet_type: WalletType::Binance,
            address: None,
            api_key: None,
            secret_key: None,
            testnet: false,
        };
        assert!(matches!(
            manager.connect("nobody-with-keys", no_keys).await,
            Err(WalletError::MissingCredential("BINANCE_API_KEY"))
        ));
        assert!(manager.list("nobody-with-keys").is_empty());
    }

    #[tokio::test]
    async fn test_connect_exchange_wallet() {
        let config = Config {
            binance_api_url: account_server().await,
            ..Config::default()
        };
        let manager = WalletManager::new(&config).unwrap();

        let info = manager
            .connect("alice", exchange_request("good-key", "good-secret"))
            .await
            .unwrap();
        assert_eq!(info.wallet_type, WalletType::Binance);
        assert_eq!(info.balances.len(), 2);
        assert_eq!(info.permissions, vec!["SPOT"]);
        assert_eq!(manager.list("alice").len(), 1);

        // exchange accounts have no explorer-backed history
        assert!(manager
            .transactions("alice", WalletType::Binance, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_connect_exchange_wallet_rejected() {
        let config = Config {
            binance_api_url: account_server().await,
            ..Config::default()
        };
        let manager = WalletManager::new(&config).unwrap();

        let result = manager
            .connect("alice", exchange_request("good-key", "wrong-secret"))
            .await;
        match result {
            Err(WalletError::Rejected(message)) => assert!(message.contains("Signature")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(manager.list("alice").is_empty());
    }

    #[tokio::test]
    async fn test_transactions_require_linked_wallet() {
        let manager = manager();
        assert!(matches!(
            manager.transactions("alice", WalletType::Metamask, 10).await,
            Err(WalletError::NotConnected(_))
        ));

        let info = WalletInfo::connected(WalletType::Metamask, ADDRESS.to_string(), 0);
        manager.link("alice", info);
        // no explorer key configured
        assert!(manager
            .transactions("alice", WalletType::Metamask, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
