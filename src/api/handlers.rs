use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use log::{info, warn};

use crate::data::{AssetView, RefreshHandle, SeriesStore, SubscriberRegistry, TickReport};
use crate::error::{StoreError, WalletError};
use crate::wallet::{ConnectWalletRequest, WalletInfo, WalletManager, WalletType, DEFAULT_TRANSACTION_LIMIT};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<SeriesStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub refresh: RefreshHandle,
    pub wallets: Arc<WalletManager>,
    pub tracked_assets: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse {
        success: false,
        error: message.into(),
    }))
}

fn wallet_error(e: WalletError) -> ApiError {
    let status = match &e {
        WalletError::UnsupportedWallet(_)
        | WalletError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        WalletError::NotConnected(_) => StatusCode::NOT_FOUND,
        WalletError::MissingCredential(_) => StatusCode::SERVICE_UNAVAILABLE,
        WalletError::Rejected(_)
        | WalletError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    warn!("Wallet request failed: {}", e);
    api_error(status, e.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssetListResponse {
    pub assets: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletListResponse {
    pub success: bool,
    pub wallets: Vec<WalletInfo>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub limit: Option<usize>,
}

// GET /api/health
pub async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "tracked_assets": state.tracked_assets,
        "ingested_assets": state.store.len(),
        "subscribers": state.registry.len(),
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/crypto
pub async fn list_assets(State(state): State<ApiState>) -> Json<AssetListResponse> {
    let assets = state.store.asset_ids();
    let total = assets.len();
    Json(AssetListResponse { assets, total })
}

// GET /api/crypto/:crypto_id
pub async fn get_asset(
    State(state): State<ApiState>,
    Path(crypto_id): Path<String>,
) -> Result<Json<AssetView>, ApiError> {
    state
        .store
        .get_asset(&crypto_id.to_lowercase())
        .map(Json)
        .map_err(|StoreError::UnknownAsset(id)| {
            api_error(StatusCode::NOT_FOUND, format!("Crypto not found: {}", id))
        })
}

// POST /api/refresh
pub async fn refresh(State(state): State<ApiState>) -> Result<Json<TickReport>, ApiError> {
    info!("Refresh requested via API");
    state
        .refresh
        .refresh()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

// GET /api/wallets/:user_id
pub async fn list_wallets(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Json<WalletListResponse> {
    Json(WalletListResponse {
        success: true,
        wallets: state.wallets.list(&user_id),
    })
}

// POST /api/wallets/:user_id/connect
pub async fn connect_wallet(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(request): Json<ConnectWalletRequest>,
) -> Result<Json<WalletInfo>, ApiError> {
    state
        .wallets
        .connect(&user_id, request)
        .await
        .map(Json)
        .map_err(wallet_error)
}

// DELETE /api/wallets/:user_id/:wallet_type
pub async fn disconnect_wallet(
    State(state): State<ApiState>,
    Path((user_id, wallet_type)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let wallet_type: WalletType = wallet_type.parse().map_err(wallet_error)?;
    let disconnected = state.wallets.disconnect(&user_id, wallet_type);
    Ok(Json(serde_json::json!({ "success": disconnected })))
}

// GET /api/wallets/:user_id/:wallet_type/transactions
pub async fn wallet_transactions(
    State(state): State<ApiState>,
    Path((user_id, wallet_type)): Path<(String, String)>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let wallet_type: WalletType = wallet_type.parse().map_err(wallet_error)?;
    let limit = query.limit.unwrap_or(DEFAULT_TRANSACTION_LIMIT);

    state
        .wallets
        .transactions(&user_id, wallet_type, limit)
        .await
        .map(Json)
        .map_err(wallet_error)
}

pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/crypto", get(list_assets))
        .route("/crypto/:crypto_id", get(get_asset))
        .route("/refresh", post(refresh))
        .route("/wallets/:user_id", get(list_wallets))
        .route("/wallets/:user_id/connect", post(connect_wallet))
        .route("/wallets/:user_id/:wallet_type", delete(disconnect_wallet))
        .route("/wallets/:user_id/:wallet_type/transactions", get(wallet_transactions))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::data::controller::tests::{settings, FakeSource};
    use crate::data::{Broadcaster, UpdateCycle};

    /// Each queued price set feeds one tick; with none queued every tick fails
    /// and the store stays as seeded.
    fn state_with(queued: &[f64]) -> ApiState {
        let store = Arc::new(SeriesStore::new(10, "usd"));
        store.ingest_current("bitcoin", json!({ "usd": 7.0 }).as_object().cloned().unwrap());

        let registry = Arc::new(SubscriberRegistry::new());
        let source = Arc::new(FakeSource::default());
        for &price in queued {
            source.push_prices(&[("bitcoin", price)]);
        }

        let cycle = UpdateCycle::new(
            source,
            store.clone(),
            Broadcaster::new(registry.clone()),
            settings(&["bitcoin"]),
        );
        let (_task, refresh) = cycle.spawn();

        ApiState {
            store,
            registry,
            refresh,
            wallets: Arc::new(WalletManager::new(&Config::default()).unwrap()),
            tracked_assets: 1,
        }
    }

    fn state() -> ApiState {
        state_with(&[])
    }

    async fn call(router: Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_get_known_asset() {
        let (status, body) = call(create_api_router(state()), Method::GET, "/api/crypto/Bitcoin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current"]["usd"], 7.0);
        assert!(body["stats"].is_object());
    }

    #[tokio::test]
    async fn test_get_unknown_asset_is_not_found() {
        let (status, body) = call(create_api_router(state()), Method::GET, "/api/crypto/unobtainium").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_list_assets_and_health() {
        let state = state();
        let (status, body) = call(create_api_router(state.clone()), Method::GET, "/api/crypto").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["assets"], json!(["bitcoin"]));

        let (status, body) = call(create_api_router(state), Method::GET, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_refresh_runs_a_tick() {
        // the scheduled first tick may consume either entry before the refresh
        let state = state_with(&[8.0, 8.0]);
        let (status, body) = call(create_api_router(state.clone()), Method::POST, "/api/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fetched"], true);
        assert_eq!(body["ingested"], 1);

        let prices = state.store.get_asset("bitcoin").unwrap().prices;
        assert_eq!(prices.first(), Some(&7.0));
        assert_eq!(prices.last(), Some(&8.0));
        assert!(prices.len() == 2 || prices.len() == 3);
    }

    #[tokio::test]
    async fn test_wallet_routes() {
        let router = create_api_router(state());

        let (status, body) = call(router.clone(), Method::GET, "/api/wallets/alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wallets"], json!([]));

        let (status, body) = call(router.clone(), Method::DELETE, "/api/wallets/alice/metamask").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        let (status, _) = call(router.clone(), Method::DELETE, "/api/wallets/alice/coinbase").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(router, Method::GET, "/api/wallets/alice/metamask/transactions").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connect_exchange_wallet_without_keys() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/wallets/alice/connect")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "wallet_type": "binance" }).to_string()))
            .unwrap();
        let response = create_api_router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("BINANCE_API_KEY"));
    }
}
