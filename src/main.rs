mod api;
mod config;
mod data;
mod error;
mod wallet;
mod websocket;

use std::sync::Arc;
use tokio::net::TcpListener;
use log::{error, info};
use tower_http::cors::CorsLayer;

use crate::api::{create_api_router, ApiState};
use crate::config::Config;
use crate::data::{Broadcaster, CoinGeckoClient, CycleSettings, SeriesStore, SubscriberRegistry, UpdateCycle};
use crate::wallet::WalletManager;
use crate::websocket::{ConnectionContext, WebSocketHandler, WEBSOCKET_PATH};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Shared state
    let store = Arc::new(SeriesStore::new(config.recent_capacity, &config.vs_currency));
    let registry = Arc::new(SubscriberRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    // Update cycle
    let source = Arc::new(CoinGeckoClient::new(
        &config.price_api_url,
        &config.vs_currency,
        config.fetch_timeout,
    )?);
    let cycle = UpdateCycle::new(source, store.clone(), broadcaster, CycleSettings::from(&config));
    let (cycle_task, refresh) = cycle.spawn();

    // HTTP API
    let api_state = ApiState {
        store: store.clone(),
        registry: registry.clone(),
        refresh,
        wallets: Arc::new(WalletManager::new(&config)?),
        tracked_assets: config.tracked_assets.len(),
    };
    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive());

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("HTTP API server running at http://{}", config.api_bind_address);
    let api_server = axum::serve(api_listener, api_router);

    // WebSocket push channel
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("WebSocket server running at ws://{}{}", config.bind_address, WEBSOCKET_PATH);

    let ctx = ConnectionContext {
        store,
        registry,
        subscriber_buffer: config.subscriber_buffer,
        snapshot_recent_points: config.snapshot_recent_points,
    };

    let websocket_server = async move {
        loop {
            match ws_listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = WebSocketHandler::new(ctx.clone(), addr.to_string());
                    tokio::spawn(handler.handle_connection(stream));
                }
                Err(e) => error!("Failed to accept WebSocket connection: {}", e),
            }
        }
    };

    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = websocket_server => {
            error!("WebSocket server stopped");
        }
        result = cycle_task => {
            error!("Update cycle stopped: {:?}", result);
        }
    }

    Ok(())
}
