use std::sync::Arc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use log::{debug, error, info, warn};

use crate::data::{Payload, SeriesStore, Subscriber, SubscriberRegistry};

pub const WEBSOCKET_PATH: &str = "/ws";

/// Shared state every viewer connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub store: Arc<SeriesStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub subscriber_buffer: usize,
    pub snapshot_recent_points: usize,
}

pub struct WebSocketHandler {
    ctx: ConnectionContext,
    peer_addr: String,
}

impl WebSocketHandler {
    pub fn new(ctx: ConnectionContext, peer_addr: String) -> Self {
        Self { ctx, peer_addr }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_hdr_async(stream, |req: &Request, response: Response| {
            self.check_path(req, response)
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {}: {}", self.peer_addr, e);
                return;
            }
        };

        self.serve(ws_stream).await;
    }

    fn check_path(&self, req: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if path == WEBSOCKET_PATH {
            debug!("WebSocket upgrade for {} from {}", path, self.peer_addr);
            return Ok(response);
        }

        warn!("Unknown WebSocket path '{}' from {}", path, self.peer_addr);
        let mut rejection = ErrorResponse::new(Some("Invalid WebSocket path".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }

    async fn serve(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, read) = ws_stream.split();
        let (subscriber, rx) = Subscriber::channel(self.peer_addr.clone(), self.ctx.subscriber_buffer);
        let subscriber_id = subscriber.id();

        // late joiners get the current state before the first scheduled push
        match self.ctx.store.snapshot(self.ctx.snapshot_recent_points).to_json() {
            Ok(json) => {
                if let Err(e) = subscriber.deliver(&Payload::from(json)) {
                    warn!("Could not queue initial snapshot for {}: {}", self.peer_addr, e);
                }
            }
            Err(e) => error!("Initial snapshot for {} not sent: {}", self.peer_addr, e),
        }

        self.ctx.registry.register(subscriber);
        info!("Viewer connected from {}", self.peer_addr);

        let mut write_task = spawn_write_task(write, rx, self.peer_addr.clone());
        let mut read_task = spawn_read_task(read, self.peer_addr.clone());

        tokio::select! {
            _ = &mut write_task => {
                debug!("Write task completed for {}", self.peer_addr);
                read_task.abort();
            }
            _ = &mut read_task => {
                debug!("Read task completed for {}", self.peer_addr);
                write_task.abort();
            }
        }

        self.ctx.registry.unregister(subscriber_id);
        info!("Viewer disconnected from {}", self.peer_addr);
    }
}

fn spawn_write_task(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Payload>,
    peer_addr: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(payload.to_string())).await {
                debug!("Error sending update to {}: {}", peer_addr, e);
                return;
            }
        }
        // queue sender dropped: the viewer was pruned by the broadcaster
        if let Err(e) = write.close().await {
            debug!("Error closing connection to {}: {}", peer_addr, e);
        }
    })
}

/// Inbound frames carry no protocol; they are read only to notice the close.
fn spawn_read_task(
    mut read: SplitStream<WebSocketStream<TcpStream>>,
    peer_addr: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Close(frame)) => {
                    debug!("Received close frame from {}: {:?}", peer_addr, frame);
                    break;
                }
                Ok(Message::Text(text)) => {
                    debug!("Discarding {} byte text frame from {}", text.len(), peer_addr);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Error reading from {}: {}", peer_addr, e);
                    break;
                }
            }
        }
    })
}
