pub mod handler;

pub use handler::{ConnectionContext, WebSocketHandler, WEBSOCKET_PATH};
