use thiserror::Error;

/// Failure talking to the upstream price feed. Always recovered by the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    BadStatus { status: u16, url: String },

    #[error("malformed response body: {0}")]
    Parse(String),
}

/// The snapshot could not be encoded; the broadcast for that tick is dropped.
#[derive(Debug, Error)]
#[error("failed to serialize snapshot: {0}")]
pub struct SerializationError(#[from] pub serde_json::Error);

/// A single subscriber could not accept a payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber channel closed")]
    Closed,

    #[error("subscriber queue full")]
    Full,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("unsupported wallet type: {0}")]
    UnsupportedWallet(String),

    #[error("wallet {0} is not connected")]
    NotConnected(String),

    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("rejected by exchange: {0}")]
    Rejected(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] FetchError),
}

impl From<reqwest::Error> for WalletError {
    fn from(e: reqwest::Error) -> Self {
        WalletError::Upstream(FetchError::Network(e))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("update cycle is not running")]
pub struct CycleStopped;
