pub mod manager;

pub use manager::{ConnectWalletRequest, WalletInfo, WalletManager, WalletType, DEFAULT_TRANSACTION_LIMIT};
