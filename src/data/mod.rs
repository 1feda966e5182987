pub mod controller;
pub mod pubsub;
pub mod series;
pub mod source;

pub use controller::{CycleSettings, RefreshHandle, TickReport, UpdateCycle};
pub use pubsub::{Broadcaster, Payload, Subscriber, SubscriberRegistry};
pub use series::{AssetView, SeriesStore};
pub use source::CoinGeckoClient;
