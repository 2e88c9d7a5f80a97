pub mod bus;
pub mod store;

pub use bus::{EventBus, EventSink};
pub use store::{EventStoreConfig, EventStoreError, Replay, WsEventStore, DEFAULT_REPLAY_LIMIT};
