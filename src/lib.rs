//! Realtime update delivery runtime for ClassPulse dashboards.
//!
//! Multiplexes many logical dashboard subscriptions onto one polling timer
//! per subscription key, and fans events from a single shared WebSocket
//! channel (with capped exponential reconnection backoff) out to listeners
//! keyed by event kind.

pub mod error;
pub mod realtime;

pub use error::RealtimeError;
pub use realtime::charts::{ChartPoint, ChartSeries};
pub use realtime::hub::{
    fetch_fn, EventSubscription, FetchFn, FetchFuture, RealtimeHub, SnapshotSubscription,
};
pub use realtime::notifications::NotificationFeed;
pub use realtime::registry::Listener;
pub use realtime::types::{
    ChannelState, ChannelStatusSnapshot, EventEnvelope, EventKind, NotificationItem,
    NotificationPriority, RealtimeConfig, RealtimeConfigArgs, Snapshot, StatsUpdate,
    DEFAULT_POLL_INTERVAL_MS,
};
