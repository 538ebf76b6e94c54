use crate::error::RealtimeError;
use crate::realtime::channel::{publish_channel_status, run_socket_channel, ChannelHandle};
use crate::realtime::notifications::NotificationFeed;
use crate::realtime::registry::{Listener, ListenerId, ListenerRegistry};
use crate::realtime::types::{
    ChannelState, ChannelStatusSnapshot, EventEnvelope, EventKind, RealtimeConfig, Snapshot,
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type FetchFuture = BoxFuture<'static, Result<Snapshot, RealtimeError>>;
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wraps an async closure into the fetch-function shape `subscribe` takes.
pub fn fetch_fn<F, Fut>(fetch: F) -> FetchFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Snapshot, RealtimeError>> + Send + 'static,
{
    Arc::new(move || Box::pin(fetch()))
}

struct TimerHandle {
    cancellation_token: CancellationToken,
    join_handle: tokio::task::JoinHandle<()>,
}

pub(crate) struct HubShared {
    pub(crate) config: RealtimeConfig,
    pub(crate) snapshot_listeners: ListenerRegistry<String, Snapshot>,
    pub(crate) event_listeners: ListenerRegistry<EventKind, EventEnvelope>,
    pub(crate) notifications: NotificationFeed,
    timers: Mutex<HashMap<String, TimerHandle>>,
    channel_slot: tokio::sync::Mutex<Option<ChannelHandle>>,
    pub(crate) channel_status: RwLock<ChannelStatusSnapshot>,
}

/// Delivery hub for dashboard widgets: multiplexes logical subscriptions
/// onto one polling timer per key and one optional shared socket channel.
///
/// Explicitly constructed and torn down; independent instances share no
/// state. All methods assume a running tokio runtime.
pub struct RealtimeHub {
    shared: Arc<HubShared>,
}

impl RealtimeHub {
    pub fn new(config: RealtimeConfig) -> Self {
        let status = ChannelStatusSnapshot::disconnected(
            config.socket_endpoint.clone(),
            Some("channel idle".to_string()),
        );
        let notifications = NotificationFeed::new(config.notification_capacity);

        Self {
            shared: Arc::new(HubShared {
                config,
                snapshot_listeners: ListenerRegistry::new(),
                event_listeners: ListenerRegistry::new(),
                notifications,
                timers: Mutex::new(HashMap::new()),
                channel_slot: tokio::sync::Mutex::new(None),
                channel_status: RwLock::new(status),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<HubShared> {
        &self.shared
    }

    /// Registers `callback` for periodic snapshots of `key`.
    ///
    /// The first subscriber for a key spawns its timer; its `fetch` and
    /// `interval_ms` stay in effect until the last subscriber leaves.
    /// Subscribing the same callback value twice registers two independent
    /// slots that must be unsubscribed separately.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        callback: Listener<Snapshot>,
        fetch: FetchFn,
        interval_ms: u64,
    ) -> Result<SnapshotSubscription, RealtimeError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(RealtimeError::InvalidArgument(
                "subscription key must be non-empty".to_string(),
            ));
        }
        if interval_ms == 0 {
            return Err(RealtimeError::InvalidArgument(
                "intervalMs must be greater than zero".to_string(),
            ));
        }

        let listener_id = self.shared.snapshot_listeners.add(key.clone(), callback);

        {
            let mut timers = self.shared.timers.lock();
            if !timers.contains_key(&key) {
                let cancellation_token = CancellationToken::new();
                let task_token = cancellation_token.clone();
                let task_shared = Arc::clone(&self.shared);
                let task_key = key.clone();
                let join_handle = tokio::spawn(async move {
                    run_poll_timer(task_shared, task_key, fetch, interval_ms, task_token).await;
                });
                timers.insert(
                    key.clone(),
                    TimerHandle {
                        cancellation_token,
                        join_handle,
                    },
                );
            }
        }

        Ok(SnapshotSubscription {
            shared: Arc::downgrade(&self.shared),
            key,
            listener_id,
        })
    }

    /// Registers `callback` for decoded socket envelopes of one kind.
    pub fn subscribe_events(
        &self,
        kind: EventKind,
        callback: Listener<EventEnvelope>,
    ) -> EventSubscription {
        let listener_id = self.shared.event_listeners.add(kind, callback);
        EventSubscription {
            shared: Arc::downgrade(&self.shared),
            kind,
            listener_id,
        }
    }

    /// Opens the shared socket channel. No-op while a channel task is
    /// already running; after a terminal backoff exhaustion this starts a
    /// fresh connection attempt with a fresh backoff sequence.
    pub async fn connect_socket(&self) {
        let mut channel_slot = self.shared.channel_slot.lock().await;
        if let Some(handle) = channel_slot.as_ref() {
            if !handle.join_handle.is_finished() {
                return;
            }
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let task_shared = Arc::clone(&self.shared);
        let join_handle = tokio::spawn(async move {
            run_socket_channel(task_shared, task_token).await;
        });
        *channel_slot = Some(ChannelHandle {
            cancellation_token,
            join_handle,
        });
    }

    /// Closes the shared socket channel and cancels any pending reconnect.
    /// A later `connect_socket` starts over from a zeroed attempt counter.
    pub async fn disconnect_socket(&self) {
        let existing_handle = {
            let mut channel_slot = self.shared.channel_slot.lock().await;
            channel_slot.take()
        };
        if let Some(handle) = existing_handle {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }

        publish_channel_status(
            &self.shared,
            ChannelState::Disconnected,
            0,
            Some("socket closed by caller".to_string()),
        )
        .await;
    }

    pub async fn channel_status(&self) -> ChannelStatusSnapshot {
        self.shared.channel_status.read().await.clone()
    }

    /// Local feed of notifications received over the socket channel.
    pub fn notifications(&self) -> &NotificationFeed {
        &self.shared.notifications
    }

    /// Optimistically flips the local `read` flag for a notification and
    /// delegates the authoritative flip to the configured REST endpoint.
    pub async fn mark_notification_read(
        &self,
        client: &reqwest::Client,
        scope: &str,
        notification_id: &str,
    ) {
        self.shared
            .notifications
            .mark_as_read(client, &self.shared.config, scope, notification_id)
            .await;
    }

    /// Keys that currently have at least one snapshot subscriber (and
    /// therefore exactly one live timer each).
    pub fn active_keys(&self) -> Vec<String> {
        self.shared.snapshot_listeners.keys()
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.shared.snapshot_listeners.listener_count(&key.to_string())
    }

    /// Tears down every timer, every listener, and the socket channel.
    pub async fn cleanup(&self) {
        let handles: Vec<TimerHandle> = {
            let mut timers = self.shared.timers.lock();
            timers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.cancellation_token.cancel();
        }
        for handle in handles {
            let _ = handle.join_handle.await;
        }

        self.shared.snapshot_listeners.clear();
        self.shared.event_listeners.clear();
        self.shared.notifications.clear();
        self.disconnect_socket().await;
    }
}

/// Handle for one snapshot registration. `unsubscribe` is idempotent and
/// synchronous: after it returns the callback is out of the registry and
/// any in-flight fetch result is dropped for it. Dropping the handle
/// without calling `unsubscribe` keeps the subscription alive.
pub struct SnapshotSubscription {
    shared: Weak<HubShared>,
    key: String,
    listener_id: ListenerId,
}

impl SnapshotSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unsubscribe(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !shared.snapshot_listeners.remove(&self.key, self.listener_id) {
            return;
        }
        if shared.snapshot_listeners.listener_count(&self.key) == 0 {
            let handle = {
                let mut timers = shared.timers.lock();
                timers.remove(&self.key)
            };
            if let Some(handle) = handle {
                handle.cancellation_token.cancel();
            }
        }
    }
}

/// Handle for one event-kind registration; same removal semantics as
/// [`SnapshotSubscription`], minus timer bookkeeping.
pub struct EventSubscription {
    shared: Weak<HubShared>,
    kind: EventKind,
    listener_id: ListenerId,
}

impl EventSubscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.event_listeners.remove(&self.kind, self.listener_id);
    }
}

async fn run_poll_timer(
    shared: Arc<HubShared>,
    key: String,
    fetch: FetchFn,
    interval_ms: u64,
    cancellation_token: CancellationToken,
) {
    let period = Duration::from_millis(interval_ms);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    // Awaiting the fetch inline keeps at most one fetch in flight per key;
    // ticks that would overlap a pending fetch are skipped, not queued.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(key = %key, interval_ms, "poll timer started");

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = ticker.tick() => {
                let fetch_future = fetch();
                let fetched = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    result = fetch_future => result,
                };
                match fetched {
                    Ok(snapshot) => {
                        let delivered = shared.snapshot_listeners.deliver(&key, &snapshot);
                        debug!(key = %key, delivered, "snapshot delivered");
                    }
                    Err(error) => {
                        warn!(key = %key, error = %error, "snapshot fetch failed; retrying on next tick");
                    }
                }
            }
        }
    }

    debug!(key = %key, "poll timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::types::RealtimeConfigArgs;
    use parking_lot::Mutex as PlMutex;
    use simd_json::prelude::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn test_config() -> RealtimeConfig {
        RealtimeConfigArgs::default()
            .normalize()
            .expect("default config should be valid")
    }

    fn counting_fetch(counter: Arc<AtomicU64>) -> FetchFn {
        fetch_fn(move || {
            let counter = Arc::clone(&counter);
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Snapshot::from(count as i64))
            }
        })
    }

    fn recording_listener(seen: Arc<PlMutex<Vec<i64>>>) -> Listener<Snapshot> {
        Arc::new(move |snapshot: &Snapshot| {
            seen.lock().push(snapshot.as_i64().unwrap_or_default());
        })
    }

    #[tokio::test(start_paused = true)]
    async fn shares_one_timer_across_subscribers_of_a_key() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let seen_a = Arc::new(PlMutex::new(Vec::new()));
        let seen_b = Arc::new(PlMutex::new(Vec::new()));

        let subscription_a = hub
            .subscribe(
                "dash",
                recording_listener(Arc::clone(&seen_a)),
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");
        let subscription_b = hub
            .subscribe(
                "dash",
                recording_listener(Arc::clone(&seen_b)),
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(3_050)).await;

        assert_eq!(fetch_count.load(Ordering::SeqCst), 3);
        assert_eq!(*seen_a.lock(), vec![1, 2, 3]);
        assert_eq!(*seen_b.lock(), vec![1, 2, 3]);

        subscription_a.unsubscribe();
        subscription_b.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_fetching_after_last_unsubscribe() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let subscription = hub
            .subscribe(
                "student:stats",
                recording_listener(Arc::clone(&seen)),
                counting_fetch(Arc::clone(&fetch_count)),
                500,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        assert!(hub.active_keys().is_empty());

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 2);

        // A second unsubscribe is a no-op.
        subscription.unsubscribe();
        assert_eq!(fetch_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fans_out_only_to_the_snapshot_key_subscribed() {
        let hub = RealtimeHub::new(test_config());
        let stats_fetches = Arc::new(AtomicU64::new(0));
        let notification_fetches = Arc::new(AtomicU64::new(0));
        let stats_seen = Arc::new(PlMutex::new(Vec::new()));
        let notification_seen = Arc::new(PlMutex::new(Vec::new()));

        let stats_subscription = hub
            .subscribe(
                "student:stats",
                recording_listener(Arc::clone(&stats_seen)),
                counting_fetch(Arc::clone(&stats_fetches)),
                1_000,
            )
            .expect("subscribe should succeed");
        let notification_subscription = hub
            .subscribe(
                "admin:notifications",
                recording_listener(Arc::clone(&notification_seen)),
                counting_fetch(Arc::clone(&notification_fetches)),
                2_000,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(*stats_seen.lock(), vec![1, 2]);
        assert_eq!(*notification_seen.lock(), vec![1]);

        stats_subscription.unsubscribe();
        notification_subscription.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_a_tick_suppresses_later_callbacks() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let victim_slot: Arc<PlMutex<Option<SnapshotSubscription>>> =
            Arc::new(PlMutex::new(None));
        let victim_calls = Arc::new(AtomicUsize::new(0));

        let unsubscriber: Listener<Snapshot> = {
            let victim_slot = Arc::clone(&victim_slot);
            Arc::new(move |_: &Snapshot| {
                if let Some(subscription) = victim_slot.lock().take() {
                    subscription.unsubscribe();
                }
            })
        };
        let _first = hub
            .subscribe(
                "dash",
                unsubscriber,
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");

        let victim_calls_listener: Listener<Snapshot> = {
            let victim_calls = Arc::clone(&victim_calls);
            Arc::new(move |_: &Snapshot| {
                victim_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let victim = hub
            .subscribe(
                "dash",
                victim_calls_listener,
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");
        *victim_slot.lock() = Some(victim);

        tokio::time::sleep(Duration::from_millis(3_050)).await;

        // The first callback removed the second during the first tick, so
        // the second must never run, that tick included.
        assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetch_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_skips_the_tick_and_keeps_the_timer() {
        let hub = RealtimeHub::new(test_config());
        let call_count = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let flaky_fetch: FetchFn = {
            let call_count = Arc::clone(&call_count);
            fetch_fn(move || {
                let call_count = Arc::clone(&call_count);
                async move {
                    let count = call_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if count == 2 {
                        Err(RealtimeError::Fetch("backend unavailable".to_string()))
                    } else {
                        Ok(Snapshot::from(count as i64))
                    }
                }
            })
        };

        let subscription = hub
            .subscribe("dash", recording_listener(Arc::clone(&seen)), flaky_fetch, 1_000)
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(3_050)).await;

        assert_eq!(call_count.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![1, 3]);

        subscription.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_subscriber_does_not_starve_the_others() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let survivor_seen = Arc::new(PlMutex::new(Vec::new()));

        let panicking: Listener<Snapshot> = Arc::new(|_: &Snapshot| panic!("widget exploded"));
        let _first = hub
            .subscribe(
                "dash",
                panicking,
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");
        let survivor = hub
            .subscribe(
                "dash",
                recording_listener(Arc::clone(&survivor_seen)),
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(2_050)).await;

        assert_eq!(*survivor_seen.lock(), vec![1, 2]);
        assert_eq!(fetch_count.load(Ordering::SeqCst), 2);

        survivor.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_fetch_is_dropped_once_the_last_subscriber_leaves() {
        let hub = RealtimeHub::new(test_config());
        let delivered = Arc::new(AtomicUsize::new(0));

        let slow_fetch: FetchFn = fetch_fn(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Snapshot::from(1_i64))
        });
        let delivered_listener: Listener<Snapshot> = {
            let delivered = Arc::clone(&delivered);
            Arc::new(move |_: &Snapshot| {
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        };

        let subscription = hub
            .subscribe("dash", delivered_listener, slow_fetch, 500)
            .expect("subscribe should succeed");

        // The tick at 500 ms starts a fetch that resolves at 800 ms;
        // unsubscribing at 600 ms must drop that result.
        tokio::time::sleep(Duration::from_millis(600)).await;
        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_callback_subscribed_twice_fills_two_slots() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let shared_callback = recording_listener(Arc::clone(&seen));

        let first = hub
            .subscribe(
                "dash",
                Arc::clone(&shared_callback),
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");
        let second = hub
            .subscribe(
                "dash",
                shared_callback,
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec![1, 1]);

        first.unsubscribe();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(*seen.lock(), vec![1, 1, 2]);

        second.unsubscribe();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_invalid_subscription_arguments() {
        let hub = RealtimeHub::new(test_config());
        let fetch = counting_fetch(Arc::new(AtomicU64::new(0)));
        let listener: Listener<Snapshot> = Arc::new(|_: &Snapshot| {});

        assert!(hub
            .subscribe("dash", Arc::clone(&listener), Arc::clone(&fetch), 0)
            .is_err());
        assert!(hub.subscribe("   ", listener, fetch, 1_000).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_tears_down_timers_and_listeners() {
        let hub = RealtimeHub::new(test_config());
        let fetch_count = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let _subscription = hub
            .subscribe(
                "dash",
                recording_listener(Arc::clone(&seen)),
                counting_fetch(Arc::clone(&fetch_count)),
                1_000,
            )
            .expect("subscribe should succeed");

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);

        hub.cleanup().await;
        assert!(hub.active_keys().is_empty());
        assert_eq!(hub.channel_status().await.state, ChannelState::Disconnected);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);
    }
}
