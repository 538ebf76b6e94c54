use crate::error::RealtimeError;
use crate::realtime::types::{NotificationItem, RealtimeConfig};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Bounded in-memory feed of the most recent notifications for one portal.
/// Items arrive from the socket channel or an initial fetch; the only local
/// mutation is flipping `read`, and the authoritative copy stays
/// server-side.
pub struct NotificationFeed {
    capacity: usize,
    items: Mutex<VecDeque<NotificationItem>>,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Inserts an item, replacing any existing item with the same id in
    /// place; the oldest items are evicted beyond capacity.
    pub fn record(&self, item: NotificationItem) {
        let mut items = self.items.lock();
        if let Some(existing) = items.iter_mut().find(|existing| existing.id == item.id) {
            *existing = item;
            return;
        }
        items.push_back(item);
        while items.len() > self.capacity {
            items.pop_front();
        }
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.items.lock().iter().filter(|item| !item.read).count()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Flips `read` on the local copy. Returns false when the id is not in
    /// the feed (already evicted, or never received).
    pub fn mark_read_local(&self, notification_id: &str) -> bool {
        let mut items = self.items.lock();
        match items.iter_mut().find(|item| item.id == notification_id) {
            Some(item) => {
                item.read = true;
                true
            }
            None => false,
        }
    }

    /// Optimistic mark-as-read: the local flip happens first and stands
    /// even when the REST sync fails; the failure is logged, not retried.
    pub async fn mark_as_read(
        &self,
        client: &Client,
        config: &RealtimeConfig,
        scope: &str,
        notification_id: &str,
    ) {
        if !self.mark_read_local(notification_id) {
            debug!(notification_id, "mark-as-read target not in local feed");
        }

        if let Err(error) = push_mark_as_read(client, config, scope, notification_id).await {
            warn!(
                notification_id,
                scope,
                error = %error,
                "failed to sync mark-as-read; keeping optimistic local state"
            );
        }
    }
}

fn mark_read_endpoint(rest_base_url: &str, scope: &str, notification_id: &str) -> String {
    format!(
        "{}/api/{scope}/notifications/{notification_id}/read",
        rest_base_url.trim_end_matches('/')
    )
}

pub async fn push_mark_as_read(
    client: &Client,
    config: &RealtimeConfig,
    scope: &str,
    notification_id: &str,
) -> Result<(), RealtimeError> {
    if scope.trim().is_empty() || notification_id.trim().is_empty() {
        return Err(RealtimeError::InvalidArgument(
            "scope and notification id must be non-empty".to_string(),
        ));
    }

    let endpoint = mark_read_endpoint(&config.rest_base_url, scope, notification_id);
    client.patch(endpoint).send().await?.error_for_status()?;
    Ok(())
}
