use crate::error::RealtimeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_SOCKET_ENDPOINT: &str = "ws://localhost:8080/ws";
pub const DEFAULT_REST_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 200;
pub const MIN_MAX_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_MAX_RECONNECT_ATTEMPTS: u32 = 12;
pub const MIN_NOTIFICATION_CAPACITY: usize = 1;
pub const MAX_NOTIFICATION_CAPACITY: usize = 10_000;

const SOCKET_ENDPOINT_ENV: &str = "CLASSPULSE_WS_ENDPOINT";
const REST_BASE_URL_ENV: &str = "CLASSPULSE_REST_BASE_URL";

/// Opaque per-key snapshot delivered to subscribers; the shape is owned by
/// the fetch function that produced it.
pub type Snapshot = simd_json::owned::Value;

fn resolve_env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfigArgs {
    pub socket_endpoint: Option<String>,
    pub rest_base_url: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
    pub notification_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub socket_endpoint: String,
    pub rest_base_url: String,
    pub max_reconnect_attempts: u32,
    pub notification_capacity: usize,
}

impl RealtimeConfigArgs {
    pub fn normalize(self) -> Result<RealtimeConfig, RealtimeError> {
        let socket_endpoint = self
            .socket_endpoint
            .or_else(|| resolve_env_override(SOCKET_ENDPOINT_ENV))
            .unwrap_or_else(|| DEFAULT_SOCKET_ENDPOINT.to_string())
            .trim()
            .to_string();

        if !socket_endpoint.starts_with("ws://") && !socket_endpoint.starts_with("wss://") {
            return Err(RealtimeError::InvalidArgument(
                "socketEndpoint must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let rest_base_url = self
            .rest_base_url
            .or_else(|| resolve_env_override(REST_BASE_URL_ENV))
            .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        if !rest_base_url.starts_with("http://") && !rest_base_url.starts_with("https://") {
            return Err(RealtimeError::InvalidArgument(
                "restBaseUrl must use the http:// or https:// scheme".to_string(),
            ));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_MAX_RECONNECT_ATTEMPTS..=MAX_MAX_RECONNECT_ATTEMPTS)
            .contains(&max_reconnect_attempts)
        {
            return Err(RealtimeError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_MAX_RECONNECT_ATTEMPTS} and {MAX_MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let notification_capacity = self
            .notification_capacity
            .unwrap_or(DEFAULT_NOTIFICATION_CAPACITY);
        if !(MIN_NOTIFICATION_CAPACITY..=MAX_NOTIFICATION_CAPACITY).contains(&notification_capacity)
        {
            return Err(RealtimeError::InvalidArgument(format!(
                "notificationCapacity must be between {MIN_NOTIFICATION_CAPACITY} and {MAX_NOTIFICATION_CAPACITY}"
            )));
        }

        Ok(RealtimeConfig {
            socket_endpoint,
            rest_base_url,
            max_reconnect_attempts,
            notification_capacity,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatusSnapshot {
    pub state: ChannelState,
    pub endpoint: String,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl ChannelStatusSnapshot {
    pub fn disconnected(endpoint: String, reason: Option<String>) -> Self {
        Self {
            state: ChannelState::Disconnected,
            endpoint,
            attempt: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Notification,
    Stats,
    Assignment,
    Payment,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Stats => "stats",
            Self::Assignment => "assignment",
            Self::Payment => "payment",
        }
    }

    pub fn parse_str(raw: &str) -> Option<Self> {
        match raw {
            "notification" => Some(Self::Notification),
            "stats" => Some(Self::Stats),
            "assignment" => Some(Self::Assignment),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    pub scope: String,
    pub timestamp: i64,
    #[serde(default)]
    pub counters: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentAction {
    Created,
    Updated,
    Submitted,
    Graded,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    pub assignment_id: String,
    pub course_id: String,
    pub action: AssignmentAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub payment_id: String,
    pub student_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: PaymentStatus,
}

/// One decoded unit of data received over the shared socket. `Unknown`
/// carries kinds this client does not handle yet; the channel drops them
/// with a warning instead of failing the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum EventEnvelope {
    Notification(NotificationItem),
    Stats(StatsUpdate),
    Assignment(AssignmentEvent),
    Payment(PaymentEvent),
    Unknown { kind: String },
}

impl EventEnvelope {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Notification(_) => Some(EventKind::Notification),
            Self::Stats(_) => Some(EventKind::Stats),
            Self::Assignment(_) => Some(EventKind::Assignment),
            Self::Payment(_) => Some(EventKind::Payment),
            Self::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeWire {
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Snapshot>,
}

impl TryFrom<EventEnvelopeWire> for EventEnvelope {
    type Error = RealtimeError;

    fn try_from(value: EventEnvelopeWire) -> Result<Self, Self::Error> {
        let Some(kind) = EventKind::parse_str(&value.kind) else {
            return Ok(Self::Unknown { kind: value.kind });
        };

        let payload = value.payload.ok_or_else(|| {
            RealtimeError::InvalidArgument(format!(
                "missing payload for '{}' event",
                kind.as_str()
            ))
        })?;

        let envelope = match kind {
            EventKind::Notification => {
                Self::Notification(simd_json::serde::from_owned_value(payload)?)
            }
            EventKind::Stats => Self::Stats(simd_json::serde::from_owned_value(payload)?),
            EventKind::Assignment => {
                Self::Assignment(simd_json::serde::from_owned_value(payload)?)
            }
            EventKind::Payment => Self::Payment(simd_json::serde::from_owned_value(payload)?),
        };
        Ok(envelope)
    }
}

pub fn decode_event_payload(payload: &mut [u8]) -> Result<EventEnvelope, RealtimeError> {
    let wire: EventEnvelopeWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}
