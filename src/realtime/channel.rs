use crate::error::RealtimeError;
use crate::realtime::hub::HubShared;
use crate::realtime::types::{
    decode_event_payload, ChannelState, ChannelStatusSnapshot, EventEnvelope,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE_RECONNECT_DELAY_MS: u64 = 1_000;
const MAX_BACKOFF_EXPONENT: u32 = 10;

pub type RealtimeWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct ChannelHandle {
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) join_handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectDirective {
    RetryAfter(Duration),
    GiveUp,
}

/// Backoff bookkeeping for the channel task. `attempt` is zeroed on every
/// successful open, so a connection that recovers starts the next outage
/// from the shortest delay again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconnectState {
    attempt: u32,
    max_attempts: u32,
}

impl ReconnectState {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn on_connected(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn on_connection_lost(&mut self) -> ReconnectDirective {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.max_attempts {
            ReconnectDirective::GiveUp
        } else {
            ReconnectDirective::RetryAfter(reconnect_delay(self.attempt))
        }
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.clamp(1, MAX_BACKOFF_EXPONENT);
    Duration::from_millis(BASE_RECONNECT_DELAY_MS.saturating_mul(1_u64 << exponent))
}

async fn connect_socket_stream(endpoint: &str) -> Result<RealtimeWsStream, RealtimeError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(stream)
}

enum FrameOutcome {
    Continue,
    Closed,
}

fn handle_message(shared: &Arc<HubShared>, message: Message) -> FrameOutcome {
    match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            dispatch_frame(shared, owned_payload.as_mut_slice());
            FrameOutcome::Continue
        }
        Message::Binary(mut binary_payload) => {
            dispatch_frame(shared, binary_payload.as_mut_slice());
            FrameOutcome::Continue
        }
        Message::Close(_) => FrameOutcome::Closed,
        // Ping/pong frames are answered by the stream itself.
        _ => FrameOutcome::Continue,
    }
}

fn dispatch_frame(shared: &Arc<HubShared>, payload: &mut [u8]) {
    match decode_event_payload(payload) {
        Ok(EventEnvelope::Unknown { kind }) => {
            warn!(kind = %kind, "dropping event with unknown kind");
        }
        Ok(envelope) => {
            if let EventEnvelope::Notification(item) = &envelope {
                shared.notifications.record(item.clone());
            }
            if let Some(kind) = envelope.kind() {
                let delivered = shared.event_listeners.deliver(&kind, &envelope);
                debug!(kind = kind.as_str(), delivered, "event fanned out");
            }
        }
        Err(error) => {
            warn!(error = %error, "failed to decode realtime event frame");
        }
    }
}

pub(crate) async fn publish_channel_status(
    shared: &HubShared,
    state: ChannelState,
    attempt: u32,
    reason: Option<String>,
) {
    debug!(state = ?state, attempt, reason = reason.as_deref(), "channel status");
    let snapshot = ChannelStatusSnapshot {
        state,
        endpoint: shared.config.socket_endpoint.clone(),
        attempt,
        reason,
    };
    let mut writable = shared.channel_status.write().await;
    *writable = snapshot;
}

pub(crate) async fn run_socket_channel(shared: Arc<HubShared>, cancellation_token: CancellationToken) {
    let endpoint = shared.config.socket_endpoint.clone();
    let mut reconnect = ReconnectState::new(shared.config.max_reconnect_attempts);

    while !cancellation_token.is_cancelled() {
        let (phase, reason) = if reconnect.attempt() == 0 {
            (
                ChannelState::Connecting,
                "opening realtime socket".to_string(),
            )
        } else {
            (
                ChannelState::Reconnecting,
                format!("reconnect attempt {}", reconnect.attempt()),
            )
        };
        publish_channel_status(&shared, phase, reconnect.attempt(), Some(reason)).await;

        match connect_socket_stream(&endpoint).await {
            Ok(mut socket_stream) => {
                reconnect.on_connected();
                info!(endpoint = %endpoint, "realtime socket connected");
                publish_channel_status(
                    &shared,
                    ChannelState::Connected,
                    0,
                    Some("socket connected".to_string()),
                )
                .await;

                loop {
                    let frame = tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        next_message = socket_stream.next() => next_message,
                    };
                    let Some(frame_result) = frame else {
                        debug!(endpoint = %endpoint, "realtime socket stream ended");
                        break;
                    };
                    match frame_result {
                        Ok(message) => {
                            if matches!(handle_message(&shared, message), FrameOutcome::Closed) {
                                debug!(endpoint = %endpoint, "realtime socket close frame");
                                break;
                            }
                        }
                        Err(error) => {
                            warn!(endpoint = %endpoint, error = %error, "realtime socket frame error");
                            break;
                        }
                    }
                }
            }
            Err(error) => {
                warn!(endpoint = %endpoint, error = %error, "realtime socket connect error");
            }
        }

        if cancellation_token.is_cancelled() {
            break;
        }

        match reconnect.on_connection_lost() {
            ReconnectDirective::GiveUp => {
                warn!(
                    endpoint = %endpoint,
                    max_attempts = shared.config.max_reconnect_attempts,
                    "max reconnection attempts reached; giving up"
                );
                publish_channel_status(
                    &shared,
                    ChannelState::Exhausted,
                    reconnect.attempt(),
                    Some("max reconnection attempts reached".to_string()),
                )
                .await;
                return;
            }
            ReconnectDirective::RetryAfter(delay) => {
                publish_channel_status(
                    &shared,
                    ChannelState::Disconnected,
                    reconnect.attempt(),
                    Some(format!("socket lost; retrying in {} ms", delay.as_millis())),
                )
                .await;
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    publish_channel_status(
        &shared,
        ChannelState::Disconnected,
        0,
        Some("socket channel stopped".to_string()),
    )
    .await;
}
