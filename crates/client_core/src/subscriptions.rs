use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::UserId,
    protocol::{ChannelNames, PushEvent, RawPushFrame},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    session_store::AccessToken,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Event(RawPushFrame),
    SubscriptionError { channel: String, reason: String },
    ConnectionLost { reason: String },
    Reconnected,
}

/// Broker connection used by [`ChannelSubscriptionManager`]. Implementations
/// must not subscribe on their own; after `Reconnected` the manager
/// re-issues every subscription.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, token: &AccessToken) -> SyncResult<()>;
    async fn subscribe(&self, channel: &str) -> SyncResult<()>;
    async fn unsubscribe(&self, channel: &str) -> SyncResult<()>;
    async fn trigger(&self, channel: &str, event: &str, data: Value) -> SyncResult<()>;
    async fn disconnect(&self);
    fn supports_client_events(&self) -> bool;
    fn frames(&self) -> broadcast::Receiver<TransportFrame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Subscribed,
    Reconnecting,
    /// Terminal: the manager was torn down.
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionContext {
    pub user_id: UserId,
    pub token: AccessToken,
    pub counterpart: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    Event(PushEvent),
    StateChanged(SubscriptionState),
    Failed(SyncError),
}

#[derive(Debug, Clone)]
struct ChannelLayout {
    user_channel_prefix: String,
    presence_channel: String,
    signal_channel: String,
}

/// Sole owner of push-channel subscriptions for one session.
pub struct ChannelSubscriptionManager {
    transport: Arc<dyn PushTransport>,
    layout: ChannelLayout,
    state: Arc<watch::Sender<SubscriptionState>>,
    context: Option<SubscriptionContext>,
    names: Option<ChannelNames>,
    connected_token: Option<AccessToken>,
    pump: Option<JoinHandle<()>>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
}

impl ChannelSubscriptionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        settings: &ClientSettings,
        notices: mpsc::UnboundedSender<ChannelNotice>,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Idle);
        Self {
            transport,
            layout: ChannelLayout {
                user_channel_prefix: settings.user_channel_prefix.clone(),
                presence_channel: settings.presence_channel.clone(),
                signal_channel: settings.signal_channel.clone(),
            },
            state: Arc::new(state),
            context: None,
            names: None,
            connected_token: None,
            pump: None,
            notices,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Subscribes for `context`, replacing whatever was subscribed before.
    /// Unchanged context is a no-op. A channel that fails to subscribe is
    /// reported as a notice and does not abort the others.
    pub async fn activate(&mut self, context: SubscriptionContext) -> SyncResult<()> {
        let state = self.state();
        if state == SubscriptionState::Unsubscribed {
            return Err(SyncError::subscription("*", "subscriptions were torn down"));
        }
        if self.context.as_ref() == Some(&context)
            && matches!(
                state,
                SubscriptionState::Subscribed | SubscriptionState::Reconnecting
            )
        {
            return Ok(());
        }

        self.release().await;
        if self.connected_token.as_ref() != Some(&context.token)
            && self.connected_token.take().is_some()
        {
            self.transport.disconnect().await;
        }

        self.set_state(SubscriptionState::Subscribing);

        if self.connected_token.is_none() {
            if let Err(err) = self.transport.connect(&context.token).await {
                warn!(error = %err, "push: transport connect failed");
                self.set_state(SubscriptionState::Idle);
                return Err(err);
            }
            self.connected_token = Some(context.token.clone());
        }

        let names = ChannelNames::new(
            context.user_id.clone(),
            &self.layout.user_channel_prefix,
            self.layout.presence_channel.clone(),
            self.layout.signal_channel.clone(),
        );

        // Listen before subscribing so the presence snapshot is not missed.
        self.pump = Some(tokio::spawn(pump_frames(
            self.transport.frames(),
            names.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.state),
            self.notices.clone(),
        )));

        for channel in names.all() {
            if let Err(err) = self.transport.subscribe(channel).await {
                warn!(channel, error = %err, "push: subscribe failed");
                let _ = self.notices.send(ChannelNotice::Failed(err));
            }
        }

        info!(
            user = %context.user_id,
            counterpart = ?context.counterpart.as_ref().map(|c| c.as_str()),
            "push: channels subscribed"
        );
        self.names = Some(names);
        self.context = Some(context);
        self.set_state(SubscriptionState::Subscribed);
        Ok(())
    }

    /// Peer-triggered event on the shared signal channel. Returns `false`
    /// when the transport cannot trigger client events or nothing is
    /// subscribed.
    pub async fn notify_peer(&self, event: &str, sender: &UserId) -> SyncResult<bool> {
        if !self.transport.supports_client_events() || self.state() != SubscriptionState::Subscribed
        {
            return Ok(false);
        }
        let Some(names) = &self.names else {
            return Ok(false);
        };
        self.transport
            .trigger(&names.signal_channel, event, json!({ "senderId": sender }))
            .await?;
        Ok(true)
    }

    /// Unsubscribes everything and disconnects. Terminal.
    pub async fn teardown(&mut self) {
        if self.state() == SubscriptionState::Unsubscribed {
            return;
        }
        self.release().await;
        if self.connected_token.take().is_some() {
            self.transport.disconnect().await;
        }
        self.context = None;
        self.set_state(SubscriptionState::Unsubscribed);
        info!("push: subscriptions torn down");
    }

    async fn release(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(names) = self.names.take() {
            for channel in names.all() {
                if let Err(err) = self.transport.unsubscribe(channel).await {
                    debug!(channel, error = %err, "push: unsubscribe failed");
                }
            }
        }
    }

    fn set_state(&self, next: SubscriptionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            let _ = self.notices.send(ChannelNotice::StateChanged(next));
        }
    }
}

impl Drop for ChannelSubscriptionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.connected_token.take().is_none() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                transport.disconnect().await;
            });
        } else {
            warn!("push: dropped outside a runtime, transport left for its owner to close");
        }
    }
}

async fn pump_frames(
    mut frames: broadcast::Receiver<TransportFrame>,
    names: ChannelNames,
    transport: Arc<dyn PushTransport>,
    state: Arc<watch::Sender<SubscriptionState>>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
) {
    let set_state = |next: SubscriptionState| {
        state.send_replace(next);
        notices.send(ChannelNotice::StateChanged(next)).is_ok()
    };

    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "push: event pump lagged, frames dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let delivered = match frame {
            TransportFrame::Event(raw) => match names.decode(&raw) {
                Ok(Some(event)) => notices.send(ChannelNotice::Event(event)).is_ok(),
                Ok(None) => {
                    trace!(channel = %raw.channel, event = %raw.event, "push: ignoring frame");
                    true
                }
                Err(err) => {
                    warn!(error = %err, "push: dropping malformed event");
                    notices
                        .send(ChannelNotice::Failed(SyncError::MalformedEvent(err)))
                        .is_ok()
                }
            },
            TransportFrame::SubscriptionError { channel, reason } => {
                warn!(channel = %channel, reason = %reason, "push: broker rejected subscription");
                notices
                    .send(ChannelNotice::Failed(SyncError::subscription(channel, reason)))
                    .is_ok()
            }
            TransportFrame::ConnectionLost { reason } => {
                warn!(reason = %reason, "push: connection lost");
                set_state(SubscriptionState::Reconnecting)
            }
            TransportFrame::Reconnected => {
                for channel in names.all() {
                    if let Err(err) = transport.subscribe(channel).await {
                        warn!(channel, error = %err, "push: resubscribe failed");
                        let _ = notices.send(ChannelNotice::Failed(err));
                    }
                }
                info!("push: resubscribed after reconnect");
                set_state(SubscriptionState::Subscribed)
            }
        };

        if !delivered {
            break;
        }
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
