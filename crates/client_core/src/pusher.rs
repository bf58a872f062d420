use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::protocol::RawPushFrame;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
    session_store::AccessToken,
    subscriptions::{PushTransport, TransportFrame},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type LinkHandles = (
    mpsc::UnboundedSender<String>,
    watch::Receiver<Option<String>>,
    AccessToken,
);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
const PING: &str = "pusher:ping";
const PONG: &str = "pusher:pong";
const ERROR: &str = "pusher:error";
const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
const SUBSCRIBE: &str = "pusher:subscribe";
const UNSUBSCRIBE: &str = "pusher:unsubscribe";

#[derive(Debug, Deserialize)]
struct PusherFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
    socket_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelAuth {
    auth: String,
    #[serde(default)]
    channel_data: Option<String>,
}

struct Link {
    token: AccessToken,
    outbound: mpsc::UnboundedSender<String>,
    socket_id: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

enum SocketEnd {
    Lost(String),
    Closed,
}

/// Pusher protocol 7 client over a single websocket. Private and presence
/// channels are authorized against the configured auth endpoint with the
/// session bearer token.
pub struct PusherTransport {
    http: Client,
    ws_url: String,
    auth_endpoint: String,
    backoff: (Duration, Duration),
    frames: broadcast::Sender<TransportFrame>,
    link: Mutex<Option<Link>>,
}

impl PusherTransport {
    pub fn new(settings: &ClientSettings) -> Self {
        Self::with_client(Client::new(), settings)
    }

    pub fn with_client(http: Client, settings: &ClientSettings) -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            http,
            ws_url: settings.push_ws_url(),
            auth_endpoint: settings.auth_endpoint.clone(),
            backoff: settings.reconnect_backoff(),
            frames,
            link: Mutex::new(None),
        }
    }

    async fn live_link(&self) -> SyncResult<LinkHandles> {
        let guard = self.link.lock().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| SyncError::network("push send", "transport is not connected"))?;
        Ok((link.outbound.clone(), link.socket_id.clone(), link.token.clone()))
    }

    async fn authorize(
        &self,
        token: &AccessToken,
        socket_id: &str,
        channel: &str,
    ) -> SyncResult<ChannelAuth> {
        let response = self
            .http
            .post(&self.auth_endpoint)
            .bearer_auth(token.expose())
            .form(&[("socket_id", socket_id), ("channel_name", channel)])
            .send()
            .await
            .map_err(|err| SyncError::subscription(channel, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::subscription(
                channel,
                format!("auth endpoint returned HTTP {status}: {body}"),
            ));
        }
        response
            .json::<ChannelAuth>()
            .await
            .map_err(|err| SyncError::subscription(channel, format!("bad auth response: {err}")))
    }
}

#[async_trait]
impl PushTransport for PusherTransport {
    async fn connect(&self, token: &AccessToken) -> SyncResult<()> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.token == *token && !link.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = guard.take() {
            stale.task.abort();
        }

        let (ws, socket_id) = open_socket(&self.ws_url).await?;
        info!(socket_id = %socket_id, "push: connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = watch::channel(Some(socket_id));
        let task = tokio::spawn(run_connection(
            ws,
            self.ws_url.clone(),
            self.backoff,
            outbound_rx,
            socket_tx,
            self.frames.clone(),
        ));
        *guard = Some(Link {
            token: token.clone(),
            outbound,
            socket_id: socket_rx,
            task,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> SyncResult<()> {
        let (outbound, mut socket_id, token) = self.live_link().await?;
        let socket_id =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, socket_id.wait_for(Option::is_some))
                .await
                .map_err(|_| SyncError::subscription(channel, "no socket id before timeout"))?
                .map_err(|_| SyncError::subscription(channel, "connection task ended"))?
                .clone()
                .unwrap_or_default();

        let mut data = json!({ "channel": channel });
        if channel.starts_with("private-") || channel.starts_with("presence-") {
            let auth = self.authorize(&token, &socket_id, channel).await?;
            data["auth"] = Value::String(auth.auth);
            if let Some(channel_data) = auth.channel_data {
                data["channel_data"] = Value::String(channel_data);
            }
        }

        debug!(channel, "push: subscribing");
        outbound
            .send(json!({ "event": SUBSCRIBE, "data": data }).to_string())
            .map_err(|_| SyncError::subscription(channel, "connection task ended"))
    }

    async fn unsubscribe(&self, channel: &str) -> SyncResult<()> {
        let (outbound, _, _) = self.live_link().await?;
        outbound
            .send(json!({ "event": UNSUBSCRIBE, "data": { "channel": channel } }).to_string())
            .map_err(|_| SyncError::network("push unsubscribe", "connection task ended"))
    }

    async fn trigger(&self, channel: &str, event: &str, data: Value) -> SyncResult<()> {
        let (outbound, _, _) = self.live_link().await?;
        outbound
            .send(json!({ "event": event, "channel": channel, "data": data }).to_string())
            .map_err(|_| SyncError::network("push trigger", "connection task ended"))
    }

    async fn disconnect(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        let Link { outbound, mut task, .. } = link;
        drop(outbound);
        if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            task.abort();
        }
        info!("push: disconnected");
    }

    fn supports_client_events(&self) -> bool {
        true
    }

    fn frames(&self) -> broadcast::Receiver<TransportFrame> {
        self.frames.subscribe()
    }
}

fn normalize_data(data: Value) -> Value {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

async fn open_socket(url: &str) -> SyncResult<(WsStream, String)> {
    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| SyncError::network("push connect", "handshake timed out"))?
        .map_err(|err| SyncError::network("push connect", err))?;

    let established = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(message) = ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(_) => continue,
                Err(err) => return Err(SyncError::network("push connect", err)),
            };
            let Ok(frame) = serde_json::from_str::<PusherFrame>(&text) else {
                continue;
            };
            match frame.event.as_str() {
                CONNECTION_ESTABLISHED => {
                    let payload: ConnectionEstablished =
                        serde_json::from_value(normalize_data(frame.data))
                            .map_err(|err| SyncError::network("push connect", err))?;
                    return Ok(payload.socket_id);
                }
                ERROR => {
                    return Err(SyncError::network(
                        "push connect",
                        normalize_data(frame.data),
                    ))
                }
                _ => {}
            }
        }
        Err(SyncError::network(
            "push connect",
            "socket closed before connection was established",
        ))
    })
    .await
    .map_err(|_| SyncError::network("push connect", "no connection_established frame"))??;

    Ok((ws, established))
}

async fn run_connection(
    mut ws: WsStream,
    url: String,
    backoff: (Duration, Duration),
    mut outbound: mpsc::UnboundedReceiver<String>,
    socket_id: watch::Sender<Option<String>>,
    frames: broadcast::Sender<TransportFrame>,
) {
    loop {
        let reason = match pump_socket(ws, &mut outbound, &frames).await {
            SocketEnd::Closed => return,
            SocketEnd::Lost(reason) => reason,
        };
        warn!(reason = %reason, "push: connection lost");
        socket_id.send_replace(None);
        let _ = frames.send(TransportFrame::ConnectionLost { reason });

        let (initial, max) = backoff;
        let mut delay = initial;
        ws = loop {
            // Frames queued while offline target the dead socket and are dropped.
            let slept = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                queued = outbound.recv() => match queued {
                    Some(_) => false,
                    None => return,
                },
            };
            if !slept {
                continue;
            }
            match open_socket(&url).await {
                Ok((ws, id)) => {
                    info!(socket_id = %id, "push: reconnected");
                    socket_id.send_replace(Some(id));
                    break ws;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "push: reconnect failed"
                    );
                    delay = (delay * 2).min(max);
                }
            }
        };
        let _ = frames.send(TransportFrame::Reconnected);
    }
}

async fn pump_socket(
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    frames: &broadcast::Sender<TransportFrame>,
) -> SocketEnd {
    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_text(&text, frames) {
                        if let Err(err) = writer.send(Message::Text(reply)).await {
                            return SocketEnd::Lost(err.to_string());
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = writer.send(Message::Pong(payload)).await {
                        return SocketEnd::Lost(err.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SocketEnd::Lost("closed by server".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SocketEnd::Lost(err.to_string()),
            },
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        return SocketEnd::Lost(err.to_string());
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return SocketEnd::Closed;
                }
            },
        }
    }
}

/// Forwards one inbound frame and returns the reply to send, if any.
fn handle_text(text: &str, frames: &broadcast::Sender<TransportFrame>) -> Option<String> {
    let frame = match serde_json::from_str::<PusherFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "push: unparseable frame");
            return None;
        }
    };

    match frame.event.as_str() {
        PING => return Some(json!({ "event": PONG, "data": {} }).to_string()),
        ERROR => {
            warn!(data = %normalize_data(frame.data), "push: broker error");
            return None;
        }
        SUBSCRIPTION_ERROR => {
            let channel = frame.channel.unwrap_or_default();
            let reason = match normalize_data(frame.data) {
                Value::String(reason) => reason,
                other => other.to_string(),
            };
            let _ = frames.send(TransportFrame::SubscriptionError { channel, reason });
            return None;
        }
        _ => {}
    }

    match frame.channel {
        Some(channel) => {
            let _ = frames.send(TransportFrame::Event(RawPushFrame::new(
                channel,
                frame.event,
                frame.data,
            )));
        }
        None => debug!(event = %frame.event, "push: connection-level frame ignored"),
    }
    None
}

#[cfg(test)]
#[path = "tests/pusher_tests.rs"]
mod tests;
