// Home Assistant host platform - REST history and WebSocket state feed
use crate::application::host_platform::{HostPlatform, StateFeed};
use crate::domain::telemetry::{EntityState, StateChangedEvent};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const FEED_BUFFER: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_ID: u64 = 1;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct HomeAssistantClient {
    host: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    AuthRequired {},
    AuthOk {},
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
    Event {
        id: u64,
        event: EventEnvelope,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    data: StateChangedData,
}

#[derive(Debug, Deserialize)]
struct StateChangedData {
    entity_id: String,
    #[serde(default)]
    new_state: Option<EntityState>,
}

impl HomeAssistantClient {
    pub fn new(host: String, token: String) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn build_history_url(&self, entity_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "{}/api/history/period/{}?filter_entity_id={}&end_time={}&significant_changes_only=0",
            self.host,
            urlencoding::encode(&start.to_rfc3339_opts(SecondsFormat::Millis, true)),
            urlencoding::encode(entity_id),
            urlencoding::encode(&end.to_rfc3339_opts(SecondsFormat::Millis, true)),
        )
    }

    fn websocket_url(&self) -> Result<String> {
        let rest = if let Some(rest) = self.host.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.host.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            bail!("Unsupported host URL scheme: {}", self.host);
        };
        Ok(format!("{}/api/websocket", rest))
    }

    /// Connect, authenticate and subscribe to `state_changed` events.
    async fn open_subscription(&self) -> Result<Socket> {
        let url = self.websocket_url()?;
        let (mut socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        match next_message(&mut socket).await? {
            ServerMessage::AuthRequired {} => {}
            other => bail!("Expected auth_required, got {:?}", other),
        }
        send_json(&mut socket, json!({ "type": "auth", "access_token": self.token })).await?;

        match next_message(&mut socket).await? {
            ServerMessage::AuthOk {} => {}
            ServerMessage::AuthInvalid { message } => {
                bail!("Authentication rejected: {}", message.unwrap_or_default())
            }
            other => bail!("Unexpected reply to auth: {:?}", other),
        }

        send_json(
            &mut socket,
            json!({
                "id": SUBSCRIBE_ID,
                "type": "subscribe_events",
                "event_type": "state_changed",
            }),
        )
        .await?;

        loop {
            match next_message(&mut socket).await? {
                ServerMessage::Result { id, success: true, .. } if id == SUBSCRIBE_ID => {
                    return Ok(socket);
                }
                ServerMessage::Result { id, error, .. } if id == SUBSCRIBE_ID => {
                    bail!("subscribe_events failed: {}", error.unwrap_or_default())
                }
                _ => continue,
            }
        }
    }
}

#[async_trait]
impl HostPlatform for HomeAssistantClient {
    async fn subscribe_state_changes(&self, entity_ids: &[String]) -> Result<StateFeed> {
        let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.open_subscription())
            .await
            .context("Timed out subscribing to state changes")??;

        let filter: HashSet<String> = entity_ids.iter().cloned().collect();
        let (tx, feed) = StateFeed::channel(FEED_BUFFER);
        tracing::debug!(entities = ?entity_ids, "Subscribed to Home Assistant state changes");
        tokio::spawn(pump_events(socket, filter, tx));
        Ok(feed)
    }

    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityState>> {
        let url = self.build_history_url(entity_id, start, end);
        tracing::debug!("Fetching history: {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send history request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("History request failed with status {}: {}", status, body);
        }

        // One inner list per requested entity.
        let series = response
            .json::<Vec<Vec<EntityState>>>()
            .await
            .context("Failed to parse history response")?;

        let records: Vec<EntityState> = series.into_iter().flatten().collect();
        tracing::debug!("Got {} history records for {}", records.len(), entity_id);
        Ok(records)
    }
}

/// Forward matching events until the socket closes or the feed is dropped.
async fn pump_events(socket: Socket, filter: HashSet<String>, tx: mpsc::Sender<StateChangedEvent>) {
    let (mut write, mut read) = socket.split();
    loop {
        let message = tokio::select! {
            _ = tx.closed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            message = read.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!("Home Assistant closed the event stream");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!("Event stream error: {}", e);
                break;
            }
        };

        let Some(event) = parse_state_changed(text.as_str(), &filter) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

fn parse_state_changed(text: &str, filter: &HashSet<String>) -> Option<StateChangedEvent> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("Ignoring unparseable message: {}", e);
            return None;
        }
    };
    let ServerMessage::Event { id, event } = message else {
        return None;
    };
    if id != SUBSCRIBE_ID || !filter.contains(&event.data.entity_id) {
        return None;
    }
    let new_state = event.data.new_state?;
    Some(StateChangedEvent::new(event.data.entity_id, new_state))
}

async fn next_message(socket: &mut Socket) -> Result<ServerMessage> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).context("Malformed handshake message");
            }
            Some(Ok(Message::Close(_))) | None => bail!("Connection closed during handshake"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("WebSocket error during handshake"),
        }
    }
}

async fn send_json(socket: &mut Socket, value: serde_json::Value) -> Result<()> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .context("Failed to send WebSocket message")
}
