//! Connection to the automation host over its WebSocket API.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use futures_util::SinkExt;
use futures_util::Stream;
use futures_util::StreamExt;
use serde_json::json;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tracing::warn;

use super::EntityState;
use super::HostError;
use super::StateEvent;

/// Trait for host connection operations
///
/// This trait allows for mocking the host connection for testing purposes
#[async_trait]
pub trait HassClient: Send + Sync {
    /// Connect and authenticate, and subscribe to state transitions
    async fn connect(&mut self) -> Result<(), HostError>;

    /// Fetch the current state of every entity
    async fn get_states(&self) -> Result<Vec<EntityState>, HostError>;

    /// Invoke a host service
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError>;

    /// Poll for the next state transition
    ///
    /// Returns None once the connection has closed
    async fn poll_event(&mut self) -> Option<StateEvent>;
}

/// Commands forwarded to the socket task, each carrying its reply slot.
enum Command {
    GetStates {
        reply: oneshot::Sender<Result<Vec<EntityState>, HostError>>,
    },
    CallService {
        domain: String,
        service: String,
        data: Value,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Message id used for the initial state_changed subscription
const SUBSCRIBE_ID: u64 = 1;

/// Real host connection over the WebSocket API
pub struct WsHassClient {
    url: String,
    token: String,

    /// Command channel into the socket task (created in connect())
    command_tx: Option<mpsc::Sender<Command>>,

    /// State transitions forwarded by the socket task
    event_rx: Option<mpsc::UnboundedReceiver<StateEvent>>,

    /// Background socket task handle
    socket_task: Option<JoinHandle<()>>,
}

impl WsHassClient {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            command_tx: None,
            event_rx: None,
            socket_task: None,
        }
    }

    /// WebSocket URL derived from the configured HTTP URL
    fn ws_url(&self) -> String {
        let url = self
            .url
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        format!("{}/api/websocket", url)
    }
}

#[async_trait]
impl HassClient for WsHassClient {
    async fn connect(&mut self) -> Result<(), HostError> {
        let (ws_stream, _) = connect_async(self.ws_url())
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        // Auth flow: auth_required -> auth -> auth_ok
        let greeting = recv_json(&mut read).await?;
        if greeting.get("type").and_then(Value::as_str) != Some("auth_required") {
            return Err(HostError::Transport(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }

        let auth = json!({"type": "auth", "access_token": self.token});
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;

        let response = recv_json(&mut read).await?;
        match response.get("type").and_then(Value::as_str) {
            Some("auth_ok") => {}
            Some("auth_invalid") => {
                let message = response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("invalid auth");
                return Err(HostError::Rejected(message.to_string()));
            }
            _ => {
                return Err(HostError::Transport(format!(
                    "unexpected auth response: {}",
                    response
                )));
            }
        }

        // Subscribe to state transitions; the ack is consumed by the socket
        // task as an unknown result id.
        let subscribe = json!({
            "id": SUBSCRIBE_ID,
            "type": "subscribe_events",
            "event_type": "state_changed",
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.command_tx = Some(command_tx);
        self.event_rx = Some(event_rx);
        self.socket_task = Some(tokio::spawn(socket_task(
            write, read, command_rx, event_tx,
        )));

        Ok(())
    }

    async fn get_states(&self) -> Result<Vec<EntityState>, HostError> {
        let command_tx = self.command_tx.as_ref().ok_or(HostError::NotConnected)?;
        let (reply, rx) = oneshot::channel();
        command_tx
            .send(Command::GetStates { reply })
            .await
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        let command_tx = self.command_tx.as_ref().ok_or(HostError::NotConnected)?;
        let (reply, rx) = oneshot::channel();
        command_tx
            .send(Command::CallService {
                domain: domain.to_string(),
                service: service.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    async fn poll_event(&mut self) -> Option<StateEvent> {
        match &mut self.event_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for WsHassClient {
    fn drop(&mut self) {
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
    }
}

/// Read frames until the next text frame parses as JSON.
async fn recv_json<S>(read: &mut S) -> Result<Value, HostError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| HostError::Transport(e.to_string()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HostError::Transport(e.to_string())),
            None => return Err(HostError::Closed),
        }
    }
}

/// Owns the socket after the handshake: writes id-tagged commands, pairs
/// result frames back to their reply slots, and forwards state_changed
/// events. Exiting drops the pending replies (failing their callers) and the
/// event sender (ending poll_event).
async fn socket_task(
    mut write: WsSink,
    mut read: WsSource,
    mut command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::UnboundedSender<StateEvent>,
) {
    let mut pending: HashMap<u64, Command> = HashMap::new();
    let mut next_id = SUBSCRIBE_ID + 1;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                let id = next_id;
                next_id += 1;
                let text = match &command {
                    Command::GetStates { .. } => {
                        json!({"id": id, "type": "get_states"}).to_string()
                    }
                    Command::CallService { domain, service, data, .. } => json!({
                        "id": id,
                        "type": "call_service",
                        "domain": domain,
                        "service": service,
                        "service_data": data,
                    })
                    .to_string(),
                };
                pending.insert(id, command);
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str(&text) {
                            Ok(value) => {
                                handle_server_message(value, &mut pending, &event_tx)
                            }
                            Err(e) => debug!("unparsable frame from host: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("host websocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    debug!("host socket task exiting");
}

fn handle_server_message(
    value: Value,
    pending: &mut HashMap<u64, Command>,
    event_tx: &mpsc::UnboundedSender<StateEvent>,
) {
    match value.get("type").and_then(Value::as_str) {
        Some("event") => {
            if let Some(event) = parse_state_changed(&value) {
                let _ = event_tx.send(event);
            }
        }
        Some("result") => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                return;
            };
            let success = value
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            match pending.remove(&id) {
                Some(Command::GetStates { reply }) => {
                    let result = if success {
                        Ok(parse_states(value.get("result")))
                    } else {
                        Err(HostError::Rejected(error_message(&value)))
                    };
                    let _ = reply.send(result);
                }
                Some(Command::CallService { reply, .. }) => {
                    let result = if success {
                        Ok(())
                    } else {
                        Err(HostError::Rejected(error_message(&value)))
                    };
                    let _ = reply.send(result);
                }
                // The subscribe ack lands here.
                None => debug!("result for unknown command id {}", id),
            }
        }
        _ => debug!("ignoring host frame: {}", value),
    }
}

fn error_message(value: &Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn parse_states(result: Option<&Value>) -> Vec<EntityState> {
    result
        .and_then(Value::as_array)
        .map(|states| states.iter().filter_map(parse_state).collect())
        .unwrap_or_default()
}

fn parse_state(value: &Value) -> Option<EntityState> {
    Some(EntityState {
        entity_id: value.get("entity_id")?.as_str()?.to_string(),
        state: value.get("state")?.as_str()?.to_string(),
        attributes: value.get("attributes").cloned().unwrap_or(Value::Null),
    })
}

fn parse_state_changed(value: &Value) -> Option<StateEvent> {
    let event = value.get("event")?;
    if event.get("event_type").and_then(Value::as_str) != Some("state_changed") {
        return None;
    }
    let data = event.get("data")?;
    let state_of = |key: &str| -> Option<String> {
        data.get(key)?
            .get("state")?
            .as_str()
            .map(str::to_string)
    };
    Some(StateEvent {
        entity_id: data.get("entity_id")?.as_str()?.to_string(),
        old: state_of("old_state"),
        new: state_of("new_state"),
    })
}

/// Mock host connection for testing
#[cfg(test)]
#[derive(Default)]
pub struct MockHassClient {
    pub states: std::sync::Mutex<Vec<EntityState>>,
    pub calls: std::sync::Mutex<Vec<(String, String, Value)>>,
    pub events: std::sync::Mutex<std::collections::VecDeque<StateEvent>>,
    pub is_connected: std::sync::Mutex<bool>,
}

#[cfg(test)]
impl MockHassClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, entity_id: &str, old: Option<&str>, new: Option<&str>) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(StateEvent {
                entity_id: entity_id.to_string(),
                old: old.map(str::to_string),
                new: new.map(str::to_string),
            });
        }
    }
}

// Implemented on Arc so tests can hand the client to a bridge and keep a
// handle for inspection; all state is interior-mutable.
#[cfg(test)]
#[async_trait]
impl HassClient for std::sync::Arc<MockHassClient> {
    async fn connect(&mut self) -> Result<(), HostError> {
        if let Ok(mut connected) = self.is_connected.lock() {
            *connected = true;
        }
        Ok(())
    }

    async fn get_states(&self) -> Result<Vec<EntityState>, HostError> {
        Ok(self.states.lock().map(|s| s.clone()).unwrap_or_default())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((domain.to_string(), service.to_string(), data));
        }
        Ok(())
    }

    async fn poll_event(&mut self) -> Option<StateEvent> {
        self.events.lock().ok()?.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        let client = WsHassClient::new("http://homeassistant.local:8123/", "token");
        assert_eq!(
            client.ws_url(),
            "ws://homeassistant.local:8123/api/websocket"
        );

        let client = WsHassClient::new("https://ha.example.org", "token");
        assert_eq!(client.ws_url(), "wss://ha.example.org/api/websocket");
    }

    #[test]
    fn test_parse_state_changed() {
        let frame = json!({
            "id": 1,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {
                    "entity_id": "sensor.front_door_battery",
                    "old_state": {"state": "21"},
                    "new_state": {"state": "19"},
                },
            },
        });

        let event = parse_state_changed(&frame).unwrap();
        assert_eq!(event.entity_id, "sensor.front_door_battery");
        assert_eq!(event.old.as_deref(), Some("21"));
        assert_eq!(event.new.as_deref(), Some("19"));
    }

    #[test]
    fn test_parse_state_changed_removed_entity() {
        let frame = json!({
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {
                    "entity_id": "sensor.front_door_battery",
                    "old_state": {"state": "19"},
                    "new_state": null,
                },
            },
        });

        let event = parse_state_changed(&frame).unwrap();
        assert_eq!(event.new, None);
    }

    #[test]
    fn test_parse_states() {
        let result = json!([
            {"entity_id": "sensor.a", "state": "12", "attributes": {"device_class": "battery"}},
            {"entity_id": "light.b", "state": "on"},
            {"bogus": true},
        ]);

        let states = parse_states(Some(&result));
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].entity_id, "sensor.a");
        assert_eq!(
            states[0].attribute("device_class"),
            Some(&json!("battery"))
        );
        assert_eq!(states[1].attributes, Value::Null);
    }
}
