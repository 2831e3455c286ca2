use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::correlator::RequestKind;
use crate::db::Db;
use crate::ipc::CoreMessage;
use crate::supervisor::{ClientSink, ModuleHost};

/// Outbound traffic for one client's writer task.
enum Outbound {
    Text(String),
    Close { reason: Option<String> },
}

struct ConnectedClient {
    tx: mpsc::Sender<Outbound>,
}

/// Presence record kept per connected client, updated when a frame
/// authenticates.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineRecord {
    pub client_id: Uuid,
    pub logged_in: bool,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
}

/// Where a command reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRoute {
    Broadcast,
    ToClient(Uuid),
    ToSender,
}

/// Tracks WebSocket clients and moves frames between them and the module
/// plane. The client map and the online-record map are mutated as a pair on
/// connect and disconnect.
pub struct ConnectionHub {
    clients: DashMap<Uuid, ConnectedClient>,
    online: DashMap<Uuid, OnlineRecord>,
    host: Arc<ModuleHost>,
    gate: Arc<AuthGate>,
    db: Option<Arc<Db>>,
    reply_timeout: Duration,
}

impl ConnectionHub {
    pub fn new(
        host: Arc<ModuleHost>,
        gate: Arc<AuthGate>,
        db: Option<Arc<Db>>,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            online: DashMap::new(),
            host,
            gate,
            db,
            reply_timeout,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn online_records(&self) -> Vec<OnlineRecord> {
        self.online.iter().map(|r| r.clone()).collect()
    }

    /// Drive one upgraded WebSocket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel::<Outbound>(256);

        self.insert_client(client_id, tx);
        info!("🔌 Client {client_id} connected ({} online)", self.clients.len());

        // Modules observe presence; delivery is best-effort.
        self.host
            .notify_all_instances(CoreMessage::ClientConnect { client_id });

        let (mut ws_tx, mut ws_rx) = socket.split();

        let forward = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { reason } => {
                        let body = json!({
                            "reason": reason.unwrap_or_else(|| "disconnected".to_string()),
                        });
                        let frame = axum::extract::ws::CloseFrame {
                            code: 1000,
                            reason: body.to_string().into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let hub = self.clone();
                    // One work unit per inbound frame; a slow handler never
                    // stalls this client's read loop.
                    tokio::spawn(async move {
                        hub.handle_frame(client_id, text).await;
                    });
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(_)) => {
                    debug!("Client {client_id} sent a binary frame; ignoring");
                }
                Err(e) => {
                    debug!("Client {client_id} socket error: {e}");
                    break;
                }
            }
        }

        forward.abort();
        self.remove_client(client_id);
        self.host
            .notify_all_instances(CoreMessage::ClientDisconnect { client_id });
        info!("👋 Client {client_id} disconnected ({} online)", self.clients.len());
    }

    fn insert_client(&self, client_id: Uuid, tx: mpsc::Sender<Outbound>) {
        self.clients.insert(client_id, ConnectedClient { tx });
        self.online.insert(
            client_id,
            OnlineRecord {
                client_id,
                logged_in: false,
                user_id: None,
                username: None,
            },
        );
    }

    fn remove_client(&self, client_id: Uuid) {
        self.clients.remove(&client_id);
        self.online.remove(&client_id);
    }

    /// The inbound frame pipeline: parse, resolve the command's module, look
    /// up the handler, authenticate, dispatch, and route the reply.
    async fn handle_frame(self: &Arc<Self>, client_id: Uuid, text: String) {
        let mut frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Client {client_id} sent invalid JSON: {e}");
                return;
            }
        };

        let command = match frame.get("command").and_then(Value::as_str) {
            Some(command) => command.to_string(),
            None => return,
        };

        let module = match module_of_command(&command) {
            Some(module) => module.to_string(),
            None => {
                debug!("Refusing malformed command name '{command}'");
                return;
            }
        };

        let entry = match self.host.registry.lookup_command(&command) {
            Some(entry) => entry,
            None => {
                debug!("Dropping unknown command '{command}'");
                return;
            }
        };

        // The id echoed back to the client: theirs if supplied, fresh
        // otherwise. The IPC correlation uses its own UUID regardless.
        let client_ref = frame
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let target = frame
            .get("target")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let token = frame
            .get("token")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let mut payload = frame
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));

        // Clients cannot pre-fill their own identity.
        if let Some(object) = payload.as_object_mut() {
            object.remove("user");
        }

        let mut shard_key = None;
        if let (Some(token), Some(db)) = (token, &self.db) {
            if let Some(identity) = self.gate.identity_from_token(db, &token).await {
                if let Some(mut record) = self.online.get_mut(&client_id) {
                    record.logged_in = true;
                    record.user_id = Some(identity.user_id);
                    record.username = Some(identity.username.clone());
                }
                shard_key = Some(identity.user_id.to_string());
                if let Some(object) = payload.as_object_mut() {
                    object.insert(
                        "user".to_string(),
                        serde_json::to_value(&identity).expect("identity serialises"),
                    );
                }
            }
        }

        // The module sees the frame's payload with socketId (and identity)
        // spliced in alongside it.
        let invoke_payload = match payload {
            Value::Object(mut object) => {
                object.insert("socketId".to_string(), json!(client_id));
                Value::Object(object)
            }
            other => json!({ "payload": other, "socketId": client_id }),
        };

        let reply = self
            .host
            .dispatch(
                &module,
                &entry.handler_id,
                invoke_payload,
                shard_key.as_deref(),
                RequestKind::Ws,
                None,
                self.reply_timeout,
            )
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                // WS timeouts are silent for the client.
                debug!("Command '{command}' failed: {e}");
                return;
            }
        };

        let text = json!({ "id": client_ref, "payload": reply.payload }).to_string();
        let route = resolve_reply_route(client_id, target.as_deref(), entry.broadcast, |id| {
            self.clients.contains_key(&id)
        });
        self.deliver(client_id, route, text).await;
    }

    async fn deliver(&self, sender: Uuid, route: ReplyRoute, text: String) {
        match route {
            ReplyRoute::Broadcast => {
                let targets: Vec<mpsc::Sender<Outbound>> =
                    self.clients.iter().map(|c| c.tx.clone()).collect();
                for tx in targets {
                    let _ = tx.send(Outbound::Text(text.clone())).await;
                }
            }
            ReplyRoute::ToClient(id) => {
                self.send_text(id, text).await;
            }
            ReplyRoute::ToSender => {
                self.send_text(sender, text).await;
            }
        }
    }

    async fn send_text(&self, client_id: Uuid, text: String) -> bool {
        let tx = match self.clients.get(&client_id) {
            Some(client) => client.tx.clone(),
            None => return false,
        };
        tx.send(Outbound::Text(text)).await.is_ok()
    }

    /// Server-initiated graceful close for every client. Used at shutdown.
    pub async fn close_all(&self, reason: &str) {
        let targets: Vec<mpsc::Sender<Outbound>> =
            self.clients.iter().map(|c| c.tx.clone()).collect();
        for tx in targets {
            let _ = tx
                .send(Outbound::Close {
                    reason: Some(reason.to_string()),
                })
                .await;
        }
    }
}

/// Module-initiated sends traverse the hub symmetrically to replies.
#[async_trait]
impl ClientSink for ConnectionHub {
    async fn send_to_client(&self, client_id: Uuid, payload: Value) -> bool {
        let text = json!({ "type": "moduleMessage", "payload": payload }).to_string();
        self.send_text(client_id, text).await
    }

    async fn broadcast_to_clients(&self, payload: Value) {
        let text = json!({ "type": "moduleMessage", "payload": payload }).to_string();
        let targets: Vec<mpsc::Sender<Outbound>> =
            self.clients.iter().map(|c| c.tx.clone()).collect();
        for tx in targets {
            let _ = tx.send(Outbound::Text(text.clone())).await;
        }
    }

    async fn disconnect_client(&self, client_id: Uuid, reason: Option<String>) {
        if let Some(client) = self.clients.get(&client_id) {
            let _ = client.tx.send(Outbound::Close { reason }).await;
        }
    }
}

/// Resolve the module a command belongs to.
///
/// Dot-split rule: the module name is everything before the first `.`;
/// namespaced commands (`@ns/mod.cmd`) must carry their `/` before that dot.
/// Anything else — no dot, empty module, `@` without a namespace — is
/// refused rather than guessed at.
pub fn module_of_command(command: &str) -> Option<&str> {
    let (module, rest) = command.split_once('.')?;
    if module.is_empty() || rest.is_empty() {
        return None;
    }
    if module.starts_with('@') && !module.contains('/') {
        return None;
    }
    Some(module)
}

/// The reply fan-out policy table.
pub fn resolve_reply_route(
    sender: Uuid,
    target: Option<&str>,
    broadcast: bool,
    known_client: impl Fn(Uuid) -> bool,
) -> ReplyRoute {
    let target = target.unwrap_or("self");

    if target == "broadcast" || broadcast {
        return ReplyRoute::Broadcast;
    }
    if target == "self" || target == sender.to_string() {
        return ReplyRoute::ToSender;
    }
    if let Ok(id) = target.parse::<Uuid>() {
        if known_client(id) {
            return ReplyRoute::ToClient(id);
        }
    }
    ReplyRoute::ToSender
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_splitting_plain() {
        assert_eq!(module_of_command("chat.send"), Some("chat"));
        assert_eq!(module_of_command("inventory.use.item"), Some("inventory"));
    }

    #[test]
    fn command_splitting_namespaced() {
        assert_eq!(module_of_command("@acme/beta.sync"), Some("@acme/beta"));
    }

    #[test]
    fn command_splitting_refuses_malformed() {
        assert_eq!(module_of_command("nodot"), None);
        assert_eq!(module_of_command(".cmd"), None);
        assert_eq!(module_of_command("mod."), None);
        // Namespace marker without a namespace path.
        assert_eq!(module_of_command("@acme.sync"), None);
    }

    #[test]
    fn reply_routing_policy_table() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let known = |id: Uuid| id == sender || id == other;

        // Broadcast wins regardless of target.
        assert_eq!(
            resolve_reply_route(sender, Some("self"), true, known),
            ReplyRoute::Broadcast
        );
        assert_eq!(
            resolve_reply_route(sender, Some("broadcast"), false, known),
            ReplyRoute::Broadcast
        );

        // Self, explicit or implicit.
        assert_eq!(
            resolve_reply_route(sender, None, false, known),
            ReplyRoute::ToSender
        );
        assert_eq!(
            resolve_reply_route(sender, Some("self"), false, known),
            ReplyRoute::ToSender
        );
        assert_eq!(
            resolve_reply_route(sender, Some(&sender.to_string()), false, known),
            ReplyRoute::ToSender
        );

        // A known client id is targeted directly.
        assert_eq!(
            resolve_reply_route(sender, Some(&other.to_string()), false, known),
            ReplyRoute::ToClient(other)
        );

        // Unknown targets fall back to the sender.
        assert_eq!(
            resolve_reply_route(sender, Some(&Uuid::new_v4().to_string()), false, known),
            ReplyRoute::ToSender
        );
        assert_eq!(
            resolve_reply_route(sender, Some("not-a-uuid"), false, known),
            ReplyRoute::ToSender
        );
    }

    #[tokio::test]
    async fn client_indices_stay_paired() {
        let host = ModuleHost::new("node", json!({}), None);
        let gate = Arc::new(AuthGate::new("secret"));
        let hub = ConnectionHub::new(host, gate, None, Duration::from_secs(5));

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let (tx, _rx) = mpsc::channel(4);
            hub.insert_client(*id, tx);
        }

        assert_eq!(hub.clients.len(), hub.online.len());
        for id in &ids {
            assert_eq!(
                hub.clients.contains_key(id),
                hub.online.contains_key(id)
            );
        }

        hub.remove_client(ids[1]);
        assert_eq!(hub.clients.len(), 2);
        assert_eq!(hub.online.len(), 2);
        assert!(!hub.online.contains_key(&ids[1]));

        let record = hub.online.get(&ids[0]).unwrap();
        assert!(!record.logged_in);
        assert!(record.user_id.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_exactly_once() {
        let host = ModuleHost::new("node", json!({}), None);
        let gate = Arc::new(AuthGate::new("secret"));
        let hub = ConnectionHub::new(host, gate, None, Duration::from_secs(5));

        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = Uuid::new_v4();
            let (tx, rx) = mpsc::channel(4);
            hub.insert_client(id, tx);
            receivers.push(rx);
            ids.push(id);
        }

        hub.deliver(ids[0], ReplyRoute::Broadcast, "hello".to_string())
            .await;

        for rx in &mut receivers {
            match rx.recv().await {
                Some(Outbound::Text(text)) => assert_eq!(text, "hello"),
                other => panic!("expected one text frame, got {:?}", other.is_some()),
            }
            assert!(rx.try_recv().is_err(), "client received a duplicate");
        }
    }

    #[tokio::test]
    async fn targeted_delivery_hits_only_the_target() {
        let host = ModuleHost::new("node", json!({}), None);
        let gate = Arc::new(AuthGate::new("secret"));
        let hub = ConnectionHub::new(host, gate, None, Duration::from_secs(5));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.insert_client(a, tx_a);
        hub.insert_client(b, tx_b);

        hub.deliver(a, ReplyRoute::ToClient(b), "direct".to_string())
            .await;

        assert!(matches!(rx_b.recv().await, Some(Outbound::Text(t)) if t == "direct"));
        assert!(rx_a.try_recv().is_err());
    }
}
