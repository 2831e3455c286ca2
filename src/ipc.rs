use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One HTTP route declared by a module in its `register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecl {
    pub method: String,
    pub path: String,
    pub handler_id: String,
    #[serde(default)]
    pub requires_auth: bool,
}

/// One WebSocket command declared by a module. `name` is the suffix; the
/// registry prefixes it with the module name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDecl {
    pub name: String,
    pub handler_id: String,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub requires_auth: bool,
}

/// Messages an instance sends to the core, discriminated by `type`.
///
/// The wire format is NDJSON: one JSON object per line on the child's
/// stdout. Unknown fields are ignored so modules can evolve independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InstanceMessage {
    Register {
        #[serde(default)]
        routes: Vec<RouteDecl>,
        #[serde(default)]
        commands: Vec<CommandDecl>,
        #[serde(default)]
        console_settings: Option<Value>,
    },
    Response {
        id: Uuid,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        content_type: Option<String>,
        payload: Value,
    },
    /// Alternative reply path, equivalent to `Response` for WS callers.
    Reply {
        msg_id: Uuid,
        payload: Value,
        #[serde(default)]
        content_type: Option<String>,
    },
    Log {
        level: String,
        message: String,
    },
    IntermoduleMessage {
        to: String,
        id: Uuid,
        payload: Value,
        #[serde(default)]
        is_result: bool,
        #[serde(default)]
        shard_key: Option<String>,
    },
    DatabaseQuery {
        id: Uuid,
        payload: Value,
    },
    SendToClient {
        client_id: Uuid,
        payload: Value,
    },
    BroadcastToClients {
        payload: Value,
    },
    DisconnectClient {
        client_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Messages the core sends to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CoreMessage {
    Init {
        instance_id: String,
        config: Value,
    },
    Invoke {
        id: Uuid,
        handler_id: String,
        payload: Value,
    },
    ClientConnect {
        client_id: Uuid,
    },
    ClientDisconnect {
        client_id: Uuid,
    },
    MpcRequest {
        id: Uuid,
        from: String,
        payload: Value,
    },
    MpcResponse {
        id: Uuid,
        payload: Value,
    },
    DatabaseResult {
        id: Uuid,
        payload: Value,
    },
    DatabaseError {
        id: Uuid,
        payload: Value,
    },
}

/// Encode a message as one NDJSON frame (newline-terminated).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode a single NDJSON line into an instance message. Blank lines yield
/// `None`; malformed lines yield an error the caller logs and drops.
pub fn decode_frame(line: &str) -> Result<Option<InstanceMessage>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Map a module-reported log level onto a tracing level, defaulting to info.
pub fn log_level(level: &str) -> tracing::Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_round_trips_with_type_tag() {
        let line = r#"{"type":"register","routes":[{"method":"GET","path":"/ping","handlerId":"h1"}],"commands":[{"name":"echo","handlerId":"h2","broadcast":true}]}"#;
        let msg = decode_frame(line).unwrap().unwrap();

        match msg {
            InstanceMessage::Register { routes, commands, .. } => {
                assert_eq!(routes.len(), 1);
                assert_eq!(routes[0].handler_id, "h1");
                assert!(!routes[0].requires_auth);
                assert_eq!(commands[0].name, "echo");
                assert!(commands[0].broadcast);
            }
            other => panic!("expected Register, got {other:?}"),
        }
    }

    #[test]
    fn response_carries_optional_status() {
        let id = Uuid::new_v4();
        let line = format!(r#"{{"type":"response","id":"{id}","payload":{{"pong":true}}}}"#);
        let msg = decode_frame(&line).unwrap().unwrap();

        match msg {
            InstanceMessage::Response { id: got, status, payload, .. } => {
                assert_eq!(got, id);
                assert_eq!(status, None);
                assert_eq!(payload, json!({"pong": true}));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn reply_uses_msg_id_field() {
        let id = Uuid::new_v4();
        let line = format!(r#"{{"type":"reply","msgId":"{id}","payload":1}}"#);
        match decode_frame(&line).unwrap().unwrap() {
            InstanceMessage::Reply { msg_id, .. } => assert_eq!(msg_id, id),
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn invoke_encodes_camel_case() {
        let msg = CoreMessage::Invoke {
            id: Uuid::nil(),
            handler_id: "h1".to_string(),
            payload: json!({}),
        };
        let frame = encode_frame(&msg).unwrap();
        assert!(frame.contains(r#""type":"invoke""#));
        assert!(frame.contains(r#""handlerId":"h1""#));
        assert!(frame.ends_with('\n'));
    }

    #[test]
    fn intermodule_message_round_trip() {
        let line = r#"{"type":"intermoduleMessage","to":"billing","id":"00000000-0000-0000-0000-000000000001","payload":{"op":"charge"},"isResult":false,"shardKey":"user-1"}"#;
        match decode_frame(line).unwrap().unwrap() {
            InstanceMessage::IntermoduleMessage { to, is_result, shard_key, .. } => {
                assert_eq!(to, "billing");
                assert!(!is_result);
                assert_eq!(shard_key.as_deref(), Some("user-1"));
            }
            other => panic!("expected IntermoduleMessage, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_garbage_lines() {
        assert!(decode_frame("   ").unwrap().is_none());
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"type":"unknownKind"}"#).is_err());
    }
}
