use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::correlator::{ModuleReply, RequestKind};
use crate::ipc::CoreMessage;
use crate::supervisor::{Instance, ModuleHost};

/// Route one `intermoduleMessage` frame.
///
/// Outbound (`is_result == false`): the sending module is calling another
/// module. The target is resolved, an instance chosen (optionally sharded),
/// and an `mpcRequest` delivered; the reply or a timeout comes back to the
/// caller as `mpcResponse` with the same id. A missing target answers
/// immediately with an error payload rather than letting the caller hang.
///
/// Inbound (`is_result == true`): the frame is the target module's answer to
/// an earlier `mpcRequest`; it completes the matching pending request.
pub async fn handle_intermodule(
    host: &Arc<ModuleHost>,
    from: &Arc<Instance>,
    to: String,
    id: Uuid,
    payload: Value,
    is_result: bool,
    shard_key: Option<String>,
) {
    if is_result {
        // Unknown or already-completed ids are discarded without logging.
        host.correlator.complete(
            id,
            ModuleReply {
                status: None,
                content_type: None,
                payload,
            },
        );
        return;
    }

    let target = match host.pick_instance(&to, shard_key.as_deref()) {
        Some(target) => target,
        None => {
            from.send(CoreMessage::MpcResponse {
                id,
                payload: json!({ "error": "Module not available", "module": to }),
            })
            .await;
            return;
        }
    };

    let rx = host.correlator.register_with_id(id, RequestKind::Mpc);

    let sent = target
        .send(CoreMessage::MpcRequest {
            id,
            from: from.module.clone(),
            payload,
        })
        .await;
    if !sent {
        host.correlator.cancel(id);
        from.send(CoreMessage::MpcResponse {
            id,
            payload: json!({ "error": "Module not available", "module": to }),
        })
        .await;
        return;
    }

    let host = host.clone();
    let caller = from.clone();
    let timeout = host.mpc_timeout();
    tokio::spawn(async move {
        let payload = match host.correlator.wait(id, rx, timeout).await {
            Ok(reply) => reply.payload,
            Err(_) => json!({ "error": "Module request timed out", "module": to }),
        };
        caller.send(CoreMessage::MpcResponse { id, payload }).await;
    });
}
