use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// What a module sent back for one correlated request.
#[derive(Debug, Clone)]
pub struct ModuleReply {
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub payload: Value,
}

/// Why a caller never got a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Deadline fired before a response arrived.
    Timeout,
    /// The reply sink was dropped, e.g. the instance died mid-request.
    Closed,
}

/// What kind of caller is waiting on a request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    Ws,
    Mpc,
}

struct Pending {
    kind: RequestKind,
    sink: oneshot::Sender<ModuleReply>,
}

/// Pairs module responses with their originating requests.
///
/// Each dispatched request registers a fresh UUID and a one-shot sink; the
/// first of {matching response, deadline} wins and removes the entry, so no
/// entry outlives its deadline and duplicate replies fall on the floor.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<Uuid, Pending>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request under a fresh id.
    pub fn register(&self, kind: RequestKind) -> (Uuid, oneshot::Receiver<ModuleReply>) {
        let id = Uuid::new_v4();
        let rx = self.register_with_id(id, kind);
        (id, rx)
    }

    /// Register under a caller-supplied id (WS frames and MPC calls bring
    /// their own). A colliding id replaces the stale entry.
    pub fn register_with_id(
        &self,
        id: Uuid,
        kind: RequestKind,
    ) -> oneshot::Receiver<ModuleReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { kind, sink: tx });
        rx
    }

    /// Fulfil a pending request. Returns the request kind when a caller was
    /// still waiting; unknown or already-completed ids return None and the
    /// reply is discarded without logging.
    pub fn complete(&self, id: Uuid, reply: ModuleReply) -> Option<RequestKind> {
        let (_, pending) = self.pending.remove(&id)?;
        let kind = pending.kind;
        // A receiver dropped mid-flight (caller gone) is indistinguishable
        // from success for the module; either way the entry is gone.
        let _ = pending.sink.send(reply);
        Some(kind)
    }

    /// Forget a pending request without completing it.
    pub fn cancel(&self, id: Uuid) {
        self.pending.remove(&id);
    }

    /// Number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Await a reply with a deadline. On timeout the entry is removed, so a
    /// late response is discarded rather than delivered.
    pub async fn wait(
        self: &Arc<Self>,
        id: Uuid,
        rx: oneshot::Receiver<ModuleReply>,
        deadline: Duration,
    ) -> Result<ModuleReply, WaitError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.cancel(id);
                Err(WaitError::Closed)
            }
            Err(_) => {
                self.cancel(id);
                Err(WaitError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(payload: Value) -> ModuleReply {
        ModuleReply {
            status: None,
            content_type: None,
            payload,
        }
    }

    #[tokio::test]
    async fn response_completes_exactly_once() {
        let correlator = Arc::new(Correlator::new());
        let (id, rx) = correlator.register(RequestKind::Http);

        assert_eq!(
            correlator.complete(id, reply(json!({"ok": true}))),
            Some(RequestKind::Http)
        );
        // Duplicate delivery affects no one.
        assert_eq!(correlator.complete(id, reply(json!({"ok": false}))), None);

        let got = correlator.wait(id, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.payload, json!({"ok": true}));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let correlator = Correlator::new();
        assert_eq!(correlator.complete(Uuid::new_v4(), reply(json!(1))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_discards_late_reply() {
        let correlator = Arc::new(Correlator::new());
        let (id, rx) = correlator.register(RequestKind::Ws);

        let err = correlator
            .wait(id, rx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout);
        assert_eq!(correlator.in_flight(), 0);

        // The response arriving after the deadline goes nowhere.
        assert_eq!(correlator.complete(id, reply(json!(2))), None);
    }

    #[tokio::test]
    async fn caller_supplied_ids_are_honoured() {
        let correlator = Arc::new(Correlator::new());
        let id = Uuid::new_v4();
        let rx = correlator.register_with_id(id, RequestKind::Mpc);

        correlator.complete(id, reply(json!("done")));
        let got = correlator.wait(id, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.payload, json!("done"));
    }

    #[tokio::test]
    async fn dropped_sink_reports_closed() {
        let correlator = Arc::new(Correlator::new());
        let (id, rx) = correlator.register(RequestKind::Http);

        // Instance death path: entry vanishes without a reply.
        correlator.cancel(id);
        let err = correlator
            .wait(id, rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Closed);
    }
}
