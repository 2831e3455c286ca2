use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::bus;
use crate::correlator::{Correlator, ModuleReply, RequestKind, WaitError};
use crate::db::Db;
use crate::error::DispatchError;
use crate::ipc::{self, CoreMessage, InstanceMessage};
use crate::manifest::Manifest;
use crate::registry::CommandRegistry;

/// Lifecycle of a single module child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Ready,
    Dying,
    Dead,
}

/// One running child process of a module.
pub struct Instance {
    pub module: String,
    pub instance_id: String,
    pub index: usize,
    tx: mpsc::Sender<CoreMessage>,
    state: Mutex<InstanceState>,
    shutdown: Notify,
}

impl Instance {
    /// Queue a message for the instance's writer task. Backpressure on a
    /// slow instance blocks only the caller, never the hub.
    pub async fn send(&self, message: CoreMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock().expect("instance state lock")
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock().expect("instance state lock") = state;
    }

    /// Transition into Dead exactly once. Returns false when the instance
    /// was already dead, making cleanup idempotent.
    fn mark_dead(&self) -> bool {
        let mut state = self.state.lock().expect("instance state lock");
        if *state == InstanceState::Dead {
            return false;
        }
        *state = InstanceState::Dead;
        true
    }
}

struct LoadedModule {
    manifest: Manifest,
    instances: RwLock<Vec<Arc<Instance>>>,
}

/// Where module-initiated client traffic goes. Implemented by the
/// connection hub; installed after both sides exist.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send_to_client(&self, client_id: Uuid, payload: Value) -> bool;
    async fn broadcast_to_clients(&self, payload: Value);
    async fn disconnect_client(&self, client_id: Uuid, reason: Option<String>);
}

/// Snapshot of one module for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: String,
    pub version: Option<String>,
    pub instances: usize,
}

/// Owns every module instance: spawning, supervision, IPC fan-in, and
/// request dispatch. Routes and commands registered by instances live in the
/// shared [`CommandRegistry`] and are torn down here when a module's last
/// instance dies.
pub struct ModuleHost {
    runtime: String,
    init_config: Value,
    pub registry: Arc<CommandRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub correlator: Arc<Correlator>,
    modules: DashMap<String, Arc<LoadedModule>>,
    /// Every module name the manifest scan discovered. Outlives instance
    /// death so the gateway can tell "gone" (503) from "never existed" (404).
    discovered: RwLock<std::collections::HashSet<String>>,
    skipped: RwLock<Vec<String>>,
    client_sink: RwLock<Option<Arc<dyn ClientSink>>>,
    db: Option<Arc<Db>>,
    mpc_timeout: Duration,
}

impl ModuleHost {
    pub fn new(runtime: &str, init_config: Value, db: Option<Arc<Db>>) -> Arc<Self> {
        Arc::new(Self {
            runtime: runtime.to_string(),
            init_config,
            registry: Arc::new(CommandRegistry::new()),
            balancer: Arc::new(LoadBalancer::new()),
            correlator: Arc::new(Correlator::new()),
            modules: DashMap::new(),
            discovered: RwLock::new(std::collections::HashSet::new()),
            skipped: RwLock::new(Vec::new()),
            client_sink: RwLock::new(None),
            db,
            mpc_timeout: Duration::from_secs(5),
        })
    }

    /// Install the connection hub as the target for module-initiated client
    /// traffic.
    pub fn set_client_sink(&self, sink: Arc<dyn ClientSink>) {
        *self.client_sink.write().expect("client sink lock") = Some(sink);
    }

    fn client_sink(&self) -> Option<Arc<dyn ClientSink>> {
        self.client_sink.read().expect("client sink lock").clone()
    }

    /// Record every module name the manifest scan produced.
    pub fn record_discovered(&self, names: &[String]) {
        self.discovered
            .write()
            .expect("discovered lock")
            .extend(names.iter().cloned());
    }

    /// Record the modules the manifest registry refused to load.
    pub fn record_skipped(&self, skipped: &[String]) {
        *self.skipped.write().expect("skipped lock") = skipped.to_vec();
    }

    pub fn is_known_module(&self, name: &str) -> bool {
        self.discovered.read().expect("discovered lock").contains(name)
    }

    pub fn has_live_instances(&self, name: &str) -> bool {
        self.modules
            .get(name)
            .map(|m| !m.instances.read().expect("instances lock").is_empty())
            .unwrap_or(false)
    }

    pub fn skipped_modules(&self) -> Vec<String> {
        self.skipped.read().expect("skipped lock").clone()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module_statuses(&self) -> Vec<ModuleStatus> {
        self.modules
            .iter()
            .map(|entry| ModuleStatus {
                name: entry.manifest.name.clone(),
                version: entry.manifest.version.clone(),
                instances: entry.instances.read().expect("instances lock").len(),
            })
            .collect()
    }

    /// Spawn a module's instances. `configured_count` comes from operator
    /// settings; `multiInstanceSpawning: false` caps it at one.
    pub async fn load_module(self: &Arc<Self>, manifest: Manifest, configured_count: usize) {
        let entry = manifest.entry_path();
        if !entry.exists() {
            warn!(
                "Module '{}' has no entry file at {}; skipping",
                manifest.name,
                entry.display()
            );
            self.skipped
                .write()
                .expect("skipped lock")
                .push(manifest.name.clone());
            return;
        }

        let mut count = configured_count.max(1);
        if !manifest.multi_instance && count > 1 {
            warn!(
                "Module '{}' does not support multiple instances; capping {} -> 1",
                manifest.name, count
            );
            count = 1;
        }

        let module = Arc::new(LoadedModule {
            manifest: manifest.clone(),
            instances: RwLock::new(Vec::with_capacity(count)),
        });
        self.modules.insert(manifest.name.clone(), module.clone());

        for index in 0..count {
            match self.spawn_instance(&manifest, index).await {
                Ok(instance) => {
                    module
                        .instances
                        .write()
                        .expect("instances lock")
                        .push(instance);
                }
                Err(e) => {
                    error!(
                        "Failed to spawn instance {} of '{}': {e:#}",
                        index, manifest.name
                    );
                }
            }
        }

        let live = module.instances.read().expect("instances lock").len();
        if live == 0 {
            warn!("Module '{}' has no live instances after load", manifest.name);
            self.modules.remove(&manifest.name);
        } else {
            info!("✅ Loaded module '{}' with {} instance(s)", manifest.name, live);
        }
    }

    async fn spawn_instance(
        self: &Arc<Self>,
        manifest: &Manifest,
        index: usize,
    ) -> anyhow::Result<Arc<Instance>> {
        let instance_id = format!("{}-{}", manifest.name, index);

        let mut child = Command::new(&self.runtime)
            .arg(manifest.entry_path())
            .current_dir(&manifest.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child has no stderr"))?;

        let (tx, rx) = mpsc::channel::<CoreMessage>(64);

        let instance = Arc::new(Instance {
            module: manifest.name.clone(),
            instance_id: instance_id.clone(),
            index,
            tx,
            state: Mutex::new(InstanceState::Starting),
            shutdown: Notify::new(),
        });

        self.spawn_writer(instance.clone(), stdin, rx);
        self.spawn_reader(instance.clone(), stdout);
        self.spawn_stderr_drain(instance.clone(), stderr);
        self.spawn_monitor(instance.clone(), child);

        // Handshake: the instance learns who it is and gets its env slice.
        instance
            .send(CoreMessage::Init {
                instance_id: instance_id.clone(),
                config: self.init_config.clone(),
            })
            .await;

        debug!("Spawned instance {}", instance_id);
        Ok(instance)
    }

    fn spawn_writer(
        self: &Arc<Self>,
        instance: Arc<Instance>,
        mut stdin: tokio::process::ChildStdin,
        mut rx: mpsc::Receiver<CoreMessage>,
    ) {
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let frame = match ipc::encode_frame(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode frame for {}: {e}", instance.instance_id);
                        continue;
                    }
                };
                if stdin.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
            host.cleanup_instance(&instance, "write channel closed").await;
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        instance: Arc<Instance>,
        stdout: tokio::process::ChildStdout,
    ) {
        let host = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match ipc::decode_frame(&line) {
                        Ok(Some(message)) => {
                            host.handle_instance_message(&instance, message).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                module = %instance.module,
                                instance = %instance.instance_id,
                                "Dropping malformed IPC frame: {e}"
                            );
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("IPC read error on {}: {e}", instance.instance_id);
                        break;
                    }
                }
            }
            host.cleanup_instance(&instance, "stdout closed").await;
        });
    }

    fn spawn_stderr_drain(
        self: &Arc<Self>,
        instance: Arc<Instance>,
        stderr: tokio::process::ChildStderr,
    ) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(
                    module = %instance.module,
                    instance = %instance.instance_id,
                    "{line}"
                );
            }
        });
    }

    fn spawn_monitor(self: &Arc<Self>, instance: Arc<Instance>, mut child: tokio::process::Child) {
        let host = self.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = instance.shutdown.notified() => None,
            };

            match exit {
                Some(Ok(status)) if status.success() => {
                    info!("Instance {} exited cleanly", instance.instance_id);
                }
                Some(Ok(status)) => {
                    warn!("Instance {} exited with {status}", instance.instance_id);
                }
                Some(Err(e)) => {
                    error!("Failed to await instance {}: {e}", instance.instance_id);
                }
                None => {
                    instance.set_state(InstanceState::Dying);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill instance {}: {e}", instance.instance_id);
                    }
                    let _ = child.wait().await;
                }
            }

            host.cleanup_instance(&instance, "process exited").await;
        });
    }

    /// Unified teardown for every exit signal. Safe to call repeatedly; only
    /// the first call does work. When the last instance of a module dies, the
    /// module's routes and commands are de-registered. Instances are never
    /// restarted automatically; that is an operator decision.
    async fn cleanup_instance(&self, instance: &Arc<Instance>, reason: &str) {
        if !instance.mark_dead() {
            return;
        }

        info!(
            "Instance {} of '{}' is down ({reason})",
            instance.instance_id, instance.module
        );

        let mut module_gone = false;
        if let Some(module) = self.modules.get(&instance.module) {
            let mut instances = module.instances.write().expect("instances lock");
            instances.retain(|i| i.instance_id != instance.instance_id);
            module_gone = instances.is_empty();
        }

        if module_gone {
            self.modules.remove(&instance.module);
            self.registry.remove_module(&instance.module);
            self.balancer.forget(&instance.module);
            warn!(
                "Module '{}' has no remaining instances; routes and commands removed",
                instance.module
            );
        }
    }

    /// Pick an instance for a module using the balancer.
    pub fn pick_instance(&self, module: &str, shard_key: Option<&str>) -> Option<Arc<Instance>> {
        let entry = self.modules.get(module)?;
        let instances = entry.instances.read().expect("instances lock");
        let index = self.balancer.select(module, instances.len(), shard_key)?;
        instances.get(index).cloned()
    }

    /// Dispatch a correlated request to a module and await the reply.
    pub async fn dispatch(
        self: &Arc<Self>,
        module: &str,
        handler_id: &str,
        payload: Value,
        shard_key: Option<&str>,
        kind: RequestKind,
        request_id: Option<Uuid>,
        timeout: Duration,
    ) -> Result<ModuleReply, DispatchError> {
        let instance = self
            .pick_instance(module, shard_key)
            .ok_or_else(|| DispatchError::Unavailable(module.to_string()))?;

        let id = request_id.unwrap_or_else(Uuid::new_v4);
        let rx = self.correlator.register_with_id(id, kind);

        let sent = instance
            .send(CoreMessage::Invoke {
                id,
                handler_id: handler_id.to_string(),
                payload,
            })
            .await;
        if !sent {
            self.correlator.cancel(id);
            return Err(DispatchError::Unavailable(module.to_string()));
        }

        self.correlator
            .wait(id, rx, timeout)
            .await
            .map_err(|e| match e {
                // A dead instance never replies; callers see it as a timeout.
                WaitError::Timeout | WaitError::Closed => {
                    DispatchError::Timeout(module.to_string())
                }
            })
    }

    /// Fire-and-forget a message to every live instance of every module.
    /// Runs detached so a stuck instance cannot stall the caller.
    pub fn notify_all_instances(self: &Arc<Self>, message: CoreMessage) {
        let instances: Vec<Arc<Instance>> = self
            .modules
            .iter()
            .flat_map(|entry| {
                entry
                    .instances
                    .read()
                    .expect("instances lock")
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        tokio::spawn(async move {
            for instance in instances {
                instance.send(message.clone()).await;
            }
        });
    }

    async fn handle_instance_message(
        self: &Arc<Self>,
        instance: &Arc<Instance>,
        message: InstanceMessage,
    ) {
        match message {
            InstanceMessage::Register {
                routes,
                commands,
                console_settings: _,
            } => {
                self.registry.install(&instance.module, &routes, &commands);
                instance.set_state(InstanceState::Ready);
                info!(
                    "Module '{}' registered {} route(s) and {} command(s)",
                    instance.module,
                    routes.len(),
                    commands.len()
                );
            }

            InstanceMessage::Response {
                id,
                status,
                content_type,
                payload,
            } => {
                self.correlator.complete(
                    id,
                    ModuleReply {
                        status,
                        content_type,
                        payload,
                    },
                );
            }

            InstanceMessage::Reply {
                msg_id,
                payload,
                content_type,
            } => {
                self.correlator.complete(
                    msg_id,
                    ModuleReply {
                        status: None,
                        content_type,
                        payload,
                    },
                );
            }

            InstanceMessage::Log { level, message } => {
                emit_module_log(&instance.module, &instance.instance_id, &level, &message);
            }

            InstanceMessage::IntermoduleMessage {
                to,
                id,
                payload,
                is_result,
                shard_key,
            } => {
                bus::handle_intermodule(self, instance, to, id, payload, is_result, shard_key)
                    .await;
            }

            InstanceMessage::DatabaseQuery { id, payload } => {
                self.handle_database_query(instance.clone(), id, payload);
            }

            InstanceMessage::SendToClient { client_id, payload } => {
                if let Some(sink) = self.client_sink() {
                    sink.send_to_client(client_id, payload).await;
                }
            }

            InstanceMessage::BroadcastToClients { payload } => {
                if let Some(sink) = self.client_sink() {
                    sink.broadcast_to_clients(payload).await;
                }
            }

            InstanceMessage::DisconnectClient { client_id, reason } => {
                if let Some(sink) = self.client_sink() {
                    sink.disconnect_client(client_id, reason).await;
                }
            }
        }
    }

    /// Proxy a module's query to the relational store. Raw database errors
    /// stay in the logs; the module sees a generic failure payload.
    fn handle_database_query(self: &Arc<Self>, instance: Arc<Instance>, id: Uuid, payload: Value) {
        let db = match &self.db {
            Some(db) => db.clone(),
            None => {
                let instance = instance.clone();
                tokio::spawn(async move {
                    instance
                        .send(CoreMessage::DatabaseError {
                            id,
                            payload: json!({ "error": "database unavailable" }),
                        })
                        .await;
                });
                return;
            }
        };

        tokio::spawn(async move {
            let reply = match db.run_module_query(&payload).await {
                Ok(result) => CoreMessage::DatabaseResult { id, payload: result },
                Err(e) => {
                    warn!(
                        module = %instance.module,
                        instance = %instance.instance_id,
                        "Module query failed: {e:#}"
                    );
                    CoreMessage::DatabaseError {
                        id,
                        payload: json!({ "error": "query failed" }),
                    }
                }
            };
            instance.send(reply).await;
        });
    }

    pub fn mpc_timeout(&self) -> Duration {
        self.mpc_timeout
    }

    /// Ask every instance to shut down. Monitors kill the children and run
    /// the normal cleanup path.
    pub fn shutdown(&self) {
        for entry in self.modules.iter() {
            for instance in entry.instances.read().expect("instances lock").iter() {
                instance.shutdown.notify_one();
            }
        }
    }
}

fn emit_module_log(module: &str, instance: &str, level: &str, message: &str) {
    let level = ipc::log_level(level);
    if level == tracing::Level::TRACE {
        tracing::trace!(module, instance, "{message}");
    } else if level == tracing::Level::DEBUG {
        tracing::debug!(module, instance, "{message}");
    } else if level == tracing::Level::WARN {
        tracing::warn!(module, instance, "{message}");
    } else if level == tracing::Level::ERROR {
        tracing::error!(module, instance, "{message}");
    } else {
        tracing::info!(module, instance, "{message}");
    }
}
