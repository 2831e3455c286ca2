//! # Atrium - Pluggable Real-Time Application Server Core
//!
//! A long-lived server process that accepts HTTP and WebSocket clients,
//! authenticates them, and routes their requests to dynamically discovered
//! extension modules running as isolated child processes. The core owns
//! connection lifecycle, identity, request correlation, timeouts, and
//! fan-out; modules own application logic.
//!
//! ## Architecture Overview
//!
//! * **Manifest Registry** - discovers `manifest.json` files under the
//!   modules root and resolves a dependency-ordered load list
//! * **Instance Supervisor** - spawns and supervises one or more child
//!   processes per module, tearing down routes when the last instance dies
//! * **IPC Transport** - typed, NDJSON-framed messages over child stdio
//! * **Command Registry** - runtime-mutable HTTP route and WS command tables
//! * **Load Balancer** - round-robin or FNV-1a sharded instance selection
//! * **Request Correlator** - UUID-correlated replies with hard deadlines
//! * **Connection Hub** - WebSocket clients with self/targeted/broadcast
//!   delivery
//! * **Auth Gate** - JWT session tokens and PBKDF2 password verification
//! * **Inter-Module Bus** - module-to-module calls routed through the core
//!
//! ## Message Flow
//!
//! 1. A module boots, sends `register` declaring its routes and commands
//! 2. An HTTP request or WS frame arrives and is authenticated
//! 3. The registry maps it to a module handler; the balancer picks an
//!    instance; the correlator assigns a request id and deadline
//! 4. The instance replies (or the deadline fires) and the reply is written
//!    back, fanned out per the command's broadcast flag and frame target

pub mod auth;
pub mod balancer;
pub mod bus;
pub mod config;
pub mod correlator;
pub mod db;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod ipc;
pub mod manifest;
pub mod oauth;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod users;

pub use config::AtriumConfig;
pub use error::{DispatchError, ServerError};
pub use server::AtriumServer;
