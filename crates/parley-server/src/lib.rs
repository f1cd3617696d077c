//! # parley-server
//!
//! The live relay: presenters stream speech in, listeners receive it
//! translated into their own language.
//!
//! - [`registry`]: every live socket keyed by connection id
//! - [`directory`]: sessions, membership, reattachment, expiry
//! - [`heartbeat`]: ping probes that reap unresponsive sockets
//! - [`dispatcher`]: the per-message protocol state machine
//! - [`broadcaster`]: per-language translation fan-out
//! - [`pipeline`]: per-connection ordered provider work
//! - [`store`]: optional session record persistence
//! - [`server`]: Axum routes, background tasks, shutdown

#![deny(unsafe_code)]

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod websocket;

pub use config::ServerConfig;
pub use connection::{Connection, OutboundFrame};
pub use directory::SessionDirectory;
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use registry::ConnectionRegistry;
pub use server::RelayServer;
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
