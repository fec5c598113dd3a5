//! # fable-client
//!
//! Client side of a Fable dialogue channel.
//!
//! One long-lived connection per session, owned by a background task and
//! driven through a cloneable [`ClientHandle`]:
//!
//! - **Manager**: [`manager::ConnectionManager`] connect/reconnect loop and event dispatch
//! - **Assembler**: [`assembler::StreamAssembler`] orders chunks and detects gaps
//! - **Outbox**: [`outbox::Outbox`] holds unacknowledged turns for redelivery
//! - **Transport**: [`transport::Connector`] seam with a real [`ws::WsConnector`] and an in-memory mock
//! - **Status**: [`status::ConnectionStatus`] snapshot with latency and traffic counters
//!
//! ## Crate Position
//!
//! Depends on: fable-core.
//! Depended on by: fable-server (dev, end-to-end tests).

#![deny(unsafe_code)]

pub mod assembler;
pub mod config;
pub mod events;
pub mod manager;
pub mod mock;
pub mod outbox;
pub mod status;
pub mod transport;
pub mod ws;

pub use assembler::StreamAssembler;
pub use config::{ClientConfig, ReconnectPolicy};
pub use events::ClientEvent;
pub use manager::{ClientHandle, ConnectionManager};
pub use status::{ConnectionState, ConnectionStatus};
pub use transport::{Connector, Transport, TransportError, TransportFrame};
pub use ws::WsConnector;
