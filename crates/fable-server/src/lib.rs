//! # fable-server
//!
//! Server side of the Fable dialogue protocol.
//!
//! Authenticated WebSocket upgrades, one worker task per channel, and a
//! single live channel per session:
//!
//! - **Server**: [`server::start`] axum router with `/ws`, `/health`, `/sessions`
//! - **Binder**: [`binder::SessionBinder`] one-channel-per-session registry with displacement
//! - **Channel**: [`channel::serve_channel`] socket worker, sequence stamping, heartbeats
//! - **Turns**: [`turns::TurnPipeline`] dedup, acknowledgement, and reply streaming
//!
//! ## Crate Position
//!
//! Depends on: fable-core.
//! Depended on by: the fable binary.

#![deny(unsafe_code)]

pub mod binder;
pub mod channel;
pub mod server;
pub mod turns;

pub use binder::{BindOutcome, BindPolicy, ChannelHandle, SessionBinder};
pub use channel::{ChannelSettings, Outbound};
pub use server::{
    build_router, start, AppState, Collaborators, ServerConfig, ServerHandle, REJECT_REASON_HEADER,
};
pub use turns::TurnPipeline;
