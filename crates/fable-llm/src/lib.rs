//! # fable-llm
//!
//! Reply generators for the Fable dialogue server.
//!
//! Every generator implements [`fable_core::generate::ReplyGenerator`] and
//! yields a stream of delta events the turn pipeline forwards as chunks:
//!
//! - **Remote**: [`remote::RemoteGenerator`] calls an SSE-speaking generation endpoint
//! - **Retry**: [`retry::RetryGenerator`] wraps another generator with capped exponential backoff
//! - **Pacing**: [`pacing::PacedGenerator`] re-chunks a reply into timed word groups
//! - **Scripted**: [`scripted::ScriptedGenerator`] replays canned replies for tests and demos
//!
//! ## Crate Position
//!
//! Depends on: fable-core.
//! Depended on by: fable-server (dev), the fable binary.

#![deny(unsafe_code)]

pub mod pacing;
pub mod remote;
pub mod retry;
pub mod scripted;
pub mod sse;

pub use pacing::{PacedGenerator, PacingConfig};
pub use remote::RemoteGenerator;
pub use retry::{RetryConfig, RetryGenerator};
pub use scripted::{ScriptedGenerator, ScriptedReply};
