//! # fable-core
//!
//! Foundation types for the Fable dialogue protocol.
//!
//! This crate provides the shared vocabulary the server, client, and
//! generation crates depend on:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::MessageId`], [`ids::StreamId`] as newtypes
//! - **Envelopes**: [`envelope::Envelope`] wire format with per-channel sequence stamping
//! - **Credentials**: [`credential::SessionAuthenticator`] HMAC channel credentials
//! - **Errors**: [`errors::AuthError`], [`errors::ProtocolError`], [`errors::GenerateError`] via `thiserror`
//! - **Generation seam**: [`generate::ReplyGenerator`] trait and [`generate::ReplyEvent`] stream items
//! - **Transcript**: [`history::HistoryStore`] trait with an in-memory implementation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other fable crates.

#![deny(unsafe_code)]

pub mod credential;
pub mod directory;
pub mod envelope;
pub mod errors;
pub mod generate;
pub mod history;
pub mod ids;

pub use credential::{ChannelClaims, SessionAuthenticator};
pub use envelope::{Envelope, EventKind};
pub use errors::{AuthError, GenerateError, PolicyError, ProtocolError, RejectReason};
pub use ids::{ChannelId, MessageId, PrincipalId, SessionId, StreamId};
