//! # Taask Core
//!
//! Secure task envelopes and cross-cluster partner replication.
//!
//! ## Architecture
//! ```text
//! Client ──auth──▶ Authority ──────▶ Runner
//!   │ seal            │ state machine
//!   ▼                 ▼
//! Envelope      UpdateQueue ══stream══▶ Partner authority
//! ```
//!
//! - [`auth`] - mutual authentication handshake and sessions
//! - [`envelope`] - per-task encryption and key wrapping
//! - [`task`] - the task state machine and store
//! - [`partner`] - replication between paired authorities
//! - [`transport`] - RPC seams and the in-process transport
//! - [`client`] - submitting tasks and reading results
//! - [`cluster`] - an in-process authority

pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod partner;
pub mod task;
pub mod transport;

pub use taask_common::{Result, TaaskError};
