// lib.rs
//! GitHub push receiver.
//!
//! Authenticates webhook deliveries against per-repository secrets and hands
//! accepted pushes to a consumer over a rendezvous [`channel`].

pub mod channel;
pub mod config;
pub mod consumer;
pub mod registry;
pub mod server;
pub mod signature;
pub mod webhook;

pub use channel::{channel, Receiver, SendError, Sender};
pub use registry::{Resolution, SourceRegistry, SourceRootManifest, SourceRootOptions};
pub use webhook::{CheckpointEvent, Outcome, WebhookError, WebhookPipeline};
