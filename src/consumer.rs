// consumer.rs
//! Reference consumer for delivered push events.
//!
//! Pulls one event at a time from the channel, records the push on its
//! manifest and writes the data file back.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::channel::Receiver;
use crate::registry::SourceRegistry;
use crate::webhook::CheckpointEvent;

/// Runs until every sender is gone.
pub async fn run(events: Receiver<CheckpointEvent>, registry: Arc<SourceRegistry>) {
    while let Some(event) = events.recv().await {
        apply(&registry, &event, Utc::now().timestamp_millis()).await;
    }
    info!("Event channel closed, consumer stopping");
}

/// Applies one push. Returns `false` if the repository is no longer tracked.
pub async fn apply(registry: &SourceRegistry, event: &CheckpointEvent, at: i64) -> bool {
    if !registry.mark_updated(&event.owner, &event.repo, at) {
        warn!(
            delivery_id = %event.delivery_id,
            owner = %event.owner,
            repo = %event.repo,
            "Delivered event for untracked repository"
        );
        return false;
    }

    registry.persist().await;
    info!(
        delivery_id = %event.delivery_id,
        owner = %event.owner,
        repo = %event.repo,
        source_root = %event.source_root,
        verified = event.verified,
        "Applied push"
    );
    true
}
