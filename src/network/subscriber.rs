//! Subscriber registry.
//!
//! Tracks every accepted connection from the moment it lands until its
//! socket closes. A subscriber starts `Pending`, becomes `Identified` after
//! a valid handshake, and is demoted to `Closing` when a send fails.
//! Broadcast traffic only ever goes to identified subscribers.

use crate::frame::now_ms;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriberState {
    Pending,
    Identified,
    Closing,
}

/// Metadata a subscriber declares during identification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberDescriptor {
    pub id: u32,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub connected_at_ms: u64,
}

struct SubscriberEntry {
    state: SubscriberState,
    descriptor: Option<SubscriberDescriptor>,
    outbound: mpsc::Sender<Bytes>,
}

/// Shared map of live subscribers.
#[derive(Clone, Default)]
pub(crate) struct SubscriberRegistry {
    entries: Arc<RwLock<HashMap<u32, SubscriberEntry>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pending(&self, id: u32, outbound: mpsc::Sender<Bytes>) {
        self.entries.write().await.insert(
            id,
            SubscriberEntry {
                state: SubscriberState::Pending,
                descriptor: None,
                outbound,
            },
        );
    }

    /// Promote a pending subscriber; returns the stored descriptor.
    pub async fn identify(
        &self,
        id: u32,
        name: String,
        version: String,
        platform: String,
        capabilities: Vec<String>,
    ) -> Option<SubscriberDescriptor> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        if entry.state != SubscriberState::Pending {
            return None;
        }
        let descriptor = SubscriberDescriptor {
            id,
            name,
            version,
            platform,
            capabilities,
            connected_at_ms: now_ms(),
        };
        entry.state = SubscriberState::Identified;
        entry.descriptor = Some(descriptor.clone());
        Some(descriptor)
    }

    /// Remove a subscriber; returns whether it had identified.
    pub async fn remove(&self, id: u32) -> bool {
        self.entries
            .write()
            .await
            .remove(&id)
            .map(|entry| entry.descriptor.is_some())
            .unwrap_or(false)
    }

    pub async fn mark_closing(&self, id: u32) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.state = SubscriberState::Closing;
        }
    }

    /// Outbound channels of every identified subscriber.
    pub async fn identified_senders(&self) -> Vec<(u32, mpsc::Sender<Bytes>)> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == SubscriberState::Identified)
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect()
    }

    pub async fn sender_for(&self, id: u32) -> Option<mpsc::Sender<Bytes>> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id)?;
        (entry.state == SubscriberState::Identified).then(|| entry.outbound.clone())
    }

    /// Outbound channels of every subscriber, identified or not.
    pub async fn all_senders(&self) -> Vec<(u32, mpsc::Sender<Bytes>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect()
    }

    pub async fn identified_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.state == SubscriberState::Identified)
            .count()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
