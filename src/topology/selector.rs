//! Physical-instance selection among replicas of a logical endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};

use crate::message::{EndpointId, Envelope};

/// Chooses one physical instance among the replicas bound for a logical
/// endpoint. `candidates` is non-empty and sorted by instance name.
pub trait InstanceSelector: Send + Sync {
    fn select<'a>(&self, envelope: &Envelope, candidates: &'a [EndpointId]) -> &'a EndpointId;
}

/// Deterministic consistent-hash selection.
///
/// Hashes the conversation id (falling back to the message id) so every
/// message of one conversation lands on the same replica regardless of
/// which process computes the route.
#[derive(Debug, Default)]
pub struct HashSelector;

impl InstanceSelector for HashSelector {
    fn select<'a>(&self, envelope: &Envelope, candidates: &'a [EndpointId]) -> &'a EndpointId {
        let key = envelope
            .headers()
            .conversation_id()
            .unwrap_or_else(|_| envelope.id().as_uuid());

        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let slot = (u64::from_be_bytes(prefix) % candidates.len() as u64) as usize;
        &candidates[slot]
    }
}

/// Rotates through replicas in order. Not deterministic across processes.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl InstanceSelector for RoundRobinSelector {
    fn select<'a>(&self, _envelope: &Envelope, candidates: &'a [EndpointId]) -> &'a EndpointId {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        &candidates[slot]
    }
}
