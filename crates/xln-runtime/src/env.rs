//! The runtime environment: the multiplex of entity replicas, jurisdiction
//! mirrors, queued inputs and outputs, and the gossip store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xln_core::{Amount, EntityId, EvmAddress, Height, SignerId, TimestampMs, TokenId};
use xln_entity::{EntityMsg, EntityReplica, JSubmission};
use xln_jurisdiction::Depository;

// ── Runtime transactions ─────────────────────────────────────────────────────

/// Validator list as delivered to the runtime; addresses are derived from
/// the runtime seed at import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub signer_id: SignerId,
    pub weight: u64,
}

/// Operations on the runtime itself, drained at the head of each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeTx {
    /// Create (or update) the `(entity, signer)` replica.
    ImportReplica {
        entity_id: EntityId,
        signer_id: SignerId,
        threshold: u64,
        validators: Vec<ValidatorSpec>,
    },
    /// Create the jurisdiction mirror under `alias`.
    ImportJ {
        alias: String,
        chain_id: u64,
        depository: EvmAddress,
        entity_provider: EvmAddress,
        block_delay_ms: u64,
    },
    /// Credit an on-chain reserve directly (genesis seeding, scenarios).
    SeedReserve { alias: String, entity: EntityId, token_id: TokenId, amount: Amount },
}

// ── Routed inputs ────────────────────────────────────────────────────────────

/// One routed entity input: `signer = None` fans out to every local replica
/// of the entity (mempool traffic); `Some` targets one replica (consensus
/// traffic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInputRecord {
    pub entity: EntityId,
    pub signer: Option<SignerId>,
    pub msg: EntityMsg,
}

/// The mempool the runtime drains each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInput {
    pub runtime_txs: Vec<RuntimeTx>,
    pub entity_inputs: Vec<EntityInputRecord>,
}

impl RuntimeInput {
    pub fn is_empty(&self) -> bool {
        self.runtime_txs.is_empty() && self.entity_inputs.is_empty()
    }
}

// ── Jurisdiction replica ─────────────────────────────────────────────────────

/// A local mirror of one jurisdiction: the deterministic Depository, its
/// block cadence, and the pending batch submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JReplica {
    pub depository: Depository,
    pub block_delay_ms: u64,
    pub mempool: Vec<JSubmission>,
}

// ── Gossip ───────────────────────────────────────────────────────────────────

/// One gossip entry; writes are monotone by `last_updated` and handlers only
/// read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipProfile {
    pub entity: EntityId,
    pub name: String,
    pub endpoint: String,
    pub last_updated: TimestampMs,
}

// ── Env ──────────────────────────────────────────────────────────────────────

pub struct Env {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub runtime_input: RuntimeInput,
    pub replicas: BTreeMap<(EntityId, SignerId), EntityReplica>,
    pub j_replicas: BTreeMap<String, JReplica>,
    /// Outputs produced this tick, visible next tick.
    pub pending_outputs: Vec<EntityInputRecord>,
    /// Outputs for entities with no local replica, keyed by entity hex.
    /// `Runtime::drain_network_outputs` resolves them to runtime ids once
    /// gossip knows the target's endpoint; the node feeds the result to the
    /// relay.
    pub pending_network_outputs: Vec<(String, EntityInputRecord)>,
    pub gossip: BTreeMap<EntityId, GossipProfile>,
}

impl Env {
    pub fn new() -> Self {
        Self {
            height: 0,
            timestamp: 0,
            runtime_input: RuntimeInput::default(),
            replicas: BTreeMap::new(),
            j_replicas: BTreeMap::new(),
            pending_outputs: Vec::new(),
            pending_network_outputs: Vec::new(),
            gossip: BTreeMap::new(),
        }
    }

    /// Update a gossip entry, honoring the monotone write rule.
    pub fn gossip_write(&mut self, profile: GossipProfile) {
        match self.gossip.get(&profile.entity) {
            Some(existing) if existing.last_updated > profile.last_updated => {}
            _ => {
                self.gossip.insert(profile.entity, profile);
            }
        }
    }

    pub fn replicas_of(&self, entity: &EntityId) -> Vec<SignerId> {
        self.replicas
            .keys()
            .filter(|(e, _)| e == entity)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}
