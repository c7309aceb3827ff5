//! The tick loop.
//!
//! Each tick: drain the runtime mempool, apply runtime transactions,
//! dispatch routed entity inputs, tick every replica, run due jurisdiction
//! replicas, queue all produced outputs for the next tick (no same-tick
//! cascades), and write a snapshot. Determinism: every handler consults
//! `env.timestamp`, which either tracks a real clock in the node binary or
//! is set explicitly by a scenario driver.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use xln_core::{Amount, EntityId, Height, TokenId, XlnError, SNAPSHOT_HISTORY_CAP};
use xln_crypto::{Hanko, KeyPair};
use xln_entity::{
    ConsensusConfig, EntityCtx, EntityMsg, EntityReplica, EntityTx, RoutedMessage, ValidatorEntry,
};
use xln_jurisdiction::{
    Batch, JObservation, JurisdictionAdapter, ReserveToReserve,
};

use crate::context::RuntimeContext;
use crate::env::{
    Env, EntityInputRecord, GossipProfile, JReplica, RuntimeTx, ValidatorSpec,
};
use crate::snapshot::{EnvSnapshot, SnapshotStore};

pub struct Runtime {
    pub ctx: RuntimeContext,
    pub env: Env,
    storage: Option<SnapshotStore>,
    /// In-memory snapshot ring for time travel and replay export.
    pub history: VecDeque<EnvSnapshot>,
}

impl Runtime {
    pub fn new(ctx: RuntimeContext, storage: Option<SnapshotStore>) -> Self {
        Self { ctx, env: Env::new(), storage, history: VecDeque::new() }
    }

    /// Restore from the latest stored snapshot, if any.
    pub fn load_latest(&mut self) -> Result<bool, XlnError> {
        let Some(store) = &self.storage else { return Ok(false) };
        let Some(height) = store.latest_height()? else { return Ok(false) };
        let Some(snapshot) = store.get(height)? else { return Ok(false) };
        snapshot.restore(&mut self.env);
        self.history.push_back(snapshot);
        info!(height, "restored from snapshot");
        Ok(true)
    }

    // ── Input surface ────────────────────────────────────────────────────────

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.env.timestamp = timestamp;
    }

    pub fn enqueue_runtime_tx(&mut self, tx: RuntimeTx) {
        self.env.runtime_input.runtime_txs.push(tx);
    }

    pub fn enqueue_entity_input(&mut self, record: EntityInputRecord) {
        self.env.runtime_input.entity_inputs.push(record);
    }

    pub fn enqueue_entity_tx(&mut self, entity: EntityId, tx: EntityTx) {
        self.enqueue_entity_input(EntityInputRecord {
            entity,
            signer: None,
            msg: EntityMsg::Tx { tx },
        });
    }

    /// Resolve parked network outputs against gossip. Returns
    /// `(target_runtime_id, record)` pairs ready for the relay; entries
    /// whose entity has no gossip endpoint yet stay parked.
    pub fn drain_network_outputs(&mut self) -> Vec<(String, EntityInputRecord)> {
        let gossip = &self.env.gossip;
        let mut resolved = Vec::new();
        self.env.pending_network_outputs.retain(|(_, record)| {
            match gossip.get(&record.entity).filter(|p| !p.endpoint.is_empty()) {
                Some(profile) => {
                    resolved.push((profile.endpoint.clone(), record.clone()));
                    false
                }
                None => true,
            }
        });
        resolved
    }

    /// Convenience for the CLI: import a single-signer entity named after
    /// its signer. Returns the entity id (the signer's padded address).
    pub fn register_single_signer(&mut self, name: &str) -> EntityId {
        let entity_id = EntityId::from_evm_address(&self.ctx.signer_address(name));
        self.enqueue_runtime_tx(RuntimeTx::ImportReplica {
            entity_id,
            signer_id: name.to_string(),
            threshold: 1,
            validators: vec![ValidatorSpec { signer_id: name.to_string(), weight: 1 }],
        });
        entity_id
    }

    /// Direct reserve-to-reserve submission with caller-supplied hanko data
    /// (the CLI `r2r` path).
    pub fn submit_r2r(
        &mut self,
        from: EntityId,
        to: EntityId,
        token_id: TokenId,
        amount: Amount,
        nonce: u64,
        hanko_json: &[u8],
    ) -> Result<(), XlnError> {
        let hanko: Hanko = serde_json::from_slice(hanko_json)
            .map_err(|e| XlnError::Protocol(format!("malformed hanko data: {e}")))?;
        let jr = self
            .env
            .j_replicas
            .values_mut()
            .next()
            .ok_or_else(|| XlnError::Broadcast("no jurisdiction imported".into()))?;
        let mut batch = Batch::default();
        batch.reserve_to_reserve.push(ReserveToReserve {
            receiving_entity: to,
            token_id,
            amount,
        });
        jr.depository.submit_batch(&from, &batch, &hanko, nonce)
    }

    /// A keypair for one of this runtime's signers (CLI signing surface).
    pub fn signer_keypair(&self, signer_id: &str) -> KeyPair {
        KeyPair::derive(&self.ctx.seed, signer_id)
    }

    fn entity_ctx(&self) -> EntityCtx {
        EntityCtx {
            timestamp: self.env.timestamp,
            chain_id: self.ctx.chain_id,
            depository: self.ctx.depository,
            entity_provider: self.ctx.entity_provider,
            seed: self.ctx.seed.clone(),
        }
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    pub fn tick(&mut self) -> Result<(), XlnError> {
        let input = std::mem::take(&mut self.env.runtime_input);
        let ectx = self.entity_ctx();

        // 1. Runtime transactions create or update replicas.
        for tx in input.runtime_txs {
            self.apply_runtime_tx(tx);
        }

        // 2. Last tick's outputs first, then freshly routed inputs.
        let mut inputs: Vec<EntityInputRecord> = std::mem::take(&mut self.env.pending_outputs);
        inputs.extend(input.entity_inputs);

        let mut produced: Vec<RoutedMessage> = Vec::new();
        for record in inputs {
            match &record.signer {
                Some(signer) => {
                    let key = (record.entity, signer.clone());
                    match self.env.replicas.get_mut(&key) {
                        Some(replica) => match replica.apply_msg(&ectx, record.msg) {
                            Ok(mut out) => produced.append(&mut out),
                            Err(err) => {
                                warn!(entity = %record.entity, %signer, %err, "entity input rejected")
                            }
                        },
                        None => self
                            .env
                            .pending_network_outputs
                            .push((record.entity.to_hex(), record.clone())),
                    }
                }
                None => {
                    let signers = self.env.replicas_of(&record.entity);
                    if signers.is_empty() {
                        self.env
                            .pending_network_outputs
                            .push((record.entity.to_hex(), record.clone()));
                        continue;
                    }
                    for signer in signers {
                        let key = (record.entity, signer.clone());
                        let replica = self.env.replicas.get_mut(&key).expect("listed above");
                        match replica.apply_msg(&ectx, record.msg.clone()) {
                            Ok(mut out) => produced.append(&mut out),
                            Err(err) => {
                                warn!(entity = %record.entity, %signer, %err, "entity input rejected")
                            }
                        }
                    }
                }
            }
        }

        // 3. Per-replica duties (sweeps, auto-broadcast, proposing).
        let keys: Vec<_> = self.env.replicas.keys().cloned().collect();
        for key in keys {
            let replica = self.env.replicas.get_mut(&key).expect("key listed");
            match replica.tick(&ectx) {
                Ok(mut out) => produced.append(&mut out),
                Err(err) => warn!(entity = %key.0, signer = %key.1, %err, "replica tick failed"),
            }
        }

        for msg in produced {
            self.route_output(msg);
        }

        // Gossip mirrors committed profiles; writes are monotone.
        let profiles: Vec<GossipProfile> = self
            .env
            .replicas
            .values()
            .filter_map(|r| {
                r.state.profile.as_ref().map(|p| GossipProfile {
                    entity: r.entity_id,
                    name: p.name.clone(),
                    endpoint: p.endpoint.clone(),
                    last_updated: p.last_updated,
                })
            })
            .collect();
        for profile in profiles {
            self.env.gossip_write(profile);
        }

        // 4. Due jurisdiction replicas execute their mempools and produce a
        // block; emitted events come back as next-tick observations.
        self.run_jurisdictions();

        // 5. Snapshot.
        self.env.height += 1;
        let snapshot = EnvSnapshot::capture(&self.env);
        self.history.push_back(snapshot.clone());
        while self.history.len() > SNAPSHOT_HISTORY_CAP {
            self.history.pop_front();
        }
        if let Some(store) = &self.storage {
            if let Err(err) = store.put(&snapshot) {
                // Best-effort durability; memory stays authoritative.
                warn!(%err, "snapshot write failed");
            }
        }
        debug!(height = self.env.height, "tick complete");
        Ok(())
    }

    fn apply_runtime_tx(&mut self, tx: RuntimeTx) {
        match tx {
            RuntimeTx::ImportReplica { entity_id, signer_id, threshold, validators } => {
                let config = ConsensusConfig {
                    threshold,
                    validators: validators
                        .iter()
                        .map(|v| ValidatorEntry {
                            signer_id: v.signer_id.clone(),
                            weight: v.weight,
                            address: self.ctx.signer_address(&v.signer_id),
                        })
                        .collect(),
                };
                let addresses = config.addresses();

                // Multi-signer entities exist on-chain through their board;
                // mirror the EntityProvider registration.
                if config.validators.len() > 1 {
                    for jr in self.env.j_replicas.values_mut() {
                        jr.depository.register_board(entity_id, &config.quorum());
                    }
                }

                let key = (entity_id, signer_id.clone());
                self.env
                    .replicas
                    .entry(key)
                    .or_insert_with(|| EntityReplica::new(entity_id, signer_id, config));

                // The delivered topology: every replica learns every
                // entity's validator addresses.
                let known: Vec<(EntityId, Vec<_>)> = self
                    .env
                    .replicas
                    .values()
                    .map(|r| (r.entity_id, r.state.config.addresses()))
                    .collect();
                for replica in self.env.replicas.values_mut() {
                    for (entity, addrs) in &known {
                        if *entity != replica.entity_id {
                            replica.state.peer_validators.insert(*entity, addrs.clone());
                        }
                    }
                    if entity_id != replica.entity_id {
                        replica.state.peer_validators.insert(entity_id, addresses.clone());
                    }
                }
                info!(entity = %entity_id, "replica imported");
            }

            RuntimeTx::ImportJ { alias, chain_id, depository, entity_provider, block_delay_ms } => {
                use xln_jurisdiction::Depository;
                self.env.j_replicas.entry(alias.clone()).or_insert_with(|| JReplica {
                    depository: Depository::new(chain_id, depository, entity_provider),
                    block_delay_ms,
                    mempool: Vec::new(),
                });
                info!(%alias, "jurisdiction imported");
            }

            RuntimeTx::SeedReserve { alias, entity, token_id, amount } => {
                if let Some(jr) = self.env.j_replicas.get_mut(&alias) {
                    jr.depository.seed_reserve(entity, token_id, amount);
                } else {
                    warn!(%alias, "seed for unknown jurisdiction");
                }
            }
        }
    }

    fn route_output(&mut self, msg: RoutedMessage) {
        match msg {
            RoutedMessage::ToEntity { entity, msg } => {
                let record = EntityInputRecord { entity, signer: None, msg };
                if self.env.replicas_of(&entity).is_empty() {
                    self.env.pending_network_outputs.push((entity.to_hex(), record));
                } else {
                    self.env.pending_outputs.push(record);
                }
            }
            RoutedMessage::ToReplica { entity, signer, msg } => {
                let record = EntityInputRecord { entity, signer: Some(signer), msg };
                self.env.pending_outputs.push(record);
            }
            RoutedMessage::ToJurisdiction { submission } => {
                match self.env.j_replicas.values_mut().next() {
                    Some(jr) => jr.mempool.push(submission),
                    None => warn!("batch submission with no jurisdiction imported"),
                }
            }
        }
    }

    fn run_jurisdictions(&mut self) {
        let aliases: Vec<String> = self.env.j_replicas.keys().cloned().collect();
        for alias in aliases {
            let timestamp = self.env.timestamp;
            let (due, submissions) = {
                let jr = self.env.j_replicas.get_mut(&alias).expect("alias listed");
                let due = jr.depository.last_block_timestamp() + jr.block_delay_ms <= timestamp;
                let submissions = if due { std::mem::take(&mut jr.mempool) } else { Vec::new() };
                (due, submissions)
            };
            if !due {
                continue;
            }

            let mut refusals: Vec<(EntityId, u64, String)> = Vec::new();
            {
                let jr = self.env.j_replicas.get_mut(&alias).expect("alias listed");
                for submission in submissions {
                    if let Err(err) = jr.depository.submit_batch(
                        &submission.entity,
                        &submission.batch,
                        &submission.hanko,
                        submission.nonce,
                    ) {
                        refusals.push((submission.entity, submission.nonce, err.to_string()));
                    }
                }
            }
            for (entity, nonce, reason) in refusals {
                self.env.pending_outputs.push(EntityInputRecord {
                    entity,
                    signer: None,
                    msg: EntityMsg::Tx { tx: EntityTx::JBatchRefused { nonce, reason } },
                });
            }

            let block = {
                let jr = self.env.j_replicas.get_mut(&alias).expect("alias listed");
                jr.depository.produce_block(timestamp)
            };

            // Each monitoring signer reports its own observation.
            let keys: Vec<_> = self.env.replicas.keys().cloned().collect();
            for (entity, signer) in keys {
                let observation = JObservation {
                    signer_id: signer.clone(),
                    j_height: block.number,
                    j_block_hash: block.hash,
                    events: block.events.clone(),
                };
                self.env.pending_outputs.push(EntityInputRecord {
                    entity,
                    signer: Some(signer),
                    msg: EntityMsg::Tx { tx: EntityTx::JEvent { observation } },
                });
            }
        }
    }

    // ── Time travel ──────────────────────────────────────────────────────────

    /// Reset the runtime to the state captured at `height`.
    pub fn time_travel(&mut self, height: Height) -> Result<(), XlnError> {
        let from_history = self.history.iter().find(|s| s.height == height).cloned();
        let snapshot = match from_history {
            Some(s) => s,
            None => match &self.storage {
                Some(store) => store
                    .get(height)?
                    .ok_or_else(|| XlnError::Storage(format!("no snapshot at {height}")))?,
                None => return Err(XlnError::Storage(format!("no snapshot at {height}"))),
            },
        };
        snapshot.restore(&mut self.env);
        while self.history.back().map(|s| s.height > height).unwrap_or(false) {
            self.history.pop_back();
        }
        info!(height, "time travel complete");
        Ok(())
    }
}
