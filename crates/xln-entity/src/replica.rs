//! One `(entity, signer)` replica and its BFT round.
//!
//! The proposer for a height drains its mempool onto a working copy,
//! broadcasts the frame with the claimed post-state hash and the list of
//! hashes needing quorum signatures. Validators re-apply, require their own
//! results to match, lock the frame, and precommit one signature per hash.
//! At threshold weight the proposer merges the precommits into quorum
//! hankos, commits, resolves the staged outputs against the witnessed
//! hankos, and notifies validators, who adopt their locked state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use xln_core::{EntityId, Hash32, Height, SignerId, XlnError};
use xln_crypto::{build_quorum_hanko, recover_signer, verify_hanko_for_entity, Hanko, KeyPair};

use crate::config::ConsensusConfig;
use crate::state::{EntityCtx, EntityState, StagedOutput, TxEffects};
use crate::tx::{EntityMsg, EntityTx, JSubmission, ProposedFrameWire, RoutedMessage};

// ── Frames in flight ─────────────────────────────────────────────────────────

/// Proposer-side: the frame awaiting precommits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedFrame {
    pub wire: ProposedFrameWire,
    pub new_state: EntityState,
    pub staged_outputs: Vec<StagedOutput>,
    pub precommits: BTreeMap<SignerId, Vec<xln_core::Signature65>>,
}

/// Validator-side: the frame locked at the current height. A second
/// proposal at the same height is rejected unless its hash matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedFrame {
    pub height: Height,
    pub state_hash: Hash32,
    pub hashes: Vec<Hash32>,
    pub txs: Vec<EntityTx>,
    pub new_state: EntityState,
    pub staged_outputs: Vec<StagedOutput>,
}

// ── EntityReplica ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReplica {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub state: EntityState,
    pub mempool: Vec<EntityTx>,
    pub proposal: Option<ProposedFrame>,
    pub locked: Option<LockedFrame>,
    /// Finalized hash → quorum hanko, for attaching to outputs and proofs.
    pub hanko_witness: BTreeMap<Hash32, Hanko>,
}

impl EntityReplica {
    pub fn new(entity_id: EntityId, signer_id: SignerId, config: ConsensusConfig) -> Self {
        Self {
            entity_id,
            signer_id,
            state: EntityState::new(entity_id, config),
            mempool: Vec::new(),
            proposal: None,
            locked: None,
            hanko_witness: BTreeMap::new(),
        }
    }

    fn keypair(&self, ctx: &EntityCtx) -> KeyPair {
        KeyPair::derive(&ctx.seed, &self.signer_id)
    }

    fn is_proposer_for(&self, height: Height) -> bool {
        *self.state.config.proposer_for(height) == self.signer_id
    }

    fn other_validators(&self) -> Vec<SignerId> {
        self.state
            .config
            .signer_ids()
            .into_iter()
            .filter(|s| *s != self.signer_id)
            .collect()
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    /// Per-tick duties: sweep expired HTLCs into account mempools (every
    /// replica, deterministically), enqueue policy transactions, and — when
    /// we are the proposer — start a frame.
    pub fn tick(&mut self, ctx: &EntityCtx) -> Result<Vec<RoutedMessage>, XlnError> {
        let j_height = self.state.last_finalized_j_height;
        let mut flushes: Vec<EntityTx> = Vec::new();
        for (cp, machine) in self.state.accounts.iter_mut() {
            machine.enqueue_expired_htlcs(j_height);
            if !machine.mempool.is_empty() && machine.pending.is_none() {
                flushes.push(EntityTx::FlushAccount { counterparty: *cp });
            }
        }
        for tx in flushes {
            self.enqueue_tx(tx);
        }

        if self.state.batch.should_auto_broadcast(ctx.timestamp)
            && !self.mempool.contains(&EntityTx::JBroadcast)
        {
            self.enqueue_tx(EntityTx::JBroadcast);
        }

        self.maybe_propose(ctx)
    }

    /// Add a transaction to the mempool (exact duplicates are dropped).
    pub fn enqueue_tx(&mut self, tx: EntityTx) {
        if !self.mempool.contains(&tx) {
            self.mempool.push(tx);
        }
    }

    fn maybe_propose(&mut self, ctx: &EntityCtx) -> Result<Vec<RoutedMessage>, XlnError> {
        let next_height = self.state.height + 1;
        if self.proposal.is_some() || self.mempool.is_empty() || !self.is_proposer_for(next_height)
        {
            return Ok(Vec::new());
        }

        let mut working = self.state.clone();
        let mut effects = TxEffects::default();
        let mut applied = Vec::new();
        for tx in self.mempool.clone() {
            match working.apply_tx(&tx, ctx, &mut effects) {
                Ok(()) => applied.push(tx),
                Err(err) => {
                    warn!(kind = tx.kind(), %err, "evicting failed entity tx");
                    self.mempool.retain(|t| t != &tx);
                }
            }
        }
        if applied.is_empty() {
            return Ok(Vec::new());
        }

        working.height = next_height;
        working.timestamp = ctx.timestamp.max(self.state.timestamp + 1);
        let state_hash = working.state_hash()?;

        let mut hashes = vec![state_hash];
        hashes.extend(effects.hashes_to_sign.iter().copied());

        let wire = ProposedFrameWire {
            height: next_height,
            timestamp: working.timestamp,
            txs: applied,
            state_hash,
            hashes_to_sign: hashes.clone(),
        };

        let keypair = self.keypair(ctx);
        let own_sigs = hashes
            .iter()
            .map(|h| keypair.sign_hash(h))
            .collect::<Result<Vec<_>, _>>()?;

        let mut proposal = ProposedFrame {
            wire: wire.clone(),
            new_state: working,
            staged_outputs: effects.outputs,
            precommits: BTreeMap::new(),
        };
        proposal.precommits.insert(self.signer_id.clone(), own_sigs);
        self.proposal = Some(proposal);
        debug!(height = next_height, txs = wire.txs.len(), "entity frame proposed");

        // Single-signer (or self-sufficient weight) entities commit at once.
        if self.precommit_weight() >= self.state.config.threshold {
            return self.commit_as_proposer(ctx);
        }

        let mut out = Vec::new();
        for signer in self.other_validators() {
            out.push(RoutedMessage::ToReplica {
                entity: self.entity_id,
                signer,
                msg: EntityMsg::Propose { frame: wire.clone(), proposer: self.signer_id.clone() },
            });
        }
        Ok(out)
    }

    // ── Message handling ─────────────────────────────────────────────────────

    pub fn apply_msg(
        &mut self,
        ctx: &EntityCtx,
        msg: EntityMsg,
    ) -> Result<Vec<RoutedMessage>, XlnError> {
        match msg {
            EntityMsg::Tx { tx } => {
                self.enqueue_tx(tx);
                Ok(Vec::new())
            }
            EntityMsg::Propose { frame, proposer } => self.handle_propose(ctx, frame, proposer),
            EntityMsg::Precommit { height, signer_id, sigs } => {
                self.handle_precommit(ctx, height, signer_id, sigs)
            }
            EntityMsg::Commit { height, hankos } => self.handle_commit(ctx, height, hankos),
        }
    }

    fn handle_propose(
        &mut self,
        ctx: &EntityCtx,
        frame: ProposedFrameWire,
        proposer: SignerId,
    ) -> Result<Vec<RoutedMessage>, XlnError> {
        if *self.state.config.proposer_for(frame.height) != proposer {
            return Err(XlnError::Protocol(format!(
                "{proposer} is not the proposer for height {}",
                frame.height
            )));
        }
        if frame.height != self.state.height + 1 {
            debug!(got = frame.height, have = self.state.height, "ignoring stale proposal");
            return Ok(Vec::new());
        }
        if let Some(locked) = &self.locked {
            if locked.height == frame.height && locked.state_hash != frame.state_hash {
                // Never double-precommit at a height.
                return Err(XlnError::ProposalLocked { height: frame.height });
            }
        }

        // Re-apply on our own clone; every transaction the proposer included
        // must succeed and yield the same post-state and hash list.
        let mut working = self.state.clone();
        let mut effects = TxEffects::default();
        for tx in &frame.txs {
            working.apply_tx(tx, ctx, &mut effects).map_err(|err| {
                XlnError::Protocol(format!("proposed tx {} failed locally: {err}", tx.kind()))
            })?;
        }
        working.height = frame.height;
        working.timestamp = frame.timestamp;

        let state_hash = working.state_hash()?;
        if state_hash != frame.state_hash {
            return Err(XlnError::StateHashMismatch { height: frame.height });
        }
        let mut hashes = vec![state_hash];
        hashes.extend(effects.hashes_to_sign.iter().copied());
        if hashes != frame.hashes_to_sign {
            return Err(XlnError::StateInjection("hash list mismatch in proposal".into()));
        }

        let keypair = self.keypair(ctx);
        let sigs = hashes
            .iter()
            .map(|h| keypair.sign_hash(h))
            .collect::<Result<Vec<_>, _>>()?;

        self.locked = Some(LockedFrame {
            height: frame.height,
            state_hash,
            hashes,
            txs: frame.txs,
            new_state: working,
            staged_outputs: effects.outputs,
        });

        Ok(vec![RoutedMessage::ToReplica {
            entity: self.entity_id,
            signer: proposer,
            msg: EntityMsg::Precommit {
                height: frame.height,
                signer_id: self.signer_id.clone(),
                sigs,
            },
        }])
    }

    fn handle_precommit(
        &mut self,
        ctx: &EntityCtx,
        height: Height,
        signer_id: SignerId,
        sigs: Vec<xln_core::Signature65>,
    ) -> Result<Vec<RoutedMessage>, XlnError> {
        let Some(proposal) = &mut self.proposal else {
            return Ok(Vec::new());
        };
        if proposal.wire.height != height {
            return Ok(Vec::new());
        }
        if !self.state.config.is_validator(&signer_id) {
            return Err(XlnError::Protocol(format!("precommit from non-validator {signer_id}")));
        }
        if proposal.precommits.contains_key(&signer_id) {
            return Ok(Vec::new());
        }
        if sigs.len() != proposal.wire.hashes_to_sign.len() {
            return Err(XlnError::Protocol("precommit signature count mismatch".into()));
        }
        let expected = self
            .state
            .config
            .validators
            .iter()
            .find(|v| v.signer_id == signer_id)
            .map(|v| v.address)
            .expect("validator checked above");
        for (hash, sig) in proposal.wire.hashes_to_sign.iter().zip(&sigs) {
            if recover_signer(hash, sig)? != expected {
                return Err(XlnError::Protocol(format!("bad precommit signature from {signer_id}")));
            }
        }
        proposal.precommits.insert(signer_id, sigs);

        if self.precommit_weight() >= self.state.config.threshold {
            return self.commit_as_proposer(ctx);
        }
        Ok(Vec::new())
    }

    fn precommit_weight(&self) -> u64 {
        let Some(proposal) = &self.proposal else { return 0 };
        proposal
            .precommits
            .keys()
            .map(|s| self.state.config.weight_of(s))
            .sum()
    }

    fn commit_as_proposer(&mut self, _ctx: &EntityCtx) -> Result<Vec<RoutedMessage>, XlnError> {
        let proposal = self.proposal.take().expect("commit requires a proposal");
        let config = self.state.config.clone();
        let quorum = config.quorum();
        let signer_ids = config.signer_ids();

        let mut hankos = Vec::with_capacity(proposal.wire.hashes_to_sign.len());
        for (i, hash) in proposal.wire.hashes_to_sign.iter().enumerate() {
            let collected: BTreeMap<SignerId, xln_core::Signature65> = proposal
                .precommits
                .iter()
                .map(|(s, sigs)| (s.clone(), sigs[i]))
                .collect();
            let hanko = build_quorum_hanko(self.entity_id, &quorum, &signer_ids, &collected)?;
            hankos.push((*hash, hanko));
        }

        let height = proposal.wire.height;
        let txs = proposal.wire.txs.clone();
        self.state = proposal.new_state;
        self.hanko_witness.extend(hankos.iter().cloned());
        self.mempool.retain(|tx| !txs.contains(tx));
        self.locked = None;

        let mut out = self.resolve_outputs(proposal.staged_outputs);
        for signer in self.other_validators() {
            out.push(RoutedMessage::ToReplica {
                entity: self.entity_id,
                signer,
                msg: EntityMsg::Commit { height, hankos: hankos.clone() },
            });
        }
        info!(height, txs = txs.len(), "entity frame committed");
        Ok(out)
    }

    fn handle_commit(
        &mut self,
        _ctx: &EntityCtx,
        height: Height,
        hankos: Vec<(Hash32, Hanko)>,
    ) -> Result<Vec<RoutedMessage>, XlnError> {
        let Some(locked) = &self.locked else {
            return Ok(Vec::new());
        };
        if locked.height != height {
            return Ok(Vec::new());
        }
        let addresses = self.state.config.addresses();
        for (hash, hanko) in &hankos {
            verify_hanko_for_entity(hanko, hash, &self.entity_id, Some(&addresses))?;
        }

        let locked = self.locked.take().expect("present above");
        self.state = locked.new_state;
        self.hanko_witness.extend(hankos);
        self.mempool.retain(|tx| !locked.txs.contains(tx));

        // Resolve staged outputs to keep account machines in step with the
        // proposer (sent flags, ack drafts); only the proposer dispatches,
        // so the built messages are dropped here.
        let _ = self.resolve_outputs(locked.staged_outputs);
        debug!(height, "entity frame adopted from commit");
        Ok(Vec::new())
    }

    // ── Output resolution ────────────────────────────────────────────────────

    fn resolve_outputs(&mut self, staged: Vec<StagedOutput>) -> Vec<RoutedMessage> {
        let me = self.entity_id;
        let mut out = Vec::new();
        for item in staged {
            match item {
                StagedOutput::AccountOutbox { counterparty } => {
                    let witness = &self.hanko_witness;
                    let Some(machine) = self.state.accounts.get_mut(&counterparty) else {
                        continue;
                    };
                    if let Some(input) = machine.take_outgoing(&|h| witness.get(h).cloned()) {
                        out.push(RoutedMessage::ToEntity {
                            entity: counterparty,
                            msg: EntityMsg::Tx { tx: EntityTx::AccountInput { input } },
                        });
                    }
                }
                StagedOutput::EntityTxTo { to, tx } => {
                    out.push(RoutedMessage::ToEntity { entity: to, msg: EntityMsg::Tx { tx } });
                }
                StagedOutput::WithdrawalSigned { to, token_id, amount, nonce, hash } => {
                    let Some(hanko) = self.hanko_witness.get(&hash) else {
                        warn!("withdrawal signature hanko missing from witness");
                        continue;
                    };
                    let sig = serde_json::to_vec(hanko).expect("hanko always encodes");
                    out.push(RoutedMessage::ToEntity {
                        entity: to,
                        msg: EntityMsg::Tx {
                            tx: EntityTx::WithdrawalSigned {
                                counterparty: me,
                                token_id,
                                amount,
                                nonce,
                                sig,
                            },
                        },
                    });
                }
                StagedOutput::JBroadcast { nonce, hash } => {
                    let Some(hanko) = self.hanko_witness.get(&hash) else {
                        warn!("batch hanko missing from witness");
                        continue;
                    };
                    let Some(sent) = &self.state.batch.sent else {
                        continue;
                    };
                    out.push(RoutedMessage::ToJurisdiction {
                        submission: JSubmission {
                            entity: me,
                            batch: sent.batch.clone(),
                            hanko: hanko.clone(),
                            nonce,
                        },
                    });
                }
            }
        }
        out
    }
}
