//! Entity state and the transaction apply engine.
//!
//! Handlers run identically on every replica: the proposer applies
//! transactions to a working copy while building a frame, and validators
//! re-apply the same list to check the claimed post-state. Side effects
//! that need quorum signatures are staged as outputs referencing hashes;
//! the commit step resolves them against the witnessed hankos.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

use xln_core::{
    Amount, EntityId, EvmAddress, Hash32, Height, SettleDiff, SignerId, TimestampMs, TokenId,
    XlnError, MESSAGE_LOG_CAP,
};
use xln_crypto::{canonical_hash, keccak256};
use xln_account::{AccountCtx, AccountEvent, AccountMachine, AccountTx, HtlcOutcome};
use xln_jurisdiction::{c2r_hash, JBatchState, JEvent, SettlementOp};

use crate::config::ConsensusConfig;
use crate::tx::EntityTx;

// ── Context & effects ────────────────────────────────────────────────────────

/// Deterministic environment a handler may consult. The seed is replica
/// plumbing for precommit signing; handlers themselves never read it.
#[derive(Debug, Clone)]
pub struct EntityCtx {
    pub timestamp: TimestampMs,
    pub chain_id: u64,
    pub depository: EvmAddress,
    pub entity_provider: EvmAddress,
    pub seed: Vec<u8>,
}

/// An output staged during application; hanko-bearing variants resolve at
/// commit from the witness map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StagedOutput {
    /// Flush this account machine's outgoing message (ack and/or frame).
    AccountOutbox { counterparty: EntityId },
    /// A plain routed entity transaction (self-addressed entries implement
    /// the next-tick follow-up queue).
    EntityTxTo { to: EntityId, tx: EntityTx },
    /// A co-signed withdrawal going back to the requester.
    WithdrawalSigned {
        to: EntityId,
        token_id: TokenId,
        amount: Amount,
        nonce: u64,
        hash: Hash32,
    },
    /// The batch snapshot now in `sent`, awaiting its hanko.
    JBroadcast { nonce: u64, hash: Hash32 },
}

/// Accumulated results of applying one or more transactions.
#[derive(Debug, Clone, Default)]
pub struct TxEffects {
    pub outputs: Vec<StagedOutput>,
    /// Entity frame hash is prepended later; these are account-level and
    /// batch hashes in application order.
    pub hashes_to_sign: Vec<Hash32>,
}

// ── Auxiliary records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovProposal {
    pub action: EntityTx,
    pub votes: BTreeMap<SignerId, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub endpoint: String,
    pub last_updated: TimestampMs,
}

/// Which neighbors an in-flight hashlock connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteHops {
    pub inbound: Option<EntityId>,
    pub outbound: Option<EntityId>,
}

/// Aggregated signer observations of one J-block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSlot {
    pub j_height: Height,
    pub j_block_hash: Hash32,
    pub signers: Vec<SignerId>,
    pub events: Vec<JEvent>,
}

// ── EntityState ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub height: Height,
    pub timestamp: TimestampMs,
    pub config: ConsensusConfig,
    /// Bounded chat/event log.
    pub messages: VecDeque<String>,
    pub proposals: BTreeMap<String, GovProposal>,
    /// On-chain reserve mirror, fed by finalized `ReserveUpdated` events.
    pub reserves: BTreeMap<TokenId, Amount>,
    pub accounts: BTreeMap<EntityId, AccountMachine>,
    pub observations: Vec<ObservationSlot>,
    /// Finalized J-chain as `(number, hash)` pairs.
    pub finalized_j_blocks: Vec<(Height, Hash32)>,
    pub last_finalized_j_height: Height,
    /// On-chain batch nonce mirror, fed by `HankoBatchProcessed`.
    pub on_chain_nonce: u64,
    pub batch: JBatchState,
    /// hashlock → preimage, for invoice claims and back-propagation.
    pub known_secrets: BTreeMap<Hash32, Hash32>,
    /// hashlock → neighbor hops for multi-hop routing.
    pub htlc_routes: BTreeMap<Hash32, RouteHops>,
    /// Known validator addresses of counterparty entities (delivered with
    /// the topology); accounts verify peer hankos against these when
    /// present, self-contained otherwise.
    pub peer_validators: BTreeMap<EntityId, Vec<EvmAddress>>,
    pub profile: Option<Profile>,
}

impl EntityState {
    pub fn new(entity_id: EntityId, config: ConsensusConfig) -> Self {
        Self {
            entity_id,
            height: 0,
            timestamp: 0,
            config,
            messages: VecDeque::new(),
            proposals: BTreeMap::new(),
            reserves: BTreeMap::new(),
            accounts: BTreeMap::new(),
            observations: Vec::new(),
            finalized_j_blocks: Vec::new(),
            last_finalized_j_height: 0,
            on_chain_nonce: 0,
            batch: JBatchState::new(entity_id),
            known_secrets: BTreeMap::new(),
            htlc_routes: BTreeMap::new(),
            peer_validators: BTreeMap::new(),
            profile: None,
        }
    }

    /// Hash of the canonical encoding of the whole state.
    pub fn state_hash(&self) -> Result<Hash32, XlnError> {
        canonical_hash(self)
    }

    fn account_ctx(&self, ctx: &EntityCtx) -> AccountCtx {
        AccountCtx {
            timestamp: ctx.timestamp,
            j_height: self.last_finalized_j_height,
            depository: ctx.depository,
        }
    }

    fn log_message(&mut self, message: String) {
        self.messages.push_back(message);
        while self.messages.len() > MESSAGE_LOG_CAP {
            self.messages.pop_front();
        }
    }

    fn account_mut(&mut self, counterparty: &EntityId) -> Result<&mut AccountMachine, XlnError> {
        self.accounts
            .get_mut(counterparty)
            .ok_or_else(|| XlnError::UnknownAccount(counterparty.to_string()))
    }

    /// Push an account tx and stage a proposal if one can start.
    fn push_and_propose(
        &mut self,
        counterparty: &EntityId,
        tx: AccountTx,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        self.account_mut(counterparty)?.push_tx(tx)?;
        self.stage_account_propose(counterparty, ctx, effects)
    }

    fn stage_account_propose(
        &mut self,
        counterparty: &EntityId,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        let actx = self.account_ctx(ctx);
        let machine = self.account_mut(counterparty)?;
        let outcome = machine.propose(&actx)?;
        if let Some(staged) = outcome.staged {
            effects.hashes_to_sign.push(staged.state_hash);
            effects.hashes_to_sign.push(staged.dispute_hash);
            effects.outputs.push(StagedOutput::AccountOutbox { counterparty: *counterparty });
        }
        let cp = *counterparty;
        self.translate_account_events(&cp, outcome.events, effects);
        Ok(())
    }

    /// Turn bubbled account events into next-tick follow-up transactions on
    /// the canonical input queue.
    fn translate_account_events(
        &mut self,
        counterparty: &EntityId,
        events: Vec<AccountEvent>,
        effects: &mut TxEffects,
    ) {
        let me = self.entity_id;
        for event in events {
            match event {
                AccountEvent::HtlcRevealed { hashlock, secret } => {
                    self.known_secrets.insert(hashlock, secret);
                    effects.outputs.push(StagedOutput::EntityTxTo {
                        to: me,
                        tx: EntityTx::RegisterSecret { secret },
                    });
                }
                AccountEvent::HtlcFailed { hashlock, reason, .. } => {
                    let inbound = self
                        .htlc_routes
                        .get(&hashlock)
                        .and_then(|hops| hops.inbound)
                        .filter(|up| up != counterparty);
                    if let Some(up) = inbound {
                        effects.outputs.push(StagedOutput::EntityTxTo {
                            to: me,
                            tx: EntityTx::HtlcCancel { counterparty: up, hashlock, reason },
                        });
                    }
                }
                AccountEvent::SwapOfferFilled { offer_id, fill_ratio } => {
                    self.log_message(format!("swap {offer_id} filled at {fill_ratio}/65535"));
                }
                AccountEvent::SwapOfferCancelled { offer_id } => {
                    self.log_message(format!("swap {offer_id} cancelled"));
                }
            }
        }
    }

    // ── Apply ────────────────────────────────────────────────────────────────

    pub fn apply_tx(
        &mut self,
        tx: &EntityTx,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        self.apply_tx_inner(tx, ctx, effects, 0)
    }

    fn apply_tx_inner(
        &mut self,
        tx: &EntityTx,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
        depth: u8,
    ) -> Result<(), XlnError> {
        let me = self.entity_id;
        match tx {
            // ── Governance & bookkeeping ─────────────────────────────────────
            EntityTx::Propose { proposal_id, action } => {
                if depth > 0 {
                    return Err(XlnError::Protocol("nested governance proposal".into()));
                }
                if self.proposals.contains_key(proposal_id) {
                    return Err(XlnError::Protocol(format!(
                        "proposal {proposal_id} already exists"
                    )));
                }
                self.proposals.insert(
                    proposal_id.clone(),
                    GovProposal { action: (**action).clone(), votes: BTreeMap::new() },
                );
                Ok(())
            }

            EntityTx::Vote { proposal_id, signer_id, approve } => {
                if !self.config.is_validator(signer_id) {
                    return Err(XlnError::Protocol(format!("{signer_id} is not a validator")));
                }
                let proposal = self
                    .proposals
                    .get_mut(proposal_id)
                    .ok_or_else(|| XlnError::UnknownProposal(proposal_id.clone()))?;
                if proposal.votes.contains_key(signer_id) {
                    return Err(XlnError::DuplicateVote);
                }
                proposal.votes.insert(signer_id.clone(), *approve);

                let approving: u64 = proposal
                    .votes
                    .iter()
                    .filter(|(_, a)| **a)
                    .map(|(s, _)| self.config.weight_of(s))
                    .sum();
                if approving >= self.config.threshold {
                    let action = self
                        .proposals
                        .remove(proposal_id)
                        .expect("present above")
                        .action;
                    info!(%proposal_id, "governance proposal approved; executing");
                    self.apply_tx_inner(&action, ctx, effects, depth + 1)?;
                }
                Ok(())
            }

            EntityTx::Chat { message } => {
                self.log_message(message.clone());
                Ok(())
            }

            EntityTx::ProfileUpdate { name, endpoint } => {
                self.profile = Some(Profile {
                    name: name.clone(),
                    endpoint: endpoint.clone(),
                    last_updated: ctx.timestamp,
                });
                Ok(())
            }

            // ── Account lifecycle ────────────────────────────────────────────
            EntityTx::OpenAccount { counterparty } => {
                if self.accounts.contains_key(counterparty) {
                    return Ok(());
                }
                self.accounts
                    .insert(*counterparty, AccountMachine::new(me, *counterparty));
                effects.outputs.push(StagedOutput::EntityTxTo {
                    to: *counterparty,
                    tx: EntityTx::OpenAccount { counterparty: me },
                });
                debug!(counterparty = %counterparty, "account opened");
                Ok(())
            }

            EntityTx::DirectPayment { counterparty, token_id, amount } => self.push_and_propose(
                counterparty,
                AccountTx::DirectPayment { token_id: *token_id, amount: amount.clone() },
                ctx,
                effects,
            ),

            EntityTx::ExtendCredit { counterparty, token_id, amount } => self.push_and_propose(
                counterparty,
                AccountTx::SetCreditLimit { token_id: *token_id, amount: amount.clone() },
                ctx,
                effects,
            ),

            EntityTx::HtlcPayment {
                route,
                token_id,
                amount,
                lock_id,
                hashlock,
                reveal_before_height,
            } => {
                let first = route
                    .first()
                    .ok_or_else(|| XlnError::Protocol("empty htlc route".into()))?;
                let envelope = if route.len() > 1 {
                    Some(encode_route(&route[1..]))
                } else {
                    None
                };
                self.htlc_routes.insert(
                    *hashlock,
                    RouteHops { inbound: None, outbound: Some(*first) },
                );
                self.push_and_propose(
                    &first.clone(),
                    AccountTx::HtlcLock {
                        lock_id: lock_id.clone(),
                        hashlock: *hashlock,
                        timelock: ctx.timestamp,
                        reveal_before_height: *reveal_before_height,
                        amount: amount.clone(),
                        token_id: *token_id,
                        envelope,
                    },
                    ctx,
                    effects,
                )
            }

            EntityTx::RegisterSecret { secret } => {
                let hashlock = keccak256(secret.as_bytes());
                self.known_secrets.insert(hashlock, *secret);
                // Claim every inbound lock for this hashlock.
                let claimable: Vec<(EntityId, String)> = self
                    .accounts
                    .iter()
                    .flat_map(|(cp, machine)| {
                        let mine = machine.is_left();
                        machine
                            .state
                            .htlc_locks
                            .values()
                            .filter(move |l| l.hashlock == hashlock && l.by_left != mine)
                            .map(|l| (*cp, l.lock_id.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                for (cp, lock_id) in claimable {
                    self.push_and_propose(
                        &cp,
                        AccountTx::HtlcResolve {
                            lock_id,
                            outcome: HtlcOutcome::Secret { secret: *secret },
                        },
                        ctx,
                        effects,
                    )?;
                }
                Ok(())
            }

            EntityTx::HtlcCancel { counterparty, hashlock, reason } => {
                let lock_id = {
                    let machine = self.account_mut(counterparty)?;
                    let mine = machine.is_left();
                    machine
                        .state
                        .htlc_locks
                        .values()
                        .find(|l| l.hashlock == *hashlock && l.by_left != mine)
                        .map(|l| l.lock_id.clone())
                };
                match lock_id {
                    Some(lock_id) => self.push_and_propose(
                        counterparty,
                        AccountTx::HtlcResolve {
                            lock_id,
                            outcome: HtlcOutcome::Error { reason: reason.clone() },
                        },
                        ctx,
                        effects,
                    ),
                    None => Ok(()),
                }
            }

            EntityTx::SwapOffer {
                counterparty,
                offer_id,
                give_token_id,
                give_amount,
                want_token_id,
                want_amount,
                min_fill_ratio,
            } => self.push_and_propose(
                counterparty,
                AccountTx::SwapOffer {
                    offer_id: offer_id.clone(),
                    give_token_id: *give_token_id,
                    give_amount: give_amount.clone(),
                    want_token_id: *want_token_id,
                    want_amount: want_amount.clone(),
                    min_fill_ratio: *min_fill_ratio,
                },
                ctx,
                effects,
            ),

            EntityTx::SwapCancel { counterparty, offer_id } => self.push_and_propose(
                counterparty,
                AccountTx::SwapCancel { offer_id: offer_id.clone() },
                ctx,
                effects,
            ),

            EntityTx::SwapResolve { counterparty, offer_id, fill_ratio, cancel_remainder } => {
                self.push_and_propose(
                    counterparty,
                    AccountTx::SwapResolve {
                        offer_id: offer_id.clone(),
                        fill_ratio: *fill_ratio,
                        cancel_remainder: *cancel_remainder,
                    },
                    ctx,
                    effects,
                )
            }

            EntityTx::SettleHold { counterparty, workspace_version, diffs } => self
                .push_and_propose(
                    counterparty,
                    AccountTx::SettleHold {
                        workspace_version: *workspace_version,
                        diffs: diffs.clone(),
                    },
                    ctx,
                    effects,
                ),

            EntityTx::SettleRelease { counterparty, workspace_version, diffs } => self
                .push_and_propose(
                    counterparty,
                    AccountTx::SettleRelease {
                        workspace_version: *workspace_version,
                        diffs: diffs.clone(),
                    },
                    ctx,
                    effects,
                ),

            EntityTx::AccountInput { input } => self.handle_account_input(input, ctx, effects),

            EntityTx::FlushAccount { counterparty } => {
                self.stage_account_propose(counterparty, ctx, effects)
            }

            // ── Withdrawals ──────────────────────────────────────────────────
            EntityTx::RequestWithdrawal { counterparty, token_id, amount }
            | EntityTx::PayToReserve { counterparty, token_id, amount } => {
                let nonce = self.account_mut(counterparty)?.state.last_settlement_nonce + 1;
                effects.outputs.push(StagedOutput::EntityTxTo {
                    to: *counterparty,
                    tx: EntityTx::WithdrawalRequested {
                        counterparty: me,
                        token_id: *token_id,
                        amount: amount.clone(),
                        nonce,
                    },
                });
                Ok(())
            }

            EntityTx::WithdrawalRequested { counterparty, token_id, amount, nonce } => {
                // `counterparty` is the withdrawer asking for our signature.
                if !amount.is_positive() {
                    return Err(XlnError::NonPositiveAmount);
                }
                self.account_mut(counterparty)?;
                let hash =
                    c2r_hash(counterparty, &me, *token_id, amount, *nonce, &ctx.depository);
                effects.hashes_to_sign.push(hash);
                effects.outputs.push(StagedOutput::WithdrawalSigned {
                    to: *counterparty,
                    token_id: *token_id,
                    amount: amount.clone(),
                    nonce: *nonce,
                    hash,
                });
                Ok(())
            }

            EntityTx::WithdrawalSigned { counterparty, token_id, amount, nonce, sig } => {
                let (left, right) = canonical_pair(&me, counterparty);
                let by_left = me == left;
                let diff = SettleDiff {
                    token_id: *token_id,
                    left_diff: if by_left { amount.clone() } else { Amount::zero() },
                    right_diff: if by_left { Amount::zero() } else { amount.clone() },
                    collateral_diff: -amount.clone(),
                    ondelta_diff: if by_left { -amount.clone() } else { Amount::zero() },
                };
                self.batch.add_settlement(SettlementOp {
                    left_entity: left,
                    right_entity: right,
                    diffs: vec![diff],
                    forgive_debts_in_token_ids: vec![],
                    sig: sig.clone(),
                    entity_provider: ctx.entity_provider,
                    hanko_data: vec![],
                    nonce: *nonce,
                })?;
                self.account_mut(counterparty)?.state.last_settlement_nonce = *nonce;
                Ok(())
            }

            // ── Jurisdiction ─────────────────────────────────────────────────
            EntityTx::JEvent { observation } => self.handle_observation(observation, effects),

            EntityTx::JEventAccountClaim {
                counterparty,
                j_block_number,
                token_id,
                collateral,
                ondelta,
            } => {
                self.accounts
                    .entry(*counterparty)
                    .or_insert_with(|| AccountMachine::new(me, *counterparty));
                self.push_and_propose(
                    counterparty,
                    AccountTx::JSync {
                        j_block_number: *j_block_number,
                        token_id: *token_id,
                        collateral: collateral.clone(),
                        ondelta: ondelta.clone(),
                    },
                    ctx,
                    effects,
                )
            }

            EntityTx::PayFromReserve { counterparty, token_id, amount } => {
                self.batch
                    .add_reserve_to_collateral(me, *counterparty, *token_id, amount.clone())
            }

            EntityTx::ReserveToReserve { to, token_id, amount } => {
                self.batch.add_reserve_to_reserve(*to, *token_id, amount.clone())
            }

            EntityTx::CreateSettlement {
                counterparty,
                diffs,
                forgive_debts_in_token_ids,
                sig,
                nonce,
            } => {
                let (left, right) = canonical_pair(&me, counterparty);
                self.batch.add_settlement(SettlementOp {
                    left_entity: left,
                    right_entity: right,
                    diffs: diffs.clone(),
                    forgive_debts_in_token_ids: forgive_debts_in_token_ids.clone(),
                    sig: sig.clone(),
                    entity_provider: ctx.entity_provider,
                    hanko_data: vec![],
                    nonce: *nonce,
                })
            }

            EntityTx::JBroadcast => {
                let prepared = self.batch.prepare_broadcast(
                    ctx.chain_id,
                    &ctx.depository,
                    self.on_chain_nonce,
                )?;
                self.batch.mark_sent(&prepared, ctx.timestamp);
                effects.hashes_to_sign.push(prepared.batch_hash);
                effects.outputs.push(StagedOutput::JBroadcast {
                    nonce: prepared.nonce,
                    hash: prepared.batch_hash,
                });
                Ok(())
            }

            EntityTx::JBatchRefused { nonce, reason } => {
                warn!(nonce, %reason, "jurisdiction refused batch; requeueing");
                self.batch.reconcile(*nonce, false);
                Ok(())
            }

            EntityTx::JClearBatch => {
                self.batch.clear();
                Ok(())
            }
        }
    }

    // ── Account input routing ────────────────────────────────────────────────

    fn handle_account_input(
        &mut self,
        input: &xln_account::AccountInput,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        let me = self.entity_id;
        let cp = input.from_entity;
        if input.to_entity != me {
            return Err(XlnError::Protocol("account input addressed elsewhere".into()));
        }
        self.accounts
            .entry(cp)
            .or_insert_with(|| AccountMachine::new(me, cp));

        let actx = self.account_ctx(ctx);
        let peer_validators = self.peer_validators.get(&cp).cloned();
        let outcome = {
            let machine = self.accounts.get_mut(&cp).expect("inserted above");
            machine.handle_input(&actx, input, peer_validators.as_deref())?
        };

        for hash in &outcome.to_sign {
            effects.hashes_to_sign.push(*hash);
        }
        if !outcome.to_sign.is_empty() {
            effects.outputs.push(StagedOutput::AccountOutbox { counterparty: cp });
        }
        self.translate_account_events(&cp, outcome.events.clone(), effects);

        // Forward freshly committed inbound locks along their route.
        if outcome.committed_height.is_some() && input.proposal.is_some() {
            self.forward_committed_locks(&cp, ctx, effects)?;
        }

        // Chain our own next frame (new mempool items, or txs returned by a
        // rollback) into the same reply.
        self.stage_account_propose(&cp, ctx, effects)?;
        Ok(())
    }

    /// Inspect the newest committed frame on the account with `cp` for
    /// peer-placed locks carrying a routing envelope, and either forward to
    /// the next hop or claim with a known secret.
    fn forward_committed_locks(
        &mut self,
        cp: &EntityId,
        ctx: &EntityCtx,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        let me = self.entity_id;
        let inbound_locks: Vec<AccountTx> = {
            let machine = self.account_mut(cp)?;
            let mine = machine.is_left();
            match machine.frames.back() {
                Some(frame) if frame.by_left != mine => frame
                    .account_txs
                    .iter()
                    .filter(|tx| matches!(tx, AccountTx::HtlcLock { .. }))
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            }
        };

        for tx in inbound_locks {
            let AccountTx::HtlcLock {
                hashlock,
                reveal_before_height,
                amount,
                token_id,
                envelope,
                lock_id,
                ..
            } = tx
            else {
                continue;
            };

            let remaining = envelope.as_deref().map(decode_route).transpose()?.unwrap_or_default();
            if remaining.is_empty() {
                // We are the recipient; claim if the invoice secret is known.
                if let Some(secret) = self.known_secrets.get(&hashlock).copied() {
                    self.push_and_propose(
                        cp,
                        AccountTx::HtlcResolve {
                            lock_id,
                            outcome: HtlcOutcome::Secret { secret },
                        },
                        ctx,
                        effects,
                    )?;
                }
                continue;
            }

            let next = remaining[0];
            if !self.accounts.contains_key(&next) {
                effects.outputs.push(StagedOutput::EntityTxTo {
                    to: me,
                    tx: EntityTx::HtlcCancel {
                        counterparty: *cp,
                        hashlock,
                        reason: "no route to next hop".into(),
                    },
                });
                continue;
            }

            self.htlc_routes.insert(
                hashlock,
                RouteHops { inbound: Some(*cp), outbound: Some(next) },
            );
            let onward_envelope =
                if remaining.len() > 1 { Some(encode_route(&remaining[1..])) } else { None };
            self.push_and_propose(
                &next,
                AccountTx::HtlcLock {
                    lock_id: format!("{lock_id}:{me}"),
                    hashlock,
                    timelock: ctx.timestamp,
                    // Each hop shortens the deadline by one J-block.
                    reveal_before_height: reveal_before_height.saturating_sub(1),
                    amount,
                    token_id,
                    envelope: onward_envelope,
                },
                ctx,
                effects,
            )?;
        }
        Ok(())
    }

    // ── J-block observation consensus ────────────────────────────────────────

    fn handle_observation(
        &mut self,
        observation: &xln_jurisdiction::JObservation,
        effects: &mut TxEffects,
    ) -> Result<(), XlnError> {
        if !self.config.is_validator(&observation.signer_id) {
            return Err(XlnError::Protocol(format!(
                "observation from non-validator {}",
                observation.signer_id
            )));
        }
        if observation.j_height <= self.last_finalized_j_height {
            return Ok(());
        }

        let slot_idx = match self.observations.iter().position(|s| {
            s.j_height == observation.j_height && s.j_block_hash == observation.j_block_hash
        }) {
            Some(i) => i,
            None => {
                self.observations.push(ObservationSlot {
                    j_height: observation.j_height,
                    j_block_hash: observation.j_block_hash,
                    signers: Vec::new(),
                    events: observation.events.clone(),
                });
                self.observations.len() - 1
            }
        };
        if self.observations[slot_idx].signers.contains(&observation.signer_id) {
            return Ok(());
        }
        self.observations[slot_idx].signers.push(observation.signer_id.clone());

        let weight: u64 = self.observations[slot_idx]
            .signers
            .iter()
            .map(|s| self.config.weight_of(s))
            .sum();
        if weight < self.config.threshold {
            return Ok(());
        }

        // Finalize.
        let slot = self.observations.remove(slot_idx);
        self.observations.retain(|s| s.j_height > slot.j_height);
        self.finalized_j_blocks.push((slot.j_height, slot.j_block_hash));
        self.last_finalized_j_height = slot.j_height;
        info!(j_height = slot.j_height, events = slot.events.len(), "j-block finalized");

        let me = self.entity_id;
        for event in &slot.events {
            match event {
                JEvent::ReserveUpdated { entity, token_id, new_balance } if *entity == me => {
                    self.reserves.insert(*token_id, new_balance.clone());
                }
                JEvent::AccountSettled { left, right, token_id, collateral, ondelta }
                    if *left == me || *right == me =>
                {
                    let counterparty = if *left == me { *right } else { *left };
                    effects.outputs.push(StagedOutput::EntityTxTo {
                        to: me,
                        tx: EntityTx::JEventAccountClaim {
                            counterparty,
                            j_block_number: slot.j_height,
                            token_id: *token_id,
                            collateral: collateral.clone(),
                            ondelta: ondelta.clone(),
                        },
                    });
                }
                JEvent::HankoBatchProcessed { entity, nonce, success } if *entity == me => {
                    self.on_chain_nonce = self.on_chain_nonce.max(*nonce);
                    self.batch.reconcile(*nonce, *success);
                }
                JEvent::SecretRevealed { secret, .. } => {
                    effects.outputs.push(StagedOutput::EntityTxTo {
                        to: me,
                        tx: EntityTx::RegisterSecret { secret: *secret },
                    });
                }
                JEvent::DisputeStarted { initiator, counterentity, nonce }
                    if *counterentity == me =>
                {
                    self.log_message(format!(
                        "dispute started against us by {initiator} (nonce {nonce})"
                    ));
                }
                JEvent::DisputeFinalized { left, right } if *left == me || *right == me => {
                    let counterparty = if *left == me { right } else { left };
                    self.log_message(format!("dispute with {counterparty} finalized"));
                }
                JEvent::DebtCreated { debtor, creditor, token_id, amount } if *debtor == me => {
                    self.log_message(format!(
                        "debt of {amount} on token {token_id} created toward {creditor}"
                    ));
                }
                JEvent::DebtEnforced { debtor, token_id, amount, .. } if *debtor == me => {
                    self.log_message(format!("debt of {amount} on token {token_id} enforced"));
                }
                JEvent::InsuranceRegistered { insured, token_id, amount, .. }
                    if *insured == me =>
                {
                    self.log_message(format!(
                        "insurance of {amount} registered on token {token_id}"
                    ));
                }
                JEvent::InsuranceClaimed { insured, token_id, amount, .. } if *insured == me => {
                    self.log_message(format!("insurance of {amount} claimed on token {token_id}"));
                }
                JEvent::InsuranceExpired { insured, token_id, .. } if *insured == me => {
                    self.log_message(format!("insurance expired on token {token_id}"));
                }
                JEvent::GovernanceEnabled { entity } if *entity == me => {
                    self.log_message("governance enabled on-chain".to_string());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub fn canonical_pair(a: &EntityId, b: &EntityId) -> (EntityId, EntityId) {
    if a < b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

fn encode_route(route: &[EntityId]) -> String {
    serde_json::to_string(route).expect("entity id list always encodes")
}

fn decode_route(envelope: &str) -> Result<Vec<EntityId>, XlnError> {
    serde_json::from_str(envelope)
        .map_err(|e| XlnError::Protocol(format!("malformed routing envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorEntry;
    use xln_jurisdiction::JObservation;

    fn ctx() -> EntityCtx {
        EntityCtx {
            timestamp: 1_000_000,
            chain_id: 31337,
            depository: EvmAddress::from_bytes([0xDD; 20]),
            entity_provider: EvmAddress::from_bytes([0xEE; 20]),
            seed: b"test-seed".to_vec(),
        }
    }

    fn state_of(signers: &[&str], threshold: u64) -> EntityState {
        let config = ConsensusConfig {
            threshold,
            validators: signers
                .iter()
                .enumerate()
                .map(|(i, s)| ValidatorEntry {
                    signer_id: s.to_string(),
                    weight: 1,
                    address: EvmAddress::from_bytes([i as u8 + 1; 20]),
                })
                .collect(),
        };
        EntityState::new(EntityId::from_bytes([0xE1; 32]), config)
    }

    #[test]
    fn governance_executes_at_threshold() {
        let mut state = state_of(&["s0", "s1", "s2"], 2);
        let mut effects = TxEffects::default();

        state
            .apply_tx(
                &EntityTx::Propose {
                    proposal_id: "p1".into(),
                    action: Box::new(EntityTx::Chat { message: "approved!".into() }),
                },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        assert!(state.proposals.contains_key("p1"));

        state
            .apply_tx(
                &EntityTx::Vote { proposal_id: "p1".into(), signer_id: "s0".into(), approve: true },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        assert!(state.messages.is_empty());

        state
            .apply_tx(
                &EntityTx::Vote { proposal_id: "p1".into(), signer_id: "s1".into(), approve: true },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        // Executed and destroyed on commit.
        assert_eq!(state.messages.back().unwrap(), "approved!");
        assert!(state.proposals.is_empty());
    }

    #[test]
    fn duplicate_vote_rejected() {
        let mut state = state_of(&["s0", "s1", "s2"], 3);
        let mut effects = TxEffects::default();
        state
            .apply_tx(
                &EntityTx::Propose {
                    proposal_id: "p1".into(),
                    action: Box::new(EntityTx::Chat { message: "m".into() }),
                },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        state
            .apply_tx(
                &EntityTx::Vote { proposal_id: "p1".into(), signer_id: "s0".into(), approve: true },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        let err = state
            .apply_tx(
                &EntityTx::Vote { proposal_id: "p1".into(), signer_id: "s0".into(), approve: false },
                &ctx(),
                &mut effects,
            )
            .unwrap_err();
        assert!(matches!(err, XlnError::DuplicateVote));
    }

    #[test]
    fn observations_finalize_at_threshold() {
        let mut state = state_of(&["s0", "s1", "s2"], 2);
        let mut effects = TxEffects::default();
        let me = state.entity_id;
        let block_hash = Hash32::from_bytes([0xB1; 32]);
        let events = vec![JEvent::ReserveUpdated {
            entity: me,
            token_id: 1,
            new_balance: Amount::from_i64(777),
        }];

        let obs = |signer: &str| EntityTx::JEvent {
            observation: JObservation {
                signer_id: signer.to_string(),
                j_height: 1,
                j_block_hash: block_hash,
                events: events.clone(),
            },
        };

        state.apply_tx(&obs("s0"), &ctx(), &mut effects).unwrap();
        assert_eq!(state.last_finalized_j_height, 0);
        assert!(state.reserves.is_empty());

        state.apply_tx(&obs("s1"), &ctx(), &mut effects).unwrap();
        assert_eq!(state.last_finalized_j_height, 1);
        assert_eq!(state.finalized_j_blocks, vec![(1, block_hash)]);
        assert_eq!(state.reserves[&1], Amount::from_i64(777));

        // A non-validator's observation is refused.
        let err = state.apply_tx(&obs("mallory"), &ctx(), &mut effects).unwrap_err();
        assert!(matches!(err, XlnError::Protocol(_)));
    }

    #[test]
    fn broadcast_then_refusal_requeues() {
        let mut state = state_of(&["s0"], 1);
        let mut effects = TxEffects::default();
        let to = EntityId::from_bytes([0x02; 32]);

        state
            .apply_tx(
                &EntityTx::ReserveToReserve { to, token_id: 1, amount: Amount::from_i64(10) },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        state.apply_tx(&EntityTx::JBroadcast, &ctx(), &mut effects).unwrap();
        assert!(state.batch.sent.is_some());
        assert!(state.batch.batch.is_empty());
        assert_eq!(effects.hashes_to_sign.len(), 1);
        assert!(matches!(effects.outputs.last(), Some(StagedOutput::JBroadcast { nonce: 1, .. })));

        state
            .apply_tx(
                &EntityTx::JBatchRefused { nonce: 1, reason: "nonce race".into() },
                &ctx(),
                &mut effects,
            )
            .unwrap();
        assert!(state.batch.sent.is_none());
        assert_eq!(state.batch.batch.reserve_to_reserve.len(), 1);
        assert_eq!(state.batch.failed_attempts, 1);
    }

    #[test]
    fn open_account_is_idempotent() {
        let mut state = state_of(&["s0"], 1);
        let mut effects = TxEffects::default();
        let peer = EntityId::from_bytes([0x02; 32]);

        state
            .apply_tx(&EntityTx::OpenAccount { counterparty: peer }, &ctx(), &mut effects)
            .unwrap();
        assert_eq!(effects.outputs.len(), 1);
        state
            .apply_tx(&EntityTx::OpenAccount { counterparty: peer }, &ctx(), &mut effects)
            .unwrap();
        // No second notification for an existing account.
        assert_eq!(effects.outputs.len(), 1);
        assert!(state.accounts.contains_key(&peer));
    }
}
