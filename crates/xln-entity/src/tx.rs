//! Entity transactions and the messages replicas exchange.

use serde::{Deserialize, Serialize};

use xln_core::{
    Amount, EntityId, Hash32, Height, SettleDiff, Signature65, SignerId, TimestampMs, TokenId,
};
use xln_crypto::Hanko;
use xln_account::AccountInput;
use xln_jurisdiction::{Batch, JObservation};

// ── EntityTx ─────────────────────────────────────────────────────────────────

/// Every state change of an entity rides through one of these, ordered into
/// entity frames by the BFT round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityTx {
    // ── Governance & bookkeeping ─────────────────────────────────────────────
    /// Register a proposal holding a nested transaction; executes once
    /// approving weight reaches the threshold.
    Propose { proposal_id: String, action: Box<EntityTx> },
    Vote { proposal_id: String, signer_id: SignerId, approve: bool },
    Chat { message: String },
    ProfileUpdate { name: String, endpoint: String },

    // ── Account lifecycle ────────────────────────────────────────────────────
    OpenAccount { counterparty: EntityId },
    DirectPayment { counterparty: EntityId, token_id: TokenId, amount: Amount },
    ExtendCredit { counterparty: EntityId, token_id: TokenId, amount: Amount },
    /// Multi-hop HTLC payment along `route` (first entry is the first hop).
    HtlcPayment {
        route: Vec<EntityId>,
        token_id: TokenId,
        amount: Amount,
        lock_id: String,
        hashlock: Hash32,
        reveal_before_height: Height,
    },
    /// Make a preimage known so an inbound lock for its hashlock can be
    /// claimed (invoice side, and secret back-propagation along a route).
    RegisterSecret { secret: Hash32 },
    /// Fail an inbound lock (downstream failure propagating upstream).
    HtlcCancel { counterparty: EntityId, hashlock: Hash32, reason: String },
    SwapOffer {
        counterparty: EntityId,
        offer_id: String,
        give_token_id: TokenId,
        give_amount: Amount,
        want_token_id: TokenId,
        want_amount: Amount,
        min_fill_ratio: u16,
    },
    SwapCancel { counterparty: EntityId, offer_id: String },
    SwapResolve {
        counterparty: EntityId,
        offer_id: String,
        fill_ratio: u16,
        cancel_remainder: bool,
    },
    SettleHold { counterparty: EntityId, workspace_version: u64, diffs: Vec<SettleDiff> },
    SettleRelease { counterparty: EntityId, workspace_version: u64, diffs: Vec<SettleDiff> },

    /// A bilateral consensus message from a counterparty entity.
    AccountInput { input: AccountInput },
    /// Stage a frame proposal for any transactions queued on this account
    /// (HTLC timeout sweeps and rollback retries ride through this).
    FlushAccount { counterparty: EntityId },

    // ── Withdrawals (collateral → reserve) ──────────────────────────────────
    /// Ask the counterparty to co-sign a cooperative withdrawal.
    RequestWithdrawal { counterparty: EntityId, token_id: TokenId, amount: Amount },
    /// Same handshake under its reserve-facing name.
    PayToReserve { counterparty: EntityId, token_id: TokenId, amount: Amount },
    /// Counterparty-side: a withdrawal request to co-sign.
    WithdrawalRequested {
        counterparty: EntityId,
        token_id: TokenId,
        amount: Amount,
        nonce: u64,
    },
    /// Requester-side: the counterparty's signature came back.
    WithdrawalSigned {
        counterparty: EntityId,
        token_id: TokenId,
        amount: Amount,
        nonce: u64,
        sig: Vec<u8>,
    },

    // ── Jurisdiction ─────────────────────────────────────────────────────────
    /// One signer's observation of a J-block.
    JEvent { observation: JObservation },
    /// A finalized J-event scoped to one account, applied as `j_sync`.
    JEventAccountClaim {
        counterparty: EntityId,
        j_block_number: Height,
        token_id: TokenId,
        collateral: Amount,
        ondelta: Amount,
    },
    /// Deposit reserve into account collateral (credited to this entity).
    PayFromReserve { counterparty: EntityId, token_id: TokenId, amount: Amount },
    ReserveToReserve { to: EntityId, token_id: TokenId, amount: Amount },
    /// Queue a fully-formed settlement for the next batch.
    CreateSettlement {
        counterparty: EntityId,
        diffs: Vec<SettleDiff>,
        forgive_debts_in_token_ids: Vec<TokenId>,
        sig: Vec<u8>,
        nonce: u64,
    },
    /// Force a batch broadcast now.
    JBroadcast,
    /// The adapter refused our submission synchronously; requeue.
    JBatchRefused { nonce: u64, reason: String },
    /// Operator abort: discard current and sent batches.
    JClearBatch,
}

impl EntityTx {
    pub fn kind(&self) -> &'static str {
        match self {
            EntityTx::Propose { .. } => "propose",
            EntityTx::Vote { .. } => "vote",
            EntityTx::Chat { .. } => "chat",
            EntityTx::ProfileUpdate { .. } => "profile_update",
            EntityTx::OpenAccount { .. } => "open_account",
            EntityTx::DirectPayment { .. } => "direct_payment",
            EntityTx::ExtendCredit { .. } => "extend_credit",
            EntityTx::HtlcPayment { .. } => "htlc_payment",
            EntityTx::RegisterSecret { .. } => "register_secret",
            EntityTx::HtlcCancel { .. } => "htlc_cancel",
            EntityTx::SwapOffer { .. } => "swap_offer",
            EntityTx::SwapCancel { .. } => "swap_cancel",
            EntityTx::SwapResolve { .. } => "swap_resolve",
            EntityTx::SettleHold { .. } => "settle_hold",
            EntityTx::SettleRelease { .. } => "settle_release",
            EntityTx::AccountInput { .. } => "account_input",
            EntityTx::FlushAccount { .. } => "flush_account",
            EntityTx::RequestWithdrawal { .. } => "request_withdrawal",
            EntityTx::PayToReserve { .. } => "pay_to_reserve",
            EntityTx::WithdrawalRequested { .. } => "withdrawal_requested",
            EntityTx::WithdrawalSigned { .. } => "withdrawal_signed",
            EntityTx::JEvent { .. } => "j_event",
            EntityTx::JEventAccountClaim { .. } => "j_event_account_claim",
            EntityTx::PayFromReserve { .. } => "pay_from_reserve",
            EntityTx::ReserveToReserve { .. } => "reserve_to_reserve",
            EntityTx::CreateSettlement { .. } => "create_settlement",
            EntityTx::JBroadcast => "j_broadcast",
            EntityTx::JBatchRefused { .. } => "j_batch_refused",
            EntityTx::JClearBatch => "j_clear_batch",
        }
    }
}

// ── Replica wire messages ────────────────────────────────────────────────────

/// A proposed entity frame as sent to validators. Validators re-apply the
/// transactions, require their own computed state hash and hash list to
/// match, and precommit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedFrameWire {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub txs: Vec<EntityTx>,
    pub state_hash: Hash32,
    pub hashes_to_sign: Vec<Hash32>,
}

/// Messages delivered to an entity replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityMsg {
    /// Add a transaction to the replica's mempool.
    Tx { tx: EntityTx },
    /// Proposer → validators.
    Propose { frame: ProposedFrameWire, proposer: SignerId },
    /// Validator → proposer: one signature per hash, hash-list order.
    Precommit { height: Height, signer_id: SignerId, sigs: Vec<Signature65> },
    /// Proposer → validators: quorum reached, adopt the locked frame.
    Commit { height: Height, hankos: Vec<(Hash32, Hanko)> },
}

// ── Routed outputs ───────────────────────────────────────────────────────────

/// A batch submission bound for the jurisdiction mempool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSubmission {
    pub entity: EntityId,
    pub batch: Batch,
    pub hanko: Hanko,
    pub nonce: u64,
}

/// What a replica hands back to the runtime for next-tick routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutedMessage {
    /// Deliver to every replica of `entity`.
    ToEntity { entity: EntityId, msg: EntityMsg },
    /// Deliver to one specific replica (consensus traffic).
    ToReplica { entity: EntityId, signer: SignerId, msg: EntityMsg },
    /// Deliver to the jurisdiction mempool.
    ToJurisdiction { submission: JSubmission },
}
