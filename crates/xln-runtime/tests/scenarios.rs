//! End-to-end scenarios driven through the runtime tick loop: deposits via
//! the jurisdiction, observation consensus, bilateral frames, HTLC
//! timeouts, batch lifecycle, and replay.
//!
//! Run with:
//!   cargo test -p xln-runtime --test scenarios

use xln_core::{Amount, EntityId, EvmAddress};
use xln_crypto::keccak256;
use xln_entity::{canonical_pair, EntityMsg, EntityTx};
use xln_jurisdiction::{BatchStatus, JurisdictionAdapter};
use xln_relay::{Relay, RelayFrame};
use xln_runtime::{
    export_replay, import_replay, EntityInputRecord, GossipProfile, Runtime, RuntimeContext,
    RuntimeTx,
};

const TOKEN: u64 = 1;

// ── Harness ──────────────────────────────────────────────────────────────────

struct Net {
    runtime: Runtime,
    alice: EntityId,
    bob: EntityId,
}

fn setup() -> Net {
    let ctx = RuntimeContext::new(
        "test",
        b"test-seed".to_vec(),
        31337,
        EvmAddress::from_bytes([0xDD; 20]),
        EvmAddress::from_bytes([0xEE; 20]),
    );
    let mut runtime = Runtime::new(ctx, None);
    runtime.set_timestamp(1_000_000);
    runtime.enqueue_runtime_tx(RuntimeTx::ImportJ {
        alias: "main".into(),
        chain_id: 31337,
        depository: EvmAddress::from_bytes([0xDD; 20]),
        entity_provider: EvmAddress::from_bytes([0xEE; 20]),
        block_delay_ms: 1000,
    });
    let alice = runtime.register_single_signer("alice");
    let bob = runtime.register_single_signer("bob");
    runtime.tick().unwrap();
    Net { runtime, alice, bob }
}

impl Net {
    /// Advance `n` ticks, one second apart (each produces a j-block).
    fn run(&mut self, n: usize) {
        for _ in 0..n {
            let next = self.runtime.env.timestamp + 1000;
            self.runtime.set_timestamp(next);
            self.runtime.tick().unwrap();
        }
    }

    fn seed(&mut self, entity: EntityId, amount: i64) {
        self.runtime.enqueue_runtime_tx(RuntimeTx::SeedReserve {
            alias: "main".into(),
            entity,
            token_id: TOKEN,
            amount: Amount::from_i64(amount),
        });
    }

    fn tx(&mut self, entity: EntityId, tx: EntityTx) {
        self.runtime.enqueue_entity_tx(entity, tx);
    }

    fn replica(&self, entity: EntityId) -> &xln_entity::EntityReplica {
        self.runtime
            .env
            .replicas
            .iter()
            .find(|((e, _), _)| *e == entity)
            .map(|(_, r)| r)
            .expect("replica exists")
    }

    fn account<'a>(&'a self, of: EntityId, with: EntityId) -> &'a xln_account::AccountMachine {
        &self.replica(of).state.accounts[&with]
    }

    fn reserve(&self, entity: EntityId) -> Amount {
        self.runtime.env.j_replicas["main"].depository.reserve(&entity, TOKEN)
    }

    /// Open the alice↔bob account and fund it with `amount` collateral
    /// deposited from alice's reserve.
    fn open_and_fund(&mut self, amount: i64) {
        let (alice, bob) = (self.alice, self.bob);
        self.seed(alice, amount);
        self.tx(alice, EntityTx::OpenAccount { counterparty: bob });
        self.run(3);
        assert!(self.replica(alice).state.accounts.contains_key(&bob));
        assert!(self.replica(bob).state.accounts.contains_key(&alice));

        self.tx(
            alice,
            EntityTx::PayFromReserve { counterparty: bob, token_id: TOKEN, amount: Amount::from_i64(amount) },
        );
        self.tx(alice, EntityTx::JBroadcast);
        self.run(8);

        // Both sides observed the settlement and j-synced the row.
        for (side, peer) in [(alice, bob), (bob, alice)] {
            let row = &self.account(side, peer).state.deltas[&TOKEN];
            assert_eq!(row.collateral, Amount::from_i64(amount), "collateral on {side}");
        }
    }
}

// ── S1: direct payment ───────────────────────────────────────────────────────

#[test]
fn s1_direct_payment() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);

    net.tx(
        alice,
        EntityTx::DirectPayment { counterparty: bob, token_id: TOKEN, amount: Amount::from_i64(100) },
    );
    net.run(4);

    let (left, _) = canonical_pair(&alice, &bob);
    let alice_is_left = alice == left;
    let expected_off = if alice_is_left { Amount::from_i64(-100) } else { Amount::from_i64(100) };

    for (side, peer) in [(alice, bob), (bob, alice)] {
        let machine = net.account(side, peer);
        assert!(machine.state.height >= 1, "frame committed on {side}");
        let row = &machine.state.deltas[&TOKEN];
        assert_eq!(row.offdelta, expected_off);
        assert_eq!(row.collateral, Amount::from_i64(1000));
    }

    // Payer can still send 900, payee can send back the received 100.
    let payer_row = &net.account(alice, bob).state.deltas[&TOKEN];
    assert_eq!(payer_row.derive(alice_is_left).out_capacity, Amount::from_i64(900));
    assert_eq!(payer_row.derive(alice_is_left).in_capacity, Amount::from_i64(100));
    let payee_row = &net.account(bob, alice).state.deltas[&TOKEN];
    assert_eq!(payee_row.derive(!alice_is_left).out_capacity, Amount::from_i64(100));
}

// ── S2: HTLC timeout ─────────────────────────────────────────────────────────

#[test]
fn s2_htlc_timeout() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);
    let (left, _) = canonical_pair(&alice, &bob);
    let alice_is_left = alice == left;

    let j_now = net.runtime.env.j_replicas["main"].depository.height();
    let secret = keccak256(b"never revealed");
    let hashlock = keccak256(secret.as_bytes());

    // Bob never learns the secret, so the lock can only time out.
    net.tx(
        alice,
        EntityTx::HtlcPayment {
            route: vec![bob],
            token_id: TOKEN,
            amount: Amount::from_i64(50),
            lock_id: "lock-1".into(),
            hashlock,
            reveal_before_height: j_now + 5,
        },
    );
    net.run(3);

    // The lock is live and holds 50 of the payer's capacity.
    let machine = net.account(alice, bob);
    assert_eq!(machine.state.htlc_locks.len(), 1);
    let row = &machine.state.deltas[&TOKEN];
    assert_eq!(row.derive(alice_is_left).out_capacity, Amount::from_i64(950));

    // Advance past the deadline; the owner sweeps a timeout resolution.
    net.run(8);
    for (side, peer) in [(alice, bob), (bob, alice)] {
        let machine = net.account(side, peer);
        assert!(machine.state.htlc_locks.is_empty(), "lock swept on {side}");
        let row = &machine.state.deltas[&TOKEN];
        assert_eq!(row.offdelta, Amount::zero(), "refund leaves no net flow");
    }
    let row = &net.account(alice, bob).state.deltas[&TOKEN];
    assert_eq!(row.derive(alice_is_left).out_capacity, Amount::from_i64(1000));
}

// ── HTLC happy path: secret revealed and claimed ─────────────────────────────

#[test]
fn htlc_reveal_pays_out() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);
    let (left, _) = canonical_pair(&alice, &bob);
    let alice_is_left = alice == left;

    let secret = keccak256(b"invoice-42");
    let hashlock = keccak256(secret.as_bytes());
    // Bob knows the preimage (the invoice side).
    net.tx(bob, EntityTx::RegisterSecret { secret });
    net.run(2);

    let j_now = net.runtime.env.j_replicas["main"].depository.height();
    net.tx(
        alice,
        EntityTx::HtlcPayment {
            route: vec![bob],
            token_id: TOKEN,
            amount: Amount::from_i64(200),
            lock_id: "lock-2".into(),
            hashlock,
            reveal_before_height: j_now + 30,
        },
    );
    net.run(6);

    for (side, peer) in [(alice, bob), (bob, alice)] {
        let machine = net.account(side, peer);
        assert!(machine.state.htlc_locks.is_empty(), "lock resolved on {side}");
        let row = &machine.state.deltas[&TOKEN];
        let expected =
            if alice_is_left { Amount::from_i64(-200) } else { Amount::from_i64(200) };
        assert_eq!(row.offdelta, expected, "payment landed on {side}");
    }
}

// ── S3: simultaneous proposals ───────────────────────────────────────────────

#[test]
fn s3_simultaneous_proposals() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);

    // Give the right side outgoing capacity as well.
    let (left, right) = canonical_pair(&alice, &bob);
    net.seed(right, 500);
    net.tx(
        right,
        EntityTx::PayFromReserve { counterparty: left, token_id: 2, amount: Amount::from_i64(500) },
    );
    net.tx(right, EntityTx::JBroadcast);
    net.run(8);

    // Both sides pay in the same tick: both propose the same account height.
    net.tx(
        left,
        EntityTx::DirectPayment { counterparty: right, token_id: TOKEN, amount: Amount::from_i64(10) },
    );
    net.tx(
        right,
        EntityTx::DirectPayment { counterparty: left, token_id: 2, amount: Amount::from_i64(20) },
    );
    net.run(6);

    // The left frame won the tiebreaker; the right side rolled back and
    // re-proposed, so both payments landed. (Earlier j-sync rounds may have
    // collided the same way, so the count is at least one.)
    let right_machine = net.account(right, left);
    assert!(right_machine.rollback_count >= 1);
    assert!(right_machine.state.height >= 2);
    for (side, peer) in [(left, right), (right, left)] {
        let state = &net.account(side, peer).state;
        assert_eq!(state.deltas[&TOKEN].offdelta, Amount::from_i64(-10));
        assert_eq!(state.deltas[&2].offdelta, Amount::from_i64(20));
    }
}

// ── S4: cooperative withdrawal compresses to C2R ─────────────────────────────

#[test]
fn s4_withdrawal_compression() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);

    net.tx(
        alice,
        EntityTx::RequestWithdrawal { counterparty: bob, token_id: TOKEN, amount: Amount::from_i64(500) },
    );
    // Three ticks: request committed, counterparty co-signs, signature
    // applied — inspected before the age-based auto-broadcast can fire.
    net.run(3);

    // The co-signed settlement landed as a compact collateralToReserve entry
    // and not as an expanded settlement.
    let batch = &net.replica(alice).state.batch.batch;
    assert_eq!(batch.collateral_to_reserve.len(), 1);
    assert!(batch.settlements.is_empty());
    assert_eq!(batch.collateral_to_reserve[0].amount, Amount::from_i64(500));
    assert_eq!(batch.collateral_to_reserve[0].counterparty, bob);

    // Broadcasting executes it on-chain: half the collateral returns.
    let before = net.reserve(alice);
    net.tx(alice, EntityTx::JBroadcast);
    net.run(6);
    assert_eq!(&net.reserve(alice) - &before, Amount::from_i64(500));
    let row = net.runtime.env.j_replicas["main"]
        .depository
        .collateral_row(&alice, &bob, TOKEN);
    assert_eq!(row.collateral, Amount::from_i64(500));
}

// ── S5 / S6: batch ack and failure ───────────────────────────────────────────

#[test]
fn s5_batch_ack_clears_sent() {
    let mut net = setup();
    let (alice, bob) = (net.alice, net.bob);
    net.seed(alice, 1000);
    net.run(2);

    net.tx(
        alice,
        EntityTx::ReserveToReserve { to: bob, token_id: TOKEN, amount: Amount::from_i64(400) },
    );
    net.tx(alice, EntityTx::JBroadcast);
    net.run(6);

    let batch = &net.replica(alice).state.batch;
    assert!(batch.sent.is_none());
    assert_eq!(batch.status, BatchStatus::Empty);
    assert_eq!(net.reserve(bob), Amount::from_i64(400));
    assert_eq!(net.reserve(alice), Amount::from_i64(600));
}

#[test]
fn s6_batch_failure_requeues() {
    let mut net = setup();
    let (alice, bob) = (net.alice, net.bob);
    net.seed(alice, 100);
    net.run(2);

    // Overdraw: the batch passes hanko checks but reverts during execution.
    net.tx(
        alice,
        EntityTx::ReserveToReserve { to: bob, token_id: TOKEN, amount: Amount::from_i64(400) },
    );
    net.tx(alice, EntityTx::JBroadcast);
    // Four ticks cover broadcast, on-chain failure, and reconciliation while
    // staying inside the age-based retry window.
    net.run(4);

    let batch = &net.replica(alice).state.batch;
    assert!(batch.sent.is_none());
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failed_attempts, 1);
    // The operation is back in the current batch, same order.
    assert_eq!(batch.batch.reserve_to_reserve.len(), 1);
    assert_eq!(batch.batch.reserve_to_reserve[0].amount, Amount::from_i64(400));
    assert_eq!(net.reserve(alice), Amount::from_i64(100));
}

// ── Replay idempotence ───────────────────────────────────────────────────────

#[test]
fn replay_export_import_round_trip() {
    let mut net = setup();
    net.open_and_fund(1000);
    let history: Vec<_> = net.runtime.history.iter().cloned().collect();
    assert!(!history.is_empty());

    let export = export_replay(&history, net.runtime.env.timestamp);
    let json = serde_json::to_string(&export).unwrap();
    let imported = import_replay(&json).unwrap();
    assert_eq!(imported.frames.len(), history.len());

    // Structural equality frame by frame.
    for (a, b) in history.iter().zip(&imported.frames) {
        assert_eq!(
            serde_json::to_value(a).unwrap(),
            serde_json::to_value(b).unwrap()
        );
    }
}

// ── Network outputs & relay ──────────────────────────────────────────────────

#[test]
fn network_outputs_drain_when_gossip_resolves() {
    let mut net = setup();
    let alice = net.alice;
    // An entity with no local replica: the output parks.
    let ghost = EntityId::from_bytes([0x77; 32]);
    net.tx(alice, EntityTx::OpenAccount { counterparty: ghost });
    net.run(2);
    assert!(!net.runtime.env.pending_network_outputs.is_empty());
    // Without a gossip endpoint nothing resolves.
    assert!(net.runtime.drain_network_outputs().is_empty());
    assert!(!net.runtime.env.pending_network_outputs.is_empty());

    net.runtime.env.gossip_write(GossipProfile {
        entity: ghost,
        name: "ghost".into(),
        endpoint: "remote-1".into(),
        last_updated: 1,
    });
    let drained = net.runtime.drain_network_outputs();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].0, "remote-1");
    assert_eq!(drained[0].1.entity, ghost);
    assert!(net.runtime.env.pending_network_outputs.is_empty());
}

#[test]
fn relayed_record_round_trips() {
    // The node's wire path: canonical JSON payload inside a bincode
    // envelope, through a relay that never inspects the payload.
    let record = EntityInputRecord {
        entity: EntityId::from_bytes([0x42; 32]),
        signer: None,
        msg: EntityMsg::Tx { tx: EntityTx::Chat { message: "over the wire".into() } },
    };
    let payload = serde_json::to_vec(&record).unwrap();
    let frame = RelayFrame { from: "runtime-a".into(), to: "runtime-b".into(), payload };

    let mut relay = Relay::new();
    relay.register("runtime-b", None);
    relay.ingest("runtime-a", &frame.to_bytes()).unwrap();

    let delivered = relay.drain("runtime-b");
    assert_eq!(delivered.len(), 1);
    let back: EntityInputRecord = serde_json::from_slice(&delivered[0].payload).unwrap();
    assert_eq!(back, record);
}

// ── Time travel ──────────────────────────────────────────────────────────────

#[test]
fn time_travel_restores_state() {
    let mut net = setup();
    net.open_and_fund(1000);
    let (alice, bob) = (net.alice, net.bob);
    let mark = net.runtime.env.height;
    let height_at_mark = net.account(alice, bob).state.height;

    net.tx(
        alice,
        EntityTx::DirectPayment { counterparty: bob, token_id: TOKEN, amount: Amount::from_i64(100) },
    );
    net.run(4);
    assert!(net.account(alice, bob).state.height > height_at_mark);

    net.runtime.time_travel(mark).unwrap();
    assert_eq!(net.runtime.env.height, mark);
    assert_eq!(net.account(alice, bob).state.height, height_at_mark);
    assert_eq!(
        net.account(alice, bob).state.deltas[&TOKEN].offdelta,
        Amount::zero()
    );
}
