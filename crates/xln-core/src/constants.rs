//! ─── XLN Protocol Constants ─────────────────────────────────────────────────
//!
//! Bounds and domain parameters shared by every layer of the stack.
//! Monetary supply is a jurisdiction concern; nothing here mints value.

// ── Account machine bounds ───────────────────────────────────────────────────

/// Maximum pending account transactions per bilateral mempool.
pub const ACCOUNT_MEMPOOL_MAX: usize = 1000;

/// Maximum account transactions per frame.
pub const FRAME_TX_MAX: usize = 100;

/// Maximum canonical-encoded frame size in bytes (1 MiB).
pub const FRAME_MAX_ENCODED_BYTES: usize = 1024 * 1024;

/// Account frame history retained per account (ring).
pub const FRAME_HISTORY_CAP: usize = 10;

/// Permitted timestamp drift between counterparties (±5 minutes).
pub const TIMESTAMP_DRIFT_MAX_MS: u64 = 5 * 60 * 1000;

// ── Entity machine bounds ────────────────────────────────────────────────────

/// Entity message log capacity (ring).
pub const MESSAGE_LOG_CAP: usize = 10;

// ── Jurisdiction batching ────────────────────────────────────────────────────

/// Operation count that triggers an automatic batch broadcast.
pub const BATCH_AUTO_BROADCAST_OPS: usize = 50;

/// Elapsed milliseconds since last broadcast that trigger an automatic
/// broadcast of a non-empty batch.
pub const BATCH_AUTO_BROADCAST_MS: u64 = 5000;

/// Domain separator mixed into every batch hanko hash.
pub const HANKO_DOMAIN_SEPARATOR: &str = "XLN_DEPOSITORY_HANKO_V1";

/// Gas limit supplied with `processBatch` submissions.
pub const PROCESS_BATCH_GAS_LIMIT: u64 = 5_000_000;

// ── Relay bounds ─────────────────────────────────────────────────────────────

/// Per-client pending message queue cap.
pub const RELAY_CLIENT_QUEUE_CAP: usize = 200;

/// Global relay debug event ring cap.
pub const RELAY_DEBUG_EVENTS_CAP: usize = 5000;

// ── Snapshot / replay ────────────────────────────────────────────────────────

/// Replay export format version. Imports reject unknown major versions.
pub const REPLAY_EXPORT_VERSION: &str = "1.0.0";

/// Snapshot history ring capacity held in memory for time travel.
pub const SNAPSHOT_HISTORY_CAP: usize = 1024;
