use serde::{Deserialize, Serialize};

/// Runtime summary returned by `xln_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub runtime_id: String,
    pub height: u64,
    pub timestamp: u64,
    pub replica_count: usize,
    /// Finalized J-height per jurisdiction alias.
    pub j_heights: Vec<(String, u64)>,
}

/// One reserve row (amount is a decimal string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReserve {
    pub token_id: u64,
    pub amount: String,
}

/// Result of `xln_register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRegistered {
    pub entity_id: String,
}
