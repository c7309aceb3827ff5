use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{RpcRegistered, RpcReserve, RpcStatus};

/// XLN JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "xln_" via `namespace = "xln"`.
#[rpc(server, namespace = "xln")]
pub trait XlnApi {
    /// Runtime height, timestamp, and replica population.
    #[method(name = "status")]
    async fn status(&self) -> RpcResult<RpcStatus>;

    /// On-chain reserves for an entity (hex entity id).
    #[method(name = "reserves")]
    async fn reserves(&self, entity_id: String) -> RpcResult<Vec<RpcReserve>>;

    /// Current on-chain batch nonce for an entity.
    #[method(name = "nonce")]
    async fn nonce(&self, entity_id: String) -> RpcResult<u64>;

    /// Submit a reserve-to-reserve transfer with caller-supplied hanko data
    /// (hex-encoded canonical JSON).
    #[method(name = "r2r")]
    async fn r2r(
        &self,
        from: String,
        to: String,
        token_id: u64,
        amount: String,
        nonce: u64,
        hanko_data: String,
    ) -> RpcResult<String>;

    /// Import a single-signer entity named after its signer; returns the
    /// entity id.
    #[method(name = "register")]
    async fn register(&self, name: String) -> RpcResult<RpcRegistered>;
}
