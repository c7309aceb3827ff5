use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use xln_core::{Amount, EntityId, TokenId, XlnError};
use xln_jurisdiction::JurisdictionAdapter;
use xln_runtime::Runtime;

use crate::api::XlnApiServer;
use crate::types::{RpcRegistered, RpcReserve, RpcStatus};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

fn parse_entity(s: &str) -> Result<EntityId, ErrorObject<'static>> {
    EntityId::from_hex(s).map_err(|_| rpc_err(-32602, format!("invalid entity id: {s}")))
}

/// Shared state behind the RPC surface: the runtime under a mutex, locked
/// briefly per call (ticks run on the node's own cadence).
pub struct RpcServerState {
    pub runtime: Arc<Mutex<Runtime>>,
    /// Token ids to report in `reserves` responses.
    pub known_tokens: Vec<TokenId>,
}

pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server listening");
        Ok(handle)
    }
}

#[async_trait]
impl XlnApiServer for RpcServer {
    async fn status(&self) -> RpcResult<RpcStatus> {
        let runtime = self.state.runtime.lock().expect("runtime lock");
        Ok(RpcStatus {
            runtime_id: runtime.ctx.runtime_id.clone(),
            height: runtime.env.height,
            timestamp: runtime.env.timestamp,
            replica_count: runtime.env.replicas.len(),
            j_heights: runtime
                .env
                .j_replicas
                .iter()
                .map(|(alias, jr)| (alias.clone(), jr.depository.height()))
                .collect(),
        })
    }

    async fn reserves(&self, entity_id: String) -> RpcResult<Vec<RpcReserve>> {
        let entity = parse_entity(&entity_id)?;
        let runtime = self.state.runtime.lock().expect("runtime lock");
        let Some(jr) = runtime.env.j_replicas.values().next() else {
            return Err(rpc_err(-32000, "no jurisdiction imported"));
        };
        Ok(self
            .state
            .known_tokens
            .iter()
            .map(|token_id| RpcReserve {
                token_id: *token_id,
                amount: jr.depository.reserve(&entity, *token_id).to_decimal(),
            })
            .collect())
    }

    async fn nonce(&self, entity_id: String) -> RpcResult<u64> {
        let entity = parse_entity(&entity_id)?;
        let runtime = self.state.runtime.lock().expect("runtime lock");
        let Some(jr) = runtime.env.j_replicas.values().next() else {
            return Err(rpc_err(-32000, "no jurisdiction imported"));
        };
        Ok(jr.depository.on_chain_nonce(&entity))
    }

    async fn r2r(
        &self,
        from: String,
        to: String,
        token_id: u64,
        amount: String,
        nonce: u64,
        hanko_data: String,
    ) -> RpcResult<String> {
        let from = parse_entity(&from)?;
        let to = parse_entity(&to)?;
        let amount = Amount::from_decimal(&amount)
            .ok_or_else(|| rpc_err(-32602, "invalid decimal amount"))?;
        let hanko_json = hex::decode(hanko_data.trim_start_matches("0x"))
            .map_err(|e| rpc_err(-32602, format!("invalid hanko data: {e}")))?;

        let mut runtime = self.state.runtime.lock().expect("runtime lock");
        runtime
            .submit_r2r(from, to, token_id, amount, nonce, &hanko_json)
            .map_err(|e: XlnError| rpc_err(-32000, e.to_string()))?;
        Ok("ok".to_string())
    }

    async fn register(&self, name: String) -> RpcResult<RpcRegistered> {
        let mut runtime = self.state.runtime.lock().expect("runtime lock");
        let entity_id = runtime.register_single_signer(&name);
        Ok(RpcRegistered { entity_id: format!("0x{}", entity_id.to_hex()) })
    }
}
