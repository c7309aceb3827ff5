//! xln-rpc
//!
//! The JSON-RPC 2.0 surface of a running node: status, reserves, nonces,
//! direct reserve transfers, and entity registration.

pub mod api;
pub mod server;
pub mod types;

pub use api::XlnApiServer;
pub use server::{RpcServer, RpcServerState};
pub use types::{RpcRegistered, RpcReserve, RpcStatus};
