//! xln-runtime
//!
//! The tick-driven runtime: the replica multiplex, jurisdiction mirrors,
//! output queuing, snapshot persistence, replay, and time travel.

pub mod context;
pub mod env;
pub mod runtime;
pub mod snapshot;

pub use context::RuntimeContext;
pub use env::{
    Env, EntityInputRecord, GossipProfile, JReplica, RuntimeInput, RuntimeTx, ValidatorSpec,
};
pub use runtime::Runtime;
pub use snapshot::{export_replay, import_replay, EnvSnapshot, ReplayExport, SnapshotStore};
