//! Routing interface.
//!
//! Path-finding itself is an external collaborator; this module fixes only
//! the contract it must satisfy and ships the trivial direct-neighbor
//! implementation used by the node and tests.

use serde::{Deserialize, Serialize};

use xln_core::{Amount, EntityId, TokenId};

use crate::state::EntityState;

/// What a payment needs from the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathQuery {
    pub from: EntityId,
    pub to: EntityId,
    pub token_id: TokenId,
    pub amount: Amount,
}

/// An ordered hop list, first entry being the first counterparty. Every hop
/// must have enough outgoing capacity for the amount at lock time; the
/// router's estimate is advisory, the account machine enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub hops: Vec<EntityId>,
}

pub trait Pathfinder {
    fn find_route(&self, state: &EntityState, query: &PathQuery) -> Option<RouteCandidate>;
}

/// Routes only to direct counterparties with sufficient outgoing capacity.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectPathfinder;

impl Pathfinder for DirectPathfinder {
    fn find_route(&self, state: &EntityState, query: &PathQuery) -> Option<RouteCandidate> {
        let machine = state.accounts.get(&query.to)?;
        let row = machine.state.deltas.get(&query.token_id)?;
        let capacity = row.derive(machine.is_left()).out_capacity;
        if capacity >= query.amount {
            Some(RouteCandidate { hops: vec![query.to] })
        } else {
            None
        }
    }
}
