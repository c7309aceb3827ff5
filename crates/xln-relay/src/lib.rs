//! xln-relay
//!
//! An out-of-process message relay keyed by runtime id. Transport-agnostic
//! and payload-blind: it stores client encryption keys opaquely, queues
//! frames for registered clients, parks frames for runtimes that have not
//! registered yet, and rate-limits senders of malformed traffic. It never
//! inspects the inner payload.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use xln_core::{XlnError, RELAY_CLIENT_QUEUE_CAP, RELAY_DEBUG_EVENTS_CAP};

/// Hard cap on one relay frame (envelope + payload).
pub const RELAY_FRAME_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Malformed frames tolerated per sender before rate limiting.
const MALFORMED_STRIKE_LIMIT: u32 = 10;

/// The wire envelope. The payload is opaque ciphertext as far as the relay
/// is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub from: String,
    pub to: String,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RelayFrame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Default)]
struct ClientSlot {
    queue: VecDeque<RelayFrame>,
    encryption_key: Option<Vec<u8>>,
}

/// The relay itself. Single owner; the node wraps it in its I/O loop.
#[derive(Debug, Default)]
pub struct Relay {
    clients: BTreeMap<String, ClientSlot>,
    /// Frames for runtime ids nobody has registered yet.
    parked: BTreeMap<String, VecDeque<RelayFrame>>,
    debug_events: VecDeque<String>,
    strikes: BTreeMap<String, u32>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a client. Parked frames drain into its
    /// queue. The encryption key is stored verbatim and never used by the
    /// relay itself.
    pub fn register(&mut self, runtime_id: &str, encryption_key: Option<Vec<u8>>) {
        let slot = self.clients.entry(runtime_id.to_string()).or_default();
        slot.encryption_key = encryption_key;
        if let Some(mut parked) = self.parked.remove(runtime_id) {
            debug!(runtime_id, parked = parked.len(), "draining parked frames");
            while let Some(frame) = parked.pop_front() {
                Self::enqueue_bounded(&mut self.debug_events, slot, frame);
            }
        }
        self.log_event(format!("registered {runtime_id}"));
    }

    pub fn encryption_key(&self, runtime_id: &str) -> Option<&[u8]> {
        self.clients
            .get(runtime_id)
            .and_then(|s| s.encryption_key.as_deref())
    }

    pub fn is_rate_limited(&self, runtime_id: &str) -> bool {
        self.strikes.get(runtime_id).copied().unwrap_or(0) >= MALFORMED_STRIKE_LIMIT
    }

    /// Accept raw bytes from `sender`. Malformed or oversized frames count
    /// a strike against the sender and are dropped.
    pub fn ingest(&mut self, sender: &str, bytes: &[u8]) -> Result<(), XlnError> {
        if self.is_rate_limited(sender) {
            return Err(XlnError::Protocol(format!("{sender} is rate limited")));
        }
        if bytes.len() > RELAY_FRAME_MAX_BYTES {
            self.strike(sender);
            return Err(XlnError::MessageTooLarge { max: RELAY_FRAME_MAX_BYTES });
        }
        let frame = match RelayFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.strike(sender);
                return Err(XlnError::Protocol(format!("malformed relay frame: {err}")));
            }
        };
        self.deliver(frame);
        Ok(())
    }

    fn deliver(&mut self, frame: RelayFrame) {
        self.log_event(format!("{} -> {} ({} bytes)", frame.from, frame.to, frame.payload.len()));
        match self.clients.get_mut(&frame.to) {
            Some(slot) => Self::enqueue_bounded(&mut self.debug_events, slot, frame),
            None => {
                let parked = self.parked.entry(frame.to.clone()).or_default();
                parked.push_back(frame);
                while parked.len() > RELAY_CLIENT_QUEUE_CAP {
                    parked.pop_front();
                }
            }
        }
    }

    fn enqueue_bounded(
        debug_events: &mut VecDeque<String>,
        slot: &mut ClientSlot,
        frame: RelayFrame,
    ) {
        slot.queue.push_back(frame);
        while slot.queue.len() > RELAY_CLIENT_QUEUE_CAP {
            let dropped = slot.queue.pop_front();
            if let Some(d) = dropped {
                warn!(to = %d.to, "client queue full; dropping oldest frame");
                debug_events.push_back(format!("dropped frame for {}", d.to));
                while debug_events.len() > RELAY_DEBUG_EVENTS_CAP {
                    debug_events.pop_front();
                }
            }
        }
    }

    /// Take everything queued for a client.
    pub fn drain(&mut self, runtime_id: &str) -> Vec<RelayFrame> {
        self.clients
            .get_mut(runtime_id)
            .map(|slot| slot.queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, runtime_id: &str) -> usize {
        self.clients.get(runtime_id).map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn debug_events(&self) -> impl Iterator<Item = &str> {
        self.debug_events.iter().map(String::as_str)
    }

    fn strike(&mut self, sender: &str) {
        let strikes = self.strikes.entry(sender.to_string()).or_default();
        *strikes += 1;
        if *strikes == MALFORMED_STRIKE_LIMIT {
            warn!(sender, "rate limiting after repeated malformed frames");
        }
    }

    fn log_event(&mut self, event: String) {
        self.debug_events.push_back(event);
        while self.debug_events.len() > RELAY_DEBUG_EVENTS_CAP {
            self.debug_events.pop_front();
        }
    }
}
