//! Conntrack view of a tracked flow

use flywall_common::{FlowKey, ProtocolState};
use serde::{Deserialize, Serialize};

/// One kernel-tracked connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Hash of the 5-tuple (plus ingress interface).
    pub id: u64,
    pub key: FlowKey,
    pub state: ProtocolState,
    pub last_seen_ns: u64,
    pub packets: u64,
    pub bytes: u64,
}

impl Flow {
    pub fn new(key: FlowKey, state: ProtocolState, now_ns: u64) -> Self {
        Self {
            id: key.flow_id(),
            key,
            state,
            last_seen_ns: now_ns,
            packets: 0,
            bytes: 0,
        }
    }
}
