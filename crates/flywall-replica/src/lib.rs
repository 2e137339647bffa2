//! Flywall replica - state replication between HA peers
//!
//! Primary/replica protocol over length-prefixed JSON frames with
//! pre-shared-key authentication and optional (mutual) TLS. Replicas
//! sync via snapshot or delta, follow the live change stream, and
//! recover from divergence by requesting a full snapshot.

#![warn(clippy::all)]

pub mod auth;
pub mod primary;
pub mod proto;
pub mod replica;
pub mod tls;

pub use primary::Primary;
pub use proto::{read_frame, write_frame, Frame, MAX_FRAME};
pub use replica::{reverse_sync, Replica, SyncState};
