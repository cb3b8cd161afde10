//! NATS JetStream-backed message bus, colocated KV store, and the
//! windowed dedup layer built on top of it. `memory` provides in-process
//! fakes of the same capability traits so the rest of the runtime can be
//! exercised without a live NATS server.

pub mod dedup;
pub mod memory;
pub mod nats;
pub mod wire;

pub use dedup::{ClaimOutcome, DedupStore};
pub use nats::{NatsBus, NatsKv};
