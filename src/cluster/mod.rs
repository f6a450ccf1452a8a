//! Cluster-aware routing: slot hashing, topology discovery, and
//! redirect-following dispatch over a per-node pool map.
pub mod pool;
pub mod router;
pub mod topology;

pub use pool::ClusterConnectionPool;
pub use router::ClusterClient;
pub use topology::{key_slot, slot_for_keys, NodeDescriptor, ServerType, SlotMap, SLOT_COUNT};
