pub mod identifier;
pub mod routing_table;
pub mod storage;

/// One bucket per possible highest differing bit of a 160-bit ID.
pub const NUM_BUCKETS: usize = 160; // needs to match SHA1's output length

/// Maximum number of contacts per bucket (Kademlia `k`).
pub const K: usize = 20;

/// Lookup parallelism factor (Kademlia `α`).
pub const ALPHA: usize = 3;
