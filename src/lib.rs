pub mod core;
pub mod node;
pub mod protocol;

// Re-export commonly used types for consumers and integration tests
pub use crate::core::identifier::{Contact, Distance, Key, NodeID, RpcId};
pub use crate::core::storage::Value;
pub use crate::core::{ALPHA, K, NUM_BUCKETS};
pub use crate::node::Node;

use ctor::ctor;
use tracing_subscriber::{fmt, EnvFilter};

#[ctor]
fn init_tracing() {
    // Avoid duplicate initialization if multiple tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
