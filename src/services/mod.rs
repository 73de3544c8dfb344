pub mod circuit_breaker;
pub mod clock;
pub mod connection_pool;
pub mod database; // Relational and analytical engine adapters
pub mod execution;
pub mod metrics;
pub mod pool_monitor;
pub mod query_cache; // Query result cache with LRU and TTL
pub mod retry;
pub mod snapshot_cache;

pub use circuit_breaker::*;
pub use clock::*;
pub use connection_pool::*;
pub use execution::*;
pub use metrics::*;
pub use pool_monitor::*;
pub use query_cache::*;
pub use retry::*;
pub use snapshot_cache::*;
