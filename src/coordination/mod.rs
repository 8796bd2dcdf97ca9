//! Coordination layer
//!
//! Leases, membership and leader election over the shared store, plus the
//! retry and shutdown plumbing every background loop uses.

pub mod elector;
pub mod lock_manager;
pub mod membership;
pub mod retry;
pub mod shutdown;

pub use elector::{ElectorState, ElectorStats, GatewayController, GatewayElector, LeadershipLoss};
pub use lock_manager::LockManager;
pub use membership::{ClusterMembership, NodeId};
pub use retry::{jittered_interval, RetryPolicy};
pub use shutdown::{install_signal_handlers, Shutdown, ShutdownSignal, ShutdownToken};
