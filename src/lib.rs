pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod node;
pub mod pubsub;

pub use adapters::{CoordinationStore, MemoryStore, PostgresStore};
pub use config::AppConfig;
pub use coordination::{
    ClusterMembership, ElectorState, GatewayController, GatewayElector, LeadershipLoss,
    LockManager, RetryPolicy, Shutdown, ShutdownSignal, ShutdownToken,
};
pub use domain::{FencingToken, Lease, Message, Notification, NotificationKind, SequenceId};
pub use error::{IbcError, Result};
pub use node::Node;
pub use pubsub::{DispatchHandle, NotificationDispatcher, NotificationHandler, PubSubBus, Subscription};
