//! Database-backed pub-sub
//!
//! An ordered message log per channel with persisted subscriber cursors,
//! retention, and in-process fan-out to handlers.

pub mod bus;
pub mod dispatcher;
pub mod retention;
pub mod subscription;

pub use bus::PubSubBus;
pub use dispatcher::{DispatchHandle, NotificationDispatcher, NotificationHandler};
pub use retention::{prune_all, run_retention, RetentionPolicy};
pub use subscription::Subscription;
