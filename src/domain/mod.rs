pub mod cluster;
pub mod lease;
pub mod message;
pub mod notification;

pub use cluster::*;
pub use lease::*;
pub use message::*;
pub use notification::*;
