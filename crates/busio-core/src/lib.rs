//! busio-core - Wire models and bus-node abstractions
//!
//! This crate holds everything the capture/spoof service exchanges with the
//! outside world: the configuration, status, capture and spoof messages, the
//! session addressing model, and the publish/subscribe node the service runs
//! on top of.

pub mod error;
pub mod models;
pub mod node;

pub use error::{NodeError, SessionError};
pub use models::*;
pub use node::{LocalNode, Message, Node, Publisher, ShutdownSignal, Subscriber};
