//! # scanflow-common
//!
//! Shared types for the scanflow document pipeline:
//! - Error type and result alias
//! - TOML configuration and root folder resolution
//! - Message envelope and wire codec
//! - Message type table and typed payloads
//! - Logical queue names
//! - In-process event bus and operator notifications

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod messages;
pub mod queues;

pub use envelope::{decode, encode, CodecError, Envelope};
pub use error::{Error, Result};
pub use events::{ConsumerState, EventBus, NotificationKind, Notifier, PipelineEvent};
pub use messages::Payload;
pub use queues::QueueNames;
