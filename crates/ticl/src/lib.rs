//! Client-side core of the Ticl cache-invalidation service.
//!
//! A long-lived client maintains a session with a remote invalidation
//! server, registers interest in named objects, receives invalidation
//! notifications for those objects, and acknowledges them back. This crate
//! holds the pieces underneath the public client surface:
//!
//! - [`protocol::ProtocolHandler`] - inbound parsing, validation, and
//!   dispatch; outbound assembly and batching; token and version gating
//! - [`registration::RegistrationManager`] - the desired-registration set,
//!   its digest, and reconciliation against server-reported status
//! - [`operation::OperationScheduler`] - deduplicated deferred operations
//! - [`storage::SafeStorage`] - storage completions forced onto the
//!   internal scheduler thread
//! - [`network::NetworkManager`] - heartbeat, polling, and throttled
//!   outbound-data notifications

pub mod backoff;
pub mod config;
pub mod network;
pub mod operation;
pub mod protocol;
pub mod registration;
pub mod resources;
pub mod scheduler;
pub mod statistics;
pub mod storage;
pub mod testing;
pub mod throttle;
pub mod validation;

pub use backoff::ExponentialBackoffDelayGenerator;
pub use config::Config;
pub use network::{NetworkManager, OutboundListener};
pub use operation::{Operation, OperationId, OperationScheduler};
pub use protocol::{ProtocolHandler, ProtocolListener, ServerMessageHeader};
pub use registration::{RegistrationManager, SimpleRegistrationStore};
pub use resources::{
    NO_DELAY, NetworkChannel, Scheduler, Storage, StorageStatus, SystemResources, Task,
};
pub use scheduler::ThreadScheduler;
pub use statistics::{ClientErrorType, ReceivedMessageType, SentMessageType, Statistics};
pub use storage::SafeStorage;
pub use throttle::{RateLimit, Throttle};
pub use validation::{DefaultMessageValidator, MessageValidator, ValidationError};
