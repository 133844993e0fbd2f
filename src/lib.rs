//! CCB (Connection Broker)
//!
//! Lets a client reach a daemon that cannot accept inbound connections.
//! The daemon (target) keeps a persistent registration with the broker;
//! a client asks the broker to have the target connect back to it.

pub mod broker;
pub mod ccbid;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod metrics;
pub mod reconnect;
pub mod registry;
pub mod timeslice;
pub mod watcher;

pub use broker::{Broker, Control, RunExit};
pub use ccbid::{RequestId, TargetId};
pub use client::{
    request_reverse_connect, ForwardedRequest, PendingReverseConnect, Registration,
    RequestOutcome, TargetEvent, TargetSession,
};
pub use config::{BrokerConfig, PollMode};
pub use error::{BrokerError, ClientError, ConfigError, MessageError, ReconnectError, StoreError};
pub use message::{Command, Record};
