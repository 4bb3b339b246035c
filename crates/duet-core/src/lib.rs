//! Connection broker for ephemeral, anonymous 1:1 chat sessions.
//!
//! Two parties, identified only by transient nicknames, are paired through a
//! connect-request handshake (offer, accept, reject, cancel, expire) and then
//! exchange messages through a relayed session until either side leaves,
//! disconnects, or the session idles out.
//!
//! The crate is deliberately free of I/O: [`Broker`] is a plain value owning
//! the three entity tables (users, pending requests, sessions), every
//! mutation goes through its methods, and every time-sensitive operation
//! takes the clock as an argument. Outbound notifications are returned as
//! [`broker::Outbound`] values addressed by live connection handle; delivering
//! them (and serializing the frames in [`wire`]) is the embedding runtime's
//! job. `duet-hub` wraps one `Broker` in a single task fed by a command
//! channel, which keeps every compound state transition atomic.

pub mod broker;
pub mod error;
pub mod wire;

pub use broker::{Broker, BrokerConfig, ConnId, Outbound, PendingRequest, Session, User, UserState};
pub use error::BrokerError;
pub use wire::{
    ClientMsg, ErrorCode, RequestId, ServerMsg, SessionEndReason, SessionId, SystemKind, UserToken,
};
