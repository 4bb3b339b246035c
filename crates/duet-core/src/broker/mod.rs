//! The broker state machine: one value owning the three entity tables.
//!
//! Components are impl blocks split across submodules, one per concern:
//! registration ([`registry`]), the connect-request handshake ([`requests`]),
//! paired sessions ([`sessions`]), message relay ([`relay`]) and the
//! disconnect cascade ([`cascade`]). [`Broker::sweep`] is the housekeeping
//! unit of work; the embedding runtime owns its schedule.
//!
//! All operations are synchronous and non-blocking: each either completes its
//! state transition and pushes the resulting notifications into the caller's
//! buffer, or fails closed having mutated nothing. Callers must not interleave
//! operations (the hub serializes them through one command channel).

mod cascade;
mod registry;
mod relay;
mod requests;
mod sessions;

use crate::error::BrokerError;
use crate::wire::{ClientMsg, RequestId, ServerMsg, SessionId, UserToken};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Process-wide thresholds, fixed for the broker's lifetime.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TTL of a pending connect request.
    pub request_ttl: Duration,
    /// A session with no relayed message for longer than this is timed out.
    pub session_idle: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::milliseconds(60_000),
            session_idle: Duration::minutes(10),
        }
    }
}

/// Opaque key of one transport connection, assigned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// A notification addressed to a live connection handle.
///
/// Delivery is fire-and-forget relative to the state change that produced it;
/// a handle that can no longer accept frames never rolls anything back.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound<H> {
    pub to: H,
    pub msg: ServerMsg,
}

/// What a user is currently attached to.
///
/// A single enum rather than independently-nullable fields: holding a pending
/// slot and a session at once is unrepresentable, as is holding both pending
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Idle,
    PendingOutgoing(RequestId),
    PendingIncoming(RequestId),
    Paired(SessionId),
}

impl UserState {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Paired(id) => Some(*id),
            _ => None,
        }
    }
}

/// One connected, registered participant.
#[derive(Debug, Clone)]
pub struct User<H> {
    pub token: UserToken,
    pub nickname: String,
    pub conn: ConnId,
    pub handle: H,
    pub state: UserState,
    pub last_seen: DateTime<Utc>,
}

/// An unconfirmed offer from one nickname to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A confirmed pairing of exactly two distinct nicknames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub a: String,
    pub b: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn peer_of(&self, nickname: &str) -> &str {
        if self.a == nickname {
            &self.b
        } else {
            &self.a
        }
    }
}

/// The broker: exclusive owner of users, pending requests and sessions.
///
/// Generic over the connection-handle type `H` so the runtime can register
/// whatever it writes frames through; tests use plain integers.
pub struct Broker<H> {
    config: BrokerConfig,
    users: HashMap<String, User<H>>,
    nick_by_conn: HashMap<ConnId, String>,
    pending: HashMap<RequestId, PendingRequest>,
    sessions: HashMap<SessionId, Session>,
}

impl<H: Clone> Broker<H> {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            users: HashMap::new(),
            nick_by_conn: HashMap::new(),
            pending: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Route one inbound frame from connection `conn` to the right component.
    ///
    /// Returns every notification the transition produced; a failed operation
    /// yields exactly one `error` frame for the originator and nothing else
    /// (beyond any companion notices the failure itself defines).
    pub fn dispatch(
        &mut self,
        conn: ConnId,
        handle: &H,
        msg: ClientMsg,
        now: DateTime<Utc>,
    ) -> Vec<Outbound<H>> {
        let mut out = Vec::new();
        let result = self.dispatch_inner(conn, handle, msg, now, &mut out);
        if let Err(err) = result {
            out.push(Outbound {
                to: handle.clone(),
                msg: err.to_frame(),
            });
        }
        out
    }

    fn dispatch_inner(
        &mut self,
        conn: ConnId,
        handle: &H,
        msg: ClientMsg,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<(), BrokerError> {
        if let ClientMsg::Hello { nickname } = &msg {
            let token = self.register(conn, handle, nickname, now)?;
            out.push(Outbound {
                to: handle.clone(),
                msg: ServerMsg::HelloOk { session_id: token },
            });
            return Ok(());
        }

        let nick = self
            .nick_by_conn
            .get(&conn)
            .cloned()
            .ok_or(BrokerError::NotRegistered)?;
        if let Some(user) = self.users.get_mut(&nick) {
            user.last_seen = now;
        }

        match msg {
            ClientMsg::Hello { .. } => unreachable!("handled above"),
            ClientMsg::Connect { target_nickname } => self
                .create_request(&nick, &target_nickname, now, out)
                .map(drop),
            ClientMsg::ConnectAccept { request_id } => {
                self.accept(&nick, request_id, now, out).map(drop)
            }
            ClientMsg::ConnectReject { request_id } => self.reject(&nick, request_id, out),
            ClientMsg::ConnectCancel { request_id } => self.cancel(&nick, request_id, out),
            ClientMsg::Message { text } => self.relay(&nick, &text, now, out),
            ClientMsg::Leave => {
                self.leave(&nick, out);
                Ok(())
            }
        }
    }

    /// Housekeeping pass: expire due requests, then time out idle sessions.
    ///
    /// Expired requests notify only their originator; ended sessions notify
    /// every member still registered.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Outbound<H>> {
        let mut out = Vec::new();
        for req in self.expire_due(now) {
            self.notify(
                &req.from,
                ServerMsg::Error {
                    code: crate::wire::ErrorCode::RequestTimeout,
                    message: "Request timed out".to_string(),
                },
                &mut out,
            );
        }
        self.sweep_timeouts(now, &mut out);
        out
    }

    /// Queue `msg` for `nickname` if it is registered right now.
    ///
    /// Presence is resolved at send time, never cached across calls.
    pub(crate) fn notify(&self, nickname: &str, msg: ServerMsg, out: &mut Vec<Outbound<H>>) {
        if let Some(user) = self.users.get(nickname) {
            out.push(Outbound {
                to: user.handle.clone(),
                msg,
            });
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
