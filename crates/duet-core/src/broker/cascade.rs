//! Disconnect cascade: unwind a user's pending and session state in a fixed
//! order, then drop the registration. Pending state resolves before session
//! state so a half-cleaned nickname is never re-addressable.

use super::{Broker, Outbound, UserState};
use crate::wire::{ErrorCode, ServerMsg, SessionEndReason, SystemKind};

impl<H: Clone> Broker<H> {
    /// Connection loss for `conn`. A connection that never registered (or
    /// already left) unwinds nothing.
    pub fn disconnect(&mut self, conn: super::ConnId, out: &mut Vec<Outbound<H>>) {
        let Some(nick) = self.nick_by_conn.get(&conn).cloned() else {
            return;
        };
        self.cleanup_user(&nick, out);
    }

    /// Explicit `leave` from a registered user. Inside a session the peer is
    /// told the user left; outside one the leaver still gets a
    /// `session_end{user_leave}` echo. Either way the nickname is released
    /// while the connection stays open for a fresh `hello`.
    pub fn leave(&mut self, nick: &str, out: &mut Vec<Outbound<H>>) {
        match self.users.get(nick).map(|user| user.state) {
            Some(UserState::Paired(session_id)) => {
                if let Some(session) = self.sessions.get(&session_id) {
                    let peer = session.peer_of(nick).to_string();
                    self.notify(
                        &peer,
                        ServerMsg::System {
                            text: format!("{nick} left"),
                            kind: SystemKind::UserLeft,
                        },
                        out,
                    );
                    self.end_session(session_id, SessionEndReason::UserLeave, out);
                }
            }
            Some(_) => {
                self.notify(
                    nick,
                    ServerMsg::SessionEnd {
                        reason: SessionEndReason::UserLeave,
                    },
                    out,
                );
            }
            None => {}
        }
        self.cleanup_user(nick, out);
    }

    /// The ordered cascade: pending request (either direction), then active
    /// session, then the registry entry.
    pub(crate) fn cleanup_user(&mut self, nick: &str, out: &mut Vec<Outbound<H>>) {
        match self.users.get(nick).map(|user| user.state) {
            Some(UserState::PendingOutgoing(request_id)) => {
                if let Some(req) = self.remove_pending(request_id) {
                    self.notify(
                        &req.to,
                        ServerMsg::Error {
                            code: ErrorCode::RequestCanceled,
                            message: format!("{} disconnected", req.from),
                        },
                        out,
                    );
                }
            }
            Some(UserState::PendingIncoming(request_id)) => {
                if let Some(req) = self.remove_pending(request_id) {
                    self.notify(
                        &req.from,
                        ServerMsg::Error {
                            code: ErrorCode::RequestCanceled,
                            message: format!("{} disconnected", req.to),
                        },
                        out,
                    );
                }
            }
            Some(UserState::Paired(session_id)) => {
                if let Some(session) = self.sessions.get(&session_id) {
                    let peer = session.peer_of(nick).to_string();
                    self.notify(
                        &peer,
                        ServerMsg::System {
                            text: format!("{nick} disconnected"),
                            kind: SystemKind::PeerDisconnected,
                        },
                        out,
                    );
                    self.end_session(session_id, SessionEndReason::PeerDisconnected, out);
                }
            }
            Some(UserState::Idle) | None => {}
        }
        self.unregister(nick);
    }
}
