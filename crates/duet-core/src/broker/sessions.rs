//! Paired-session lifecycle: creation, activity tracking, termination.

use super::{Broker, Outbound, Session, UserState};
use crate::wire::{ServerMsg, SessionEndReason, SessionId};
use chrono::{DateTime, Utc};

impl<H: Clone> Broker<H> {
    /// Pair `a` and `b` into a fresh session and write the back-references
    /// onto both user records. Callers must have verified that both nicknames
    /// are registered and idle; [`Broker::accept`] is the only production
    /// path here and does exactly that.
    pub fn create_session(&mut self, a: &str, b: &str, now: DateTime<Utc>) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(
            id,
            Session {
                id,
                a: a.to_string(),
                b: b.to_string(),
                created_at: now,
                last_activity: now,
            },
        );
        if let Some(user) = self.users.get_mut(a) {
            user.state = UserState::Paired(id);
        }
        if let Some(user) = self.users.get_mut(b) {
            user.state = UserState::Paired(id);
        }
        id
    }

    /// End a session with `reason`, detaching and notifying every member
    /// still registered. Ending an already-absent session is a no-op.
    pub fn end_session(
        &mut self,
        session_id: SessionId,
        reason: SessionEndReason,
        out: &mut Vec<Outbound<H>>,
    ) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        for nick in [&session.a, &session.b] {
            if let Some(user) = self.users.get_mut(nick) {
                if user.state == UserState::Paired(session_id) {
                    user.state = UserState::Idle;
                }
                out.push(Outbound {
                    to: user.handle.clone(),
                    msg: ServerMsg::SessionEnd { reason },
                });
            }
        }
    }

    /// Stamp relay activity on a session.
    pub fn touch_session(&mut self, session_id: SessionId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_activity = now;
        }
    }

    /// End every session idle for longer than the configured threshold with
    /// reason `timeout`; returns the ended ids.
    pub fn sweep_timeouts(
        &mut self,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound<H>>,
    ) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| now - session.last_activity > self.config.session_idle)
            .map(|session| session.id)
            .collect();
        for id in &idle {
            self.end_session(*id, SessionEndReason::Timeout, out);
        }
        idle
    }
}
