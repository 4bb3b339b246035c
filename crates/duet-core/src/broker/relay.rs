//! Message relay: deliver one validated chat payload to both session members.

use super::{Broker, Outbound, UserState};
use crate::error::BrokerError;
use crate::wire::{validate_message, ServerMsg};
use chrono::{DateTime, Utc};

impl<H: Clone> Broker<H> {
    /// Relay `text` from `sender` to both members of its session, the sender
    /// included — clients render the server-confirmed echo, not an optimistic
    /// local copy. Stamps session activity on success.
    pub fn relay(
        &mut self,
        sender: &str,
        text: &str,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<(), BrokerError> {
        let user = self.users.get(sender).ok_or(BrokerError::NotRegistered)?;
        let Some(session_id) = user.state.session() else {
            return Err(BrokerError::NoSession);
        };
        validate_message(text).map_err(|reason| BrokerError::InvalidMessage { reason })?;

        let Some(session) = self.sessions.get(&session_id) else {
            // The user believes it is paired but the record is gone; clear
            // the stale reference so the nickname is addressable again.
            if let Some(user) = self.users.get_mut(sender) {
                user.state = UserState::Idle;
            }
            return Err(BrokerError::SessionNotFound);
        };
        let members = [session.a.clone(), session.b.clone()];
        self.touch_session(session_id, now);

        let frame = ServerMsg::Message {
            text: text.to_string(),
            from: sender.to_string(),
            timestamp: now.to_rfc3339(),
        };
        for nick in &members {
            self.notify(nick, frame.clone(), out);
        }
        Ok(())
    }
}
