//! Connection registry: nickname → live connection handle plus presence.
//!
//! Pure table mutation; no protocol messages originate here. Sibling
//! components look connections up through [`Broker::lookup`] at send time, so
//! a presence change never leaves a dangling handle behind.

use super::{Broker, ConnId, User, UserState};
use crate::error::BrokerError;
use crate::wire::{validate_nickname, UserToken};
use chrono::{DateTime, Utc};

impl<H: Clone> Broker<H> {
    /// Register `nickname` for connection `conn` and hand out its identity
    /// token. The nickname is trimmed and validated before the uniqueness
    /// check; a connection registers at most once.
    pub fn register(
        &mut self,
        conn: ConnId,
        handle: &H,
        nickname: &str,
        now: DateTime<Utc>,
    ) -> Result<UserToken, BrokerError> {
        if self.nick_by_conn.contains_key(&conn) {
            return Err(BrokerError::AlreadyRegistered);
        }
        let nickname =
            validate_nickname(nickname).map_err(|reason| BrokerError::InvalidNickname { reason })?;
        if self.users.contains_key(nickname) {
            return Err(BrokerError::NicknameTaken);
        }

        let token = UserToken::new();
        self.users.insert(
            nickname.to_string(),
            User {
                token,
                nickname: nickname.to_string(),
                conn,
                handle: handle.clone(),
                state: UserState::Idle,
                last_seen: now,
            },
        );
        self.nick_by_conn.insert(conn, nickname.to_string());
        Ok(token)
    }

    pub fn lookup(&self, nickname: &str) -> Option<&User<H>> {
        self.users.get(nickname)
    }

    /// Remove the entry for `nickname`; idempotent.
    pub fn unregister(&mut self, nickname: &str) {
        if let Some(user) = self.users.remove(nickname) {
            self.nick_by_conn.remove(&user.conn);
        }
    }
}
