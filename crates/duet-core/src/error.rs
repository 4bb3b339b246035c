//! Error taxonomy of the broker core.
//!
//! Every variant is non-fatal to the connection: the failed operation mutates
//! nothing and the caller reports the `(code, message)` pair back to the
//! originating party. Transport-level failures are not represented here; they
//! reach the broker as a single disconnect event instead.

use crate::wire::{ErrorCode, ServerMsg};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("{reason}")]
    InvalidNickname { reason: &'static str },
    #[error("Nickname already taken")]
    NicknameTaken,
    #[error("Already registered")]
    AlreadyRegistered,
    #[error("Send hello first")]
    NotRegistered,
    #[error("{reason}")]
    InvalidTarget { reason: &'static str },
    #[error("Cannot connect to yourself")]
    SelfConnect,
    #[error("Target not found")]
    TargetNotFound,
    #[error("You are already in a session")]
    SenderBusy,
    #[error("Target is already in a session")]
    TargetBusy,
    #[error("You already have a pending request")]
    RequestAlreadySent,
    #[error("Target already has a pending request")]
    TargetHasPending,
    #[error("Request not found")]
    RequestNotFound,
    #[error("Not your request")]
    RequestForbidden,
    #[error("User offline")]
    UserOffline,
    #[error("Someone is already in session")]
    UserBusy,
    #[error("Not in session")]
    NoSession,
    #[error("{reason}")]
    InvalidMessage { reason: &'static str },
    #[error("Session not found")]
    SessionNotFound,
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidNickname { .. } => ErrorCode::InvalidNickname,
            Self::NicknameTaken => ErrorCode::NicknameTaken,
            Self::AlreadyRegistered => ErrorCode::AlreadyRegistered,
            Self::NotRegistered => ErrorCode::NotRegistered,
            Self::InvalidTarget { .. } => ErrorCode::InvalidTarget,
            Self::SelfConnect => ErrorCode::SelfConnect,
            Self::TargetNotFound => ErrorCode::UserNotFound,
            Self::SenderBusy => ErrorCode::SenderBusy,
            Self::TargetBusy => ErrorCode::TargetBusy,
            Self::RequestAlreadySent => ErrorCode::RequestAlreadySent,
            Self::TargetHasPending => ErrorCode::TargetHasPending,
            Self::RequestNotFound => ErrorCode::RequestNotFound,
            Self::RequestForbidden => ErrorCode::RequestForbidden,
            Self::UserOffline => ErrorCode::UserOffline,
            Self::UserBusy => ErrorCode::UserBusy,
            Self::NoSession => ErrorCode::NoSession,
            Self::InvalidMessage { .. } => ErrorCode::InvalidMessage,
            Self::SessionNotFound => ErrorCode::SessionNotFound,
        }
    }

    /// The `error` frame reported to the party whose operation failed.
    pub fn to_frame(&self) -> ServerMsg {
        ServerMsg::Error {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_not_found_maps_to_wire_user_not_found() {
        let frame = BrokerError::TargetNotFound.to_frame();
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["code"], "USER_NOT_FOUND");
        assert_eq!(value["message"], "Target not found");
    }

    #[test]
    fn validation_errors_carry_their_reason() {
        let err = BrokerError::InvalidMessage {
            reason: "Message length must be 1..2000",
        };
        assert_eq!(err.to_string(), "Message length must be 1..2000");
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }
}
