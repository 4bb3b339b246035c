//! Message-layer contract: one JSON object per text frame, both directions.
//!
//! Frames are internally tagged on `type`; field names follow the protocol's
//! camelCase. `expiresAt` is epoch milliseconds, `message.timestamp` is
//! RFC 3339. Frames above [`MAX_FRAME_BYTES`] are refused before parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Inbound frames larger than this are answered with `PARSE_ERROR` unparsed.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub const NICKNAME_MIN_CHARS: usize = 2;
pub const NICKNAME_MAX_CHARS: usize = 20;
pub const MESSAGE_MIN_CHARS: usize = 1;
pub const MESSAGE_MAX_CHARS: usize = 2000;

/// Identity token handed out at registration (`hello_ok.sessionId`).
///
/// Distinct type from [`SessionId`] on purpose: the wire field name is shared
/// but the two identifiers are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserToken(Uuid);

impl UserToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a pending connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a confirmed chat session (`paired.sessionId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Client → broker frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Hello {
        nickname: String,
    },
    #[serde(rename_all = "camelCase")]
    Connect {
        target_nickname: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectAccept {
        request_id: RequestId,
    },
    #[serde(rename_all = "camelCase")]
    ConnectReject {
        request_id: RequestId,
    },
    #[serde(rename_all = "camelCase")]
    ConnectCancel {
        request_id: RequestId,
    },
    Message {
        text: String,
    },
    Leave,
}

/// Broker → client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    #[serde(rename_all = "camelCase")]
    HelloOk {
        session_id: UserToken,
    },
    #[serde(rename_all = "camelCase")]
    Waiting {
        request_id: RequestId,
        target_nickname: String,
        expires_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    IncomingRequest {
        request_id: RequestId,
        from_nickname: String,
        expires_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Paired {
        peer_nickname: String,
        session_id: SessionId,
    },
    Message {
        text: String,
        from: String,
        timestamp: String,
    },
    System {
        text: String,
        #[serde(rename = "type_")]
        kind: SystemKind,
    },
    SessionEnd {
        reason: SessionEndReason,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Sub-kind of a `system` notice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    UserJoined,
    UserLeft,
    ConnectionEstablished,
    PeerDisconnected,
}

/// Why a session ended; delivered to every live member exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    PeerDisconnected,
    Timeout,
    UserLeave,
    Error,
}

/// Stable error codes carried in `error.code`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidNickname,
    NicknameTaken,
    AlreadyRegistered,
    NotRegistered,
    InvalidTarget,
    SelfConnect,
    UserNotFound,
    SenderBusy,
    TargetBusy,
    RequestAlreadySent,
    TargetHasPending,
    RequestNotFound,
    RequestForbidden,
    UserOffline,
    UserBusy,
    RequestFailed,
    RequestRejected,
    RequestCanceled,
    RequestTimeout,
    NoSession,
    InvalidMessage,
    SessionNotFound,
    ParseError,
}

/// Validate a nickname and return the trimmed form.
///
/// Length 2..=20 after trimming, charset `[A-Za-z0-9_-]`, case-sensitive.
pub fn validate_nickname(raw: &str) -> Result<&str, &'static str> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if !(NICKNAME_MIN_CHARS..=NICKNAME_MAX_CHARS).contains(&len) {
        return Err("Nickname length must be 2..20");
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Nickname must match [A-Za-z0-9_-]");
    }
    Ok(trimmed)
}

/// Validate chat text: 1..=2000 characters after trimming whitespace.
///
/// The relayed payload stays untrimmed; only the bound is checked here.
pub fn validate_message(raw: &str) -> Result<(), &'static str> {
    let len = raw.trim().chars().count();
    if !(MESSAGE_MIN_CHARS..=MESSAGE_MAX_CHARS).contains(&len) {
        return Err("Message length must be 1..2000");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_use_protocol_field_names() {
        let frame = ClientMsg::Connect {
            target_nickname: "bob".to_string(),
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value, json!({"type": "connect", "targetNickname": "bob"}));

        let leave: ClientMsg = serde_json::from_value(json!({"type": "leave"})).expect("leave");
        assert_eq!(leave, ClientMsg::Leave);
    }

    #[test]
    fn request_frames_round_trip() {
        let id = RequestId::new();
        let frame = ClientMsg::ConnectAccept { request_id: id };
        let raw = serde_json::to_string(&frame).expect("serialize");
        assert!(raw.contains("\"requestId\""));
        let back: ClientMsg = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, frame);
    }

    #[test]
    fn server_frames_use_protocol_field_names() {
        let id = RequestId::new();
        let frame = ServerMsg::Waiting {
            request_id: id,
            target_nickname: "bob".to_string(),
            expires_at: 1_772_000_000_000,
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "waiting");
        assert_eq!(value["targetNickname"], "bob");
        assert_eq!(value["expiresAt"], 1_772_000_000_000_i64);
        assert_eq!(value["requestId"], id.to_string());
    }

    #[test]
    fn system_notice_keeps_underscored_kind_field() {
        let frame = ServerMsg::System {
            text: "alice left".to_string(),
            kind: SystemKind::UserLeft,
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value, json!({"type": "system", "text": "alice left", "type_": "user_left"}));
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let frame = ServerMsg::Error {
            code: ErrorCode::RequestAlreadySent,
            message: "You already have a pending request".to_string(),
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["code"], "REQUEST_ALREADY_SENT");
    }

    #[test]
    fn session_end_reason_is_snake_case() {
        let frame = ServerMsg::SessionEnd {
            reason: SessionEndReason::PeerDisconnected,
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value, json!({"type": "session_end", "reason": "peer_disconnected"}));
    }

    #[test]
    fn nickname_validation_edges() {
        assert_eq!(validate_nickname("  alice  "), Ok("alice"));
        assert_eq!(validate_nickname("a-b_9"), Ok("a-b_9"));
        assert!(validate_nickname("a").is_err());
        assert!(validate_nickname(&"x".repeat(21)).is_err());
        assert!(validate_nickname("has space").is_err());
        assert!(validate_nickname("émile").is_err());
        assert!(validate_nickname("").is_err());
    }

    #[test]
    fn message_validation_edges() {
        assert!(validate_message("hi").is_ok());
        assert!(validate_message("   ").is_err());
        assert!(validate_message(&"m".repeat(2000)).is_ok());
        assert!(validate_message(&"m".repeat(2001)).is_err());
    }
}
