//! Connect-request handshake: offer, accept, reject, cancel, expiry.
//!
//! Every nickname holds at most one pending slot system-wide (structurally,
//! via [`UserState`]); a request reaches exactly one terminal transition —
//! whichever of accept, reject, cancel, expiry or disconnect fires first
//! removes it before doing anything else.

use super::{Broker, Outbound, PendingRequest, UserState};
use crate::error::BrokerError;
use crate::wire::{validate_nickname, ErrorCode, RequestId, ServerMsg, SessionId};
use chrono::{DateTime, Utc};

impl<H: Clone> Broker<H> {
    /// Offer a pairing from `from` to `target`. All busy/duplicate checks run
    /// before allocation, first failure wins; on success the sender gets a
    /// `waiting` notice and the target an `incoming_request`.
    pub fn create_request(
        &mut self,
        from: &str,
        target: &str,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<RequestId, BrokerError> {
        let target =
            validate_nickname(target).map_err(|reason| BrokerError::InvalidTarget { reason })?;
        if target == from {
            return Err(BrokerError::SelfConnect);
        }
        let target_state = match self.users.get(target) {
            None => return Err(BrokerError::TargetNotFound),
            Some(user) => user.state,
        };
        let sender_state = self
            .users
            .get(from)
            .map(|user| user.state)
            .ok_or(BrokerError::NotRegistered)?;

        // Check order is part of the contract: sender busy, target busy,
        // sender's outgoing slot, target's incoming slot.
        if matches!(
            sender_state,
            UserState::Paired(_) | UserState::PendingIncoming(_)
        ) {
            return Err(BrokerError::SenderBusy);
        }
        if matches!(target_state, UserState::Paired(_)) {
            return Err(BrokerError::TargetBusy);
        }
        if matches!(sender_state, UserState::PendingOutgoing(_)) {
            return Err(BrokerError::RequestAlreadySent);
        }
        if target_state != UserState::Idle {
            return Err(BrokerError::TargetHasPending);
        }

        let id = RequestId::new();
        let expires_at = now + self.config.request_ttl;
        self.pending.insert(
            id,
            PendingRequest {
                id,
                from: from.to_string(),
                to: target.to_string(),
                created_at: now,
                expires_at,
            },
        );
        if let Some(user) = self.users.get_mut(from) {
            user.state = UserState::PendingOutgoing(id);
        }
        if let Some(user) = self.users.get_mut(target) {
            user.state = UserState::PendingIncoming(id);
        }

        self.notify(
            from,
            ServerMsg::Waiting {
                request_id: id,
                target_nickname: target.to_string(),
                expires_at: expires_at.timestamp_millis(),
            },
            out,
        );
        self.notify(
            target,
            ServerMsg::IncomingRequest {
                request_id: id,
                from_nickname: from.to_string(),
                expires_at: expires_at.timestamp_millis(),
            },
            out,
        );
        Ok(id)
    }

    /// Accept an offer addressed to `acceptor`. The request is removed before
    /// any further check, so a racing accept/reject/cancel on the same id
    /// resolves exactly once. If an endpoint vanished or became busy since
    /// the offer, both sides are told and no session is created.
    pub fn accept(
        &mut self,
        acceptor: &str,
        request_id: RequestId,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<SessionId, BrokerError> {
        match self.pending.get(&request_id) {
            None => return Err(BrokerError::RequestNotFound),
            Some(req) if req.to != acceptor => return Err(BrokerError::RequestForbidden),
            Some(_) => {}
        }
        let Some(req) = self.remove_pending(request_id) else {
            return Err(BrokerError::RequestNotFound);
        };

        let from_state = self.users.get(&req.from).map(|user| user.state);
        let to_state = self.users.get(&req.to).map(|user| user.state);
        let (Some(from_state), Some(to_state)) = (from_state, to_state) else {
            self.notify(
                &req.from,
                ServerMsg::Error {
                    code: ErrorCode::RequestFailed,
                    message: "Target offline".to_string(),
                },
                out,
            );
            return Err(BrokerError::UserOffline);
        };
        if from_state != UserState::Idle || to_state != UserState::Idle {
            self.notify(
                &req.from,
                ServerMsg::Error {
                    code: ErrorCode::RequestFailed,
                    message: "Someone is busy".to_string(),
                },
                out,
            );
            return Err(BrokerError::UserBusy);
        }

        let session_id = self.create_session(&req.from, &req.to, now);
        self.notify(
            &req.from,
            ServerMsg::Paired {
                peer_nickname: req.to.clone(),
                session_id,
            },
            out,
        );
        self.notify(
            &req.to,
            ServerMsg::Paired {
                peer_nickname: req.from.clone(),
                session_id,
            },
            out,
        );
        for nick in [&req.from, &req.to] {
            self.notify(
                nick,
                ServerMsg::System {
                    text: "connection established".to_string(),
                    kind: crate::wire::SystemKind::ConnectionEstablished,
                },
                out,
            );
        }
        Ok(session_id)
    }

    /// Decline an offer addressed to `rejector`; the requester is informed.
    pub fn reject(
        &mut self,
        rejector: &str,
        request_id: RequestId,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<(), BrokerError> {
        match self.pending.get(&request_id) {
            None => return Err(BrokerError::RequestNotFound),
            Some(req) if req.to != rejector => return Err(BrokerError::RequestForbidden),
            Some(_) => {}
        }
        if let Some(req) = self.remove_pending(request_id) {
            self.notify(
                &req.from,
                ServerMsg::Error {
                    code: ErrorCode::RequestRejected,
                    message: format!("{} rejected your request", req.to),
                },
                out,
            );
        }
        Ok(())
    }

    /// Withdraw an offer sent by `canceller`; both the target (if present)
    /// and the canceller are informed.
    pub fn cancel(
        &mut self,
        canceller: &str,
        request_id: RequestId,
        out: &mut Vec<Outbound<H>>,
    ) -> Result<(), BrokerError> {
        match self.pending.get(&request_id) {
            None => return Err(BrokerError::RequestNotFound),
            Some(req) if req.from != canceller => return Err(BrokerError::RequestForbidden),
            Some(_) => {}
        }
        if let Some(req) = self.remove_pending(request_id) {
            self.notify(
                &req.to,
                ServerMsg::Error {
                    code: ErrorCode::RequestCanceled,
                    message: format!("{} canceled request", req.from),
                },
                out,
            );
            self.notify(
                &req.from,
                ServerMsg::Error {
                    code: ErrorCode::RequestCanceled,
                    message: "Request canceled".to_string(),
                },
                out,
            );
        }
        Ok(())
    }

    /// Remove every request whose expiry has passed and return them; the
    /// housekeeping caller notifies each originator. The target receives
    /// nothing, it never had a symmetric obligation.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<PendingRequest> {
        let due: Vec<RequestId> = self
            .pending
            .values()
            .filter(|req| now > req.expires_at)
            .map(|req| req.id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.remove_pending(id))
            .collect()
    }

    /// Drop a request from the table and detach both parties' pending slots.
    /// The single path to a request's terminal transition.
    pub(crate) fn remove_pending(&mut self, request_id: RequestId) -> Option<PendingRequest> {
        let req = self.pending.remove(&request_id)?;
        if let Some(user) = self.users.get_mut(&req.from) {
            if user.state == UserState::PendingOutgoing(request_id) {
                user.state = UserState::Idle;
            }
        }
        if let Some(user) = self.users.get_mut(&req.to) {
            if user.state == UserState::PendingIncoming(request_id) {
                user.state = UserState::Idle;
            }
        }
        Some(req)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{broker, frames_for, join, t0};
    use super::*;
    use chrono::Duration;

    fn offer(b: &mut super::super::testutil::TestBroker) -> RequestId {
        let mut out = Vec::new();
        b.create_request("alice", "bob", t0(), &mut out)
            .expect("request")
    }

    #[test]
    fn create_notifies_both_parties_with_expiry() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");

        let mut out = Vec::new();
        let id = b
            .create_request("alice", "bob", t0(), &mut out)
            .expect("request");

        let expires_at = (t0() + b.config().request_ttl).timestamp_millis();
        assert_eq!(
            frames_for(&out, 1),
            vec![ServerMsg::Waiting {
                request_id: id,
                target_nickname: "bob".to_string(),
                expires_at,
            }]
        );
        assert_eq!(
            frames_for(&out, 2),
            vec![ServerMsg::IncomingRequest {
                request_id: id,
                from_nickname: "alice".to_string(),
                expires_at,
            }]
        );
        assert_eq!(b.pending_count(), 1);
        assert_eq!(b.lookup("alice").unwrap().state, UserState::PendingOutgoing(id));
        assert_eq!(b.lookup("bob").unwrap().state, UserState::PendingIncoming(id));
    }

    #[test]
    fn create_failure_order_and_codes() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        let mut out = Vec::new();

        assert!(matches!(
            b.create_request("alice", "b d", t0(), &mut out),
            Err(BrokerError::InvalidTarget { .. })
        ));
        assert_eq!(
            b.create_request("alice", "alice", t0(), &mut out),
            Err(BrokerError::SelfConnect)
        );
        assert_eq!(
            b.create_request("alice", "ghost", t0(), &mut out),
            Err(BrokerError::TargetNotFound)
        );
        assert!(out.is_empty());
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn duplicate_offer_fails_request_already_sent() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        offer(&mut b);

        let mut out = Vec::new();
        assert_eq!(
            b.create_request("alice", "bob", t0(), &mut out),
            Err(BrokerError::RequestAlreadySent)
        );
        assert_eq!(b.pending_count(), 1);
    }

    #[test]
    fn single_incoming_slot_per_target() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        join(&mut b, 3, "carol");
        offer(&mut b);

        let mut out = Vec::new();
        assert_eq!(
            b.create_request("carol", "bob", t0(), &mut out),
            Err(BrokerError::TargetHasPending)
        );
        // bob holds an incoming offer, so bob cannot start his own.
        assert_eq!(
            b.create_request("bob", "carol", t0(), &mut out),
            Err(BrokerError::SenderBusy)
        );
        // alice's outgoing slot is taken, so she cannot be targeted either.
        assert_eq!(
            b.create_request("carol", "alice", t0(), &mut out),
            Err(BrokerError::TargetHasPending)
        );
    }

    #[test]
    fn paired_users_are_busy_in_both_roles() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        join(&mut b, 3, "carol");
        let id = offer(&mut b);
        let mut out = Vec::new();
        b.accept("bob", id, t0(), &mut out).expect("accept");

        assert_eq!(
            b.create_request("carol", "bob", t0(), &mut out),
            Err(BrokerError::TargetBusy)
        );
        assert_eq!(
            b.create_request("alice", "carol", t0(), &mut out),
            Err(BrokerError::SenderBusy)
        );
    }

    #[test]
    fn accept_creates_session_and_notifies_in_order() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        let id = offer(&mut b);

        let mut out = Vec::new();
        let session_id = b.accept("bob", id, t0(), &mut out).expect("accept");

        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.session_count(), 1);
        assert_eq!(b.lookup("alice").unwrap().state, UserState::Paired(session_id));
        assert_eq!(b.lookup("bob").unwrap().state, UserState::Paired(session_id));

        let alice = frames_for(&out, 1);
        assert_eq!(
            alice[0],
            ServerMsg::Paired {
                peer_nickname: "bob".to_string(),
                session_id,
            }
        );
        assert!(matches!(
            alice[1],
            ServerMsg::System {
                kind: crate::wire::SystemKind::ConnectionEstablished,
                ..
            }
        ));
        let bob = frames_for(&out, 2);
        assert_eq!(
            bob[0],
            ServerMsg::Paired {
                peer_nickname: "alice".to_string(),
                session_id,
            }
        );
    }

    #[test]
    fn accept_is_to_only_and_single_shot() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        let id = offer(&mut b);

        let mut out = Vec::new();
        assert_eq!(
            b.accept("alice", id, t0(), &mut out),
            Err(BrokerError::RequestForbidden)
        );
        b.accept("bob", id, t0(), &mut out).expect("accept");
        assert_eq!(
            b.accept("bob", id, t0(), &mut out),
            Err(BrokerError::RequestNotFound)
        );
    }

    #[test]
    fn accept_after_requester_left_fails_both_ways() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        let id = offer(&mut b);
        // Requester drops off without the cascade having run for the request
        // (registry-level removal only) — accept must fail closed.
        b.unregister("alice");

        let mut out = Vec::new();
        assert_eq!(
            b.accept("bob", id, t0(), &mut out),
            Err(BrokerError::UserOffline)
        );
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.session_count(), 0);
        assert_eq!(b.lookup("bob").unwrap().state, UserState::Idle);
    }

    #[test]
    fn reject_informs_requester_only() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        let id = offer(&mut b);

        let mut out = Vec::new();
        assert_eq!(
            b.reject("alice", id, &mut out),
            Err(BrokerError::RequestForbidden)
        );
        b.reject("bob", id, &mut out).expect("reject");
        assert_eq!(
            frames_for(&out, 1),
            vec![ServerMsg::Error {
                code: ErrorCode::RequestRejected,
                message: "bob rejected your request".to_string(),
            }]
        );
        assert!(frames_for(&out, 2).is_empty());
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.lookup("alice").unwrap().state, UserState::Idle);
    }

    #[test]
    fn cancel_informs_target_and_canceller() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        let id = offer(&mut b);

        let mut out = Vec::new();
        assert_eq!(
            b.cancel("bob", id, &mut out),
            Err(BrokerError::RequestForbidden)
        );
        b.cancel("alice", id, &mut out).expect("cancel");
        assert_eq!(
            frames_for(&out, 2),
            vec![ServerMsg::Error {
                code: ErrorCode::RequestCanceled,
                message: "alice canceled request".to_string(),
            }]
        );
        assert_eq!(
            frames_for(&out, 1),
            vec![ServerMsg::Error {
                code: ErrorCode::RequestCanceled,
                message: "Request canceled".to_string(),
            }]
        );
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let mut b = broker();
        join(&mut b, 1, "alice");
        join(&mut b, 2, "bob");
        offer(&mut b);

        assert!(b.expire_due(t0() + Duration::milliseconds(59_999)).is_empty());
        assert!(b.expire_due(t0() + Duration::milliseconds(60_000)).is_empty());
        let expired = b.expire_due(t0() + Duration::milliseconds(60_001));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].from, "alice");
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.lookup("alice").unwrap().state, UserState::Idle);
        assert_eq!(b.lookup("bob").unwrap().state, UserState::Idle);
    }
}
