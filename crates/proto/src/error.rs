use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Close codes used by the hub on both listeners.
pub mod close {
    pub const NORMAL: u16 = 1000;
    /// Going away: shutdown, heartbeat timeout, displacement, overflow.
    pub const GOING_AWAY: u16 = 1001;
    /// Binary frames are not part of the protocol.
    pub const UNSUPPORTED: u16 = 1003;
    /// Policy: banned address or denied origin.
    pub const POLICY: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    /// Parse-error flood from an adapter.
    pub const MALFORMED: u16 = 4400;
    pub const AUTH_FAILED: u16 = 4401;
    pub const RATE_LIMITED: u16 = 4429;
}

/// Machine-readable error kinds surfaced in `error.kind` of reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("bad token")]
    BadToken,
    #[error("expired token")]
    ExpiredToken,
    #[error("missing authorization")]
    MissingAuth,
    #[error("forbidden role")]
    ForbiddenRole,
    #[error("rate limited")]
    RateLimited,
    #[error("banned")]
    Banned,
    #[error("unknown event")]
    UnknownEvent,
    #[error("no such server")]
    NoSuchServer,
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("ack timeout")]
    AckTimeout,
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadToken => "bad_token",
            Self::ExpiredToken => "expired_token",
            Self::MissingAuth => "missing_auth",
            Self::ForbiddenRole => "forbidden_role",
            Self::RateLimited => "rate_limited",
            Self::Banned => "banned",
            Self::UnknownEvent => "unknown_event",
            Self::NoSuchServer => "no_such_server",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::FrameTooLarge => "frame_too_large",
            Self::AckTimeout => "ack_timeout",
            Self::Internal => "internal",
        }
    }
}
