//! RPC-level error taxonomy.
//!
//! Two kinds of failure come back over the wire and they stay distinguishable
//! all the way into the caller's deferred chain: `Application` mirrors a
//! `return-error` message (the remote task failed), `Protocol` mirrors an
//! `epc-error` message (the protocol layer failed, e.g. no such method).

use std::fmt;

/// Failure value carried along a deferred chain's error path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpcError {
    /// The remote task failed (`return-error` on the wire).
    Application(String),
    /// Protocol-level failure (`epc-error` on the wire).
    Protocol(String),
    /// The connection is gone; no reply can arrive.
    Closed,
}

impl EpcError {
    /// Application-level error with the given message.
    pub fn application(message: impl Into<String>) -> EpcError {
        EpcError::Application(message.into())
    }

    /// Protocol-level error with the given message.
    pub fn protocol(message: impl Into<String>) -> EpcError {
        EpcError::Protocol(message.into())
    }

    /// True for protocol-level failures.
    pub fn is_protocol(&self) -> bool {
        matches!(self, EpcError::Protocol(_))
    }
}

impl fmt::Display for EpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpcError::Application(message) => f.write_str(message),
            EpcError::Protocol(message) => f.write_str(message),
            EpcError::Closed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for EpcError {}
