//! Protocol messages.
//!
//! Every frame carries one proper list whose head names the message kind.
//! `Message` is the typed face of that list; `to_sexp`/`from_sexp` are the
//! only places the list shapes are known.

use std::fmt;

use crate::sexp::Sexp;

/// Event symbols used as message heads and channel keys.
pub mod events {
    pub const CALL: &str = "call";
    pub const RETURN: &str = "return";
    pub const RETURN_ERROR: &str = "return-error";
    pub const EPC_ERROR: &str = "epc-error";
    pub const METHODS: &str = "methods";
}

/// Protocol message.
///
/// Both peers send and receive every variant; the protocol is symmetric.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `(call UID METHOD ARGLIST)` — invoke a method on the peer.
    Call {
        uid: u64,
        method: String,
        args: Vec<Sexp>,
    },
    /// `(return UID VALUE)` — successful reply.
    Return { uid: u64, value: Sexp },
    /// `(return-error UID ERROR)` — the task failed.
    ReturnError { uid: u64, error: Sexp },
    /// `(epc-error UID ERROR)` — the protocol layer failed.
    EpcError { uid: u64, error: Sexp },
    /// `(methods UID)` — ask for the peer's method table.
    Methods { uid: u64 },
}

impl Message {
    /// The event symbol this message dispatches under.
    pub fn event(&self) -> &'static str {
        match self {
            Message::Call { .. } => events::CALL,
            Message::Return { .. } => events::RETURN,
            Message::ReturnError { .. } => events::RETURN_ERROR,
            Message::EpcError { .. } => events::EPC_ERROR,
            Message::Methods { .. } => events::METHODS,
        }
    }

    /// Correlation uid carried by every message kind.
    pub fn uid(&self) -> u64 {
        match self {
            Message::Call { uid, .. }
            | Message::Return { uid, .. }
            | Message::ReturnError { uid, .. }
            | Message::EpcError { uid, .. }
            | Message::Methods { uid } => *uid,
        }
    }

    /// Render as the wire-level list.
    pub fn to_sexp(&self) -> Sexp {
        let uid = |uid: u64| Sexp::Int(uid as i64);
        match self {
            Message::Call { uid: u, method, args } => Sexp::list(vec![
                Sexp::symbol(events::CALL),
                uid(*u),
                Sexp::symbol(method.clone()),
                Sexp::list(args.clone()),
            ]),
            Message::Return { uid: u, value } => Sexp::list(vec![
                Sexp::symbol(events::RETURN),
                uid(*u),
                value.clone(),
            ]),
            Message::ReturnError { uid: u, error } => Sexp::list(vec![
                Sexp::symbol(events::RETURN_ERROR),
                uid(*u),
                error.clone(),
            ]),
            Message::EpcError { uid: u, error } => Sexp::list(vec![
                Sexp::symbol(events::EPC_ERROR),
                uid(*u),
                error.clone(),
            ]),
            Message::Methods { uid: u } => {
                Sexp::list(vec![Sexp::symbol(events::METHODS), uid(*u)])
            }
        }
    }

    /// Decode a wire-level list back into a typed message.
    pub fn from_sexp(value: &Sexp) -> Result<Message, WireError> {
        let items = value.as_list().ok_or(WireError::NotAMessage)?;
        let head = items
            .first()
            .and_then(Sexp::as_sym)
            .ok_or(WireError::NotAMessage)?;
        match head {
            events::CALL => {
                let (uid, rest) = take_uid(events::CALL, &items[1..])?;
                let method = rest
                    .first()
                    .and_then(|s| s.as_sym().or_else(|| s.as_str()))
                    .ok_or(WireError::Malformed {
                        event: events::CALL,
                        reason: "method must be a symbol",
                    })?
                    .to_owned();
                let args = rest
                    .get(1)
                    .and_then(Sexp::as_list)
                    .ok_or(WireError::Malformed {
                        event: events::CALL,
                        reason: "arguments must be a list",
                    })?
                    .to_vec();
                Ok(Message::Call { uid, method, args })
            }
            events::RETURN => {
                let (uid, rest) = take_uid(events::RETURN, &items[1..])?;
                let value = rest.first().cloned().ok_or(WireError::Malformed {
                    event: events::RETURN,
                    reason: "missing value",
                })?;
                Ok(Message::Return { uid, value })
            }
            events::RETURN_ERROR => {
                let (uid, rest) = take_uid(events::RETURN_ERROR, &items[1..])?;
                let error = rest.first().cloned().ok_or(WireError::Malformed {
                    event: events::RETURN_ERROR,
                    reason: "missing error payload",
                })?;
                Ok(Message::ReturnError { uid, error })
            }
            events::EPC_ERROR => {
                let (uid, rest) = take_uid(events::EPC_ERROR, &items[1..])?;
                let error = rest.first().cloned().ok_or(WireError::Malformed {
                    event: events::EPC_ERROR,
                    reason: "missing error payload",
                })?;
                Ok(Message::EpcError { uid, error })
            }
            events::METHODS => {
                let (uid, _) = take_uid(events::METHODS, &items[1..])?;
                Ok(Message::Methods { uid })
            }
            other => Err(WireError::UnknownEvent(other.to_owned())),
        }
    }
}

fn take_uid<'a>(event: &'static str, items: &'a [Sexp]) -> Result<(u64, &'a [Sexp]), WireError> {
    let uid = items
        .first()
        .and_then(Sexp::as_int)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or(WireError::Malformed {
            event,
            reason: "uid must be a non-negative integer",
        })?;
    Ok((uid, &items[1..]))
}

/// Error decoding an inbound event into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Payload is not a list with a symbol head.
    NotAMessage,
    /// The head symbol names no known message kind.
    UnknownEvent(String),
    /// Known kind, wrong shape.
    Malformed {
        event: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::NotAMessage => write!(f, "payload is not an event list"),
            WireError::UnknownEvent(event) => write!(f, "unknown event: {event}"),
            WireError::Malformed { event, reason } => write!(f, "malformed {event}: {reason}"),
        }
    }
}

impl std::error::Error for WireError {}
