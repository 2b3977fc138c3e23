//! Control messages exchanged over the encrypted, frame-delimited channel.
//!
//! Every frame is one text message. Verbs:
//!
//! ```text
//! PING                      keepalive probe (client -> server)
//! PONG                      keepalive reply (server -> client)
//! AUTH <id>=<secret>        credential presentation
//! AUTH_SUCCESS:<id>         server accepted the credentials
//! AUTH_FAILED:<reason>      server rejected the credentials
//! TO <id> <payload>         route a payload to another client
//! FROM <id> <payload>       delivery, tagged with the sender's id
//! ```
//!
//! Ids may not contain whitespace or `=`; secrets and payloads are free text
//! (minus the frame delimiter). Deliveries always carry the *sender* id so a
//! recipient can tell who is talking to it.

use std::fmt;

use crate::error::MessageError;

/// Rejection reason the server sends when credentials do not match.
pub const BAD_CREDENTIALS_REASON: &str = "USERNAME_PWD_NOT_MATCH";

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keepalive probe
    Ping,
    /// Keepalive reply
    Pong,
    /// Credential presentation
    Auth {
        /// Claimed client id
        id: String,
        /// Secret paired with the id
        secret: String,
    },
    /// Authentication accepted
    AuthSuccess {
        /// The id that was bound
        id: String,
    },
    /// Authentication rejected
    AuthFailed {
        /// Why the credentials were rejected
        reason: String,
    },
    /// Route a payload to another client
    Route {
        /// Target client id
        to: String,
        /// Payload to deliver
        payload: String,
    },
    /// Payload delivered to this client
    Delivery {
        /// Sender client id
        from: String,
        /// Delivered payload
        payload: String,
    },
}

impl Message {
    /// Parse one frame into a message.
    pub fn parse(frame: &str) -> Result<Self, MessageError> {
        if frame.is_empty() {
            return Err(MessageError::Empty);
        }
        if frame == "PING" {
            return Ok(Self::Ping);
        }
        if frame == "PONG" {
            return Ok(Self::Pong);
        }
        if let Some(rest) = frame.strip_prefix("AUTH_SUCCESS:") {
            let id = valid_id(rest).ok_or(MessageError::Malformed {
                verb: "AUTH_SUCCESS",
                detail: "missing or invalid id",
            })?;
            return Ok(Self::AuthSuccess { id: id.to_owned() });
        }
        if let Some(rest) = frame.strip_prefix("AUTH_FAILED:") {
            if rest.is_empty() {
                return Err(MessageError::Malformed {
                    verb: "AUTH_FAILED",
                    detail: "missing reason",
                });
            }
            return Ok(Self::AuthFailed {
                reason: rest.to_owned(),
            });
        }
        if let Some(rest) = frame.strip_prefix("AUTH ") {
            let (id, secret) = rest.split_once('=').ok_or(MessageError::Malformed {
                verb: "AUTH",
                detail: "missing '=' between id and secret",
            })?;
            let id = valid_id(id).ok_or(MessageError::Malformed {
                verb: "AUTH",
                detail: "missing or invalid id",
            })?;
            return Ok(Self::Auth {
                id: id.to_owned(),
                secret: secret.to_owned(),
            });
        }
        if let Some(rest) = frame.strip_prefix("TO ") {
            let (to, payload) = split_addressed(rest).ok_or(MessageError::Malformed {
                verb: "TO",
                detail: "expected '<id> <payload>'",
            })?;
            return Ok(Self::Route {
                to: to.to_owned(),
                payload: payload.to_owned(),
            });
        }
        if let Some(rest) = frame.strip_prefix("FROM ") {
            let (from, payload) = split_addressed(rest).ok_or(MessageError::Malformed {
                verb: "FROM",
                detail: "expected '<id> <payload>'",
            })?;
            return Ok(Self::Delivery {
                from: from.to_owned(),
                payload: payload.to_owned(),
            });
        }

        let verb = frame.split_whitespace().next().unwrap_or(frame);
        Err(MessageError::UnknownVerb(
            verb.chars().take(32).collect::<String>(),
        ))
    }

    /// The wire verb, for log fields.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Auth { .. } => "AUTH",
            Self::AuthSuccess { .. } => "AUTH_SUCCESS",
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::Route { .. } => "TO",
            Self::Delivery { .. } => "FROM",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => write!(f, "PING"),
            Self::Pong => write!(f, "PONG"),
            Self::Auth { id, secret } => write!(f, "AUTH {id}={secret}"),
            Self::AuthSuccess { id } => write!(f, "AUTH_SUCCESS:{id}"),
            Self::AuthFailed { reason } => write!(f, "AUTH_FAILED:{reason}"),
            Self::Route { to, payload } => write!(f, "TO {to} {payload}"),
            Self::Delivery { from, payload } => write!(f, "FROM {from} {payload}"),
        }
    }
}

fn valid_id(id: &str) -> Option<&str> {
    if id.is_empty() || id.contains(char::is_whitespace) || id.contains('=') {
        None
    } else {
        Some(id)
    }
}

fn split_addressed(rest: &str) -> Option<(&str, &str)> {
    let (id, payload) = rest.split_once(' ')?;
    let id = valid_id(id)?;
    Some((id, payload))
}
