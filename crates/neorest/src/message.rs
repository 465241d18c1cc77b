// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-level envelope and message body shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message id. `-1` means send-and-forget: no acknowledgement is expected
/// and the envelope is never retried or deduplicated.
pub type MsgId = i64;

/// Reserved id meaning "send-and-forget".
pub const FORGET: MsgId = -1;

/// A recursively-JSON-serializable payload.
pub type Payload = serde_json::Value;

/// Application-facing verb carried by a `route` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Any,
    Get,
    Post,
    Delete,
    Listen,
    Response,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verb::Any => "ANY",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Listen => "LISTEN",
            Verb::Response => "RESPONSE",
        };
        f.write_str(s)
    }
}

/// Message body, tagged on the wire by `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Set a header entry on the peer. Used to install the reconnect secret.
    Set { key: String, value: Payload },
    /// Liveness probe.
    Ping {},
    /// Subscribe the sender to an outbound route pattern.
    On { route: String },
    /// Unsubscribe the sender from an outbound route pattern.
    Off { route: String },
    /// An application request targeting a route.
    Route {
        route: String,
        verb: Verb,
        data: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    /// Acknowledgement / response to the envelope whose id equals `target`.
    Res { target: MsgId, status: u16, data: Payload },
}

impl MessageBody {
    /// A short name for logging; does not need to round-trip.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Set { .. } => "set",
            MessageBody::Ping {} => "ping",
            MessageBody::On { .. } => "on",
            MessageBody::Off { .. } => "off",
            MessageBody::Route { .. } => "route",
            MessageBody::Res { .. } => "res",
        }
    }
}

/// The sole unit of transmission: `{"id": <int>, "msg": <body>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MsgId,
    pub msg: MessageBody,
}

impl Envelope {
    pub fn new(id: MsgId, msg: MessageBody) -> Self {
        Self { id, msg }
    }

    pub fn forget(msg: MessageBody) -> Self {
        Self { id: FORGET, msg }
    }

    /// `true` unless this is a send-and-forget envelope.
    pub fn needs_ack(&self) -> bool {
        self.id != FORGET && !matches!(self.msg, MessageBody::Res { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(
            3,
            MessageBody::Route {
                route: "/x/7".into(),
                verb: Verb::Post,
                data: serde_json::json!({}),
                headers: None,
            },
        );
        let json = env.to_json().expect("serialize");
        let back = Envelope::from_json(&json).expect("deserialize");
        assert_eq!(back.id, 3);
        match back.msg {
            MessageBody::Route { route, verb, .. } => {
                assert_eq!(route, "/x/7");
                assert_eq!(verb, Verb::Post);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn forget_envelope_does_not_need_ack() {
        let env = Envelope::forget(MessageBody::Ping {});
        assert!(!env.needs_ack());
    }

    #[test]
    fn res_envelope_never_needs_ack() {
        let env = Envelope::new(5, MessageBody::Res { target: 1, status: 200, data: Payload::Null });
        assert!(!env.needs_ack());
    }

    #[test]
    fn verb_serializes_uppercase() {
        let json = serde_json::to_string(&Verb::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }
}
