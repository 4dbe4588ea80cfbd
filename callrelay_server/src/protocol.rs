//! Wire protocol shared by the relay and its browser clients
//!
//! Every frame is a JSON object discriminated by its `type` field. Session
//! descriptions and connectivity candidates travel in `data` as opaque strings;
//! the relay never looks inside them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Server-assigned identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Allocate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one call attempt, generated by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Allocate a fresh random id (122 random bits)
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Call status as advertised in presence snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "calling")]
    Calling,
    #[serde(rename = "ringing")]
    Ringing,
    #[serde(rename = "in-call")]
    InCall,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::InCall => "in-call",
        };
        f.write_str(s)
    }
}

/// One entry of a `peer_list` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: PeerId,
    pub status: CallStatus,
}

/// Messages a client sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask for the server-assigned peer id
    Register,
    /// Find an idle peer (or the named one) and ring it with an offer
    InitiateCall {
        #[serde(default)]
        data: String,
        #[serde(default)]
        target_peer: Option<PeerId>,
    },
    /// Answer a ringing call
    AcceptCall {
        call_id: CallId,
        #[serde(default)]
        data: String,
    },
    /// Decline a ringing call
    RejectCall {
        call_id: CallId,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Renegotiation offer inside an established call
    Offer { call_id: CallId, data: String },
    /// Renegotiation answer inside an established call
    Answer { call_id: CallId, data: String },
    #[serde(rename = "ice-candidate")]
    IceCandidate { call_id: CallId, data: String },
    /// Leave the current call
    Hangup {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        reason: Option<String>,
    },
    Ping,
}

impl FromStr for ClientMessage {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

/// Messages the relay sends to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RegisterSuccess {
        peer_id: PeerId,
    },
    /// Sent to the initiator once a callee has been picked
    CallInitiated {
        call_id: CallId,
        peer_id: PeerId,
    },
    IncomingCall {
        call_id: CallId,
        caller_id: PeerId,
        data: String,
    },
    Answer {
        call_id: CallId,
        peer_id: PeerId,
        data: String,
    },
    Offer {
        call_id: CallId,
        peer_id: PeerId,
        data: String,
    },
    CallRejected {
        call_id: CallId,
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        call_id: CallId,
        peer_id: PeerId,
        data: String,
    },
    PeerDisconnected {
        call_id: CallId,
        peer_id: PeerId,
        reason: String,
    },
    Pong,
    PeerList {
        peers: Vec<PeerStatus>,
    },
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
}

impl ServerMessage {
    /// Shorthand for an `error` reply
    pub fn error(reason: impl Into<String>, call_id: Option<CallId>) -> Self {
        ServerMessage::Error {
            reason: reason.into(),
            call_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl FromStr for ServerMessage {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hyphenated_ice_candidate() {
        let call_id = CallId::new();
        let raw = format!(
            r#"{{"type":"ice-candidate","callId":"{call_id}","data":"{{\"candidate\":\"x\"}}"}}"#
        );
        let msg: ClientMessage = raw.parse().unwrap();
        assert_eq!(
            msg,
            ClientMessage::IceCandidate {
                call_id,
                data: r#"{"candidate":"x"}"#.to_string(),
            }
        );
    }

    #[test]
    fn unit_variants_ignore_extra_fields() {
        let msg: ClientMessage = r#"{"type":"register","name":"alice"}"#.parse().unwrap();
        assert_eq!(msg, ClientMessage::Register);
        let msg: ClientMessage = r#"{"type":"ping"}"#.parse().unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn hangup_fields_are_optional() {
        let msg: ClientMessage = r#"{"type":"hangup"}"#.parse().unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hangup {
                call_id: None,
                reason: None
            }
        );
    }

    #[test]
    fn initiate_call_reads_target_peer() {
        let target = PeerId::new();
        let raw = format!(r#"{{"type":"initiate_call","data":"sdp","targetPeer":"{target}"}}"#);
        let msg: ClientMessage = raw.parse().unwrap();
        assert_eq!(
            msg,
            ClientMessage::InitiateCall {
                data: "sdp".to_string(),
                target_peer: Some(target),
            }
        );
    }

    #[test]
    fn rejects_unknown_type_and_missing_fields() {
        assert!(r#"{"type":"presence_update","status":"in-call"}"#.parse::<ClientMessage>().is_err());
        assert!(r#"{"type":"accept_call","data":"sdp"}"#.parse::<ClientMessage>().is_err());
        assert!(r#"{"callId":"x"}"#.parse::<ClientMessage>().is_err());
        assert!("not json".parse::<ClientMessage>().is_err());
    }

    #[test]
    fn encodes_peer_list_with_status_strings() {
        let id = PeerId::new();
        let msg = ServerMessage::PeerList {
            peers: vec![PeerStatus {
                id,
                status: CallStatus::InCall,
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "peer_list");
        assert_eq!(value["peers"][0]["id"], id.to_string());
        assert_eq!(value["peers"][0]["status"], "in-call");
    }

    #[test]
    fn error_omits_missing_call_id() {
        let json = ServerMessage::error("no peers available", None).to_json().unwrap();
        assert_eq!(json, r#"{"type":"error","reason":"no peers available"}"#);
    }

    #[test]
    fn incoming_call_uses_camel_case_fields() {
        let call_id = CallId::new();
        let caller_id = PeerId::new();
        let msg = ServerMessage::IncomingCall {
            call_id,
            caller_id,
            data: "offer".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "incoming_call");
        assert_eq!(value["callId"], call_id.to_string());
        assert_eq!(value["callerId"], caller_id.to_string());
    }
}
