//! obs-websocket v5 wire protocol.
//!
//! Every frame is a UTF-8 JSON text message of the shape
//! `{ "op": <int>, "d": { ... } }`. The opcode selects the payload shape:
//!
//! | op | message                | direction       |
//! |----|------------------------|-----------------|
//! | 0  | `Hello`                | server → client |
//! | 1  | `Identify`             | client → server |
//! | 2  | `Identified`           | server → client |
//! | 3  | `Reidentify`           | client → server |
//! | 5  | `Event`                | server → client |
//! | 6  | `Request`              | client → server |
//! | 7  | `RequestResponse`      | server → client |
//! | 8  | `RequestBatch`         | client → server |
//! | 9  | `RequestBatchResponse` | server → client |
//!
//! Opcodes outside this table decode to [`Message::Unhandled`] so that newer
//! servers don't break older clients.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ObsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Hello = 0,
    Identify = 1,
    Identified = 2,
    Reidentify = 3,
    Event = 5,
    Request = 6,
    RequestResponse = 7,
    RequestBatch = 8,
    RequestBatchResponse = 9,
}

impl OpCode {
    pub fn from_i64(op: i64) -> Option<Self> {
        Some(match op {
            0 => Self::Hello,
            1 => Self::Identify,
            2 => Self::Identified,
            3 => Self::Reidentify,
            5 => Self::Event,
            6 => Self::Request,
            7 => Self::RequestResponse,
            8 => Self::RequestBatch,
            9 => Self::RequestBatchResponse,
            _ => return None,
        })
    }
}

/// Bitset of event categories a session asks the server to push.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventSubscription(u32);

impl EventSubscription {
    pub const NONE: Self = Self(0);
    pub const GENERAL: Self = Self(1 << 0);
    pub const CONFIG: Self = Self(1 << 1);
    pub const SCENES: Self = Self(1 << 2);
    pub const INPUTS: Self = Self(1 << 3);
    pub const TRANSITIONS: Self = Self(1 << 4);
    pub const FILTERS: Self = Self(1 << 5);
    pub const OUTPUTS: Self = Self(1 << 6);
    pub const SCENE_ITEMS: Self = Self(1 << 7);
    pub const MEDIA_INPUTS: Self = Self(1 << 8);
    pub const VENDORS: Self = Self(1 << 9);
    pub const UI: Self = Self(1 << 10);
    pub const ALL: Self = Self((1 << 11) - 1);

    const NAMED: [(&'static str, Self); 11] = [
        ("General", Self::GENERAL),
        ("Config", Self::CONFIG),
        ("Scenes", Self::SCENES),
        ("Inputs", Self::INPUTS),
        ("Transitions", Self::TRANSITIONS),
        ("Filters", Self::FILTERS),
        ("Outputs", Self::OUTPUTS),
        ("SceneItems", Self::SCENE_ITEMS),
        ("MediaInputs", Self::MEDIA_INPUTS),
        ("Vendors", Self::VENDORS),
        ("Ui", Self::UI),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build a mask from raw bits, discarding bits with no defined category.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Look up a category by name (case-insensitive). `All` and `None` are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("all") {
            return Some(Self::ALL);
        }
        if name.eq_ignore_ascii_case("none") {
            return Some(Self::NONE);
        }
        Self::NAMED
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, s)| *s)
    }

    /// Combine a list of category names into one mask.
    pub fn from_names<I, S>(names: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::NONE, |acc, name| {
            let name = name.as_ref();
            Self::from_name(name)
                .map(|s| acc | s)
                .ok_or_else(|| format!("Unknown event subscription category: {name}"))
        })
    }
}

impl BitOr for EventSubscription {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSubscription {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return write!(f, "EventSubscription(All)");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(_, s)| self.contains(*s))
            .map(|(n, _)| *n)
            .collect();
        write!(f, "EventSubscription({})", names.join(" | "))
    }
}

/// Authentication parameters offered by the server in `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub obs_studio_version: String,
    pub obs_web_socket_version: String,
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    pub event_subscriptions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reidentify {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_subscriptions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    pub event_intent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

/// One entry of a `RequestBatch`. The per-entry id is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatch {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_type: Option<i32>,
    pub requests: Vec<BatchRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatchResponse {
    pub request_id: String,
    pub results: Vec<BatchResult>,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Identify(Identify),
    Identified(Identified),
    Reidentify(Reidentify),
    Event(Event),
    Request(Request),
    RequestResponse(RequestResponse),
    RequestBatch(RequestBatch),
    RequestBatchResponse(RequestBatchResponse),
    /// Opcode this client does not know. Kept so callers can log it.
    Unhandled { op: i64, d: Value },
}

impl Message {
    pub fn op(&self) -> i64 {
        match self {
            Self::Hello(_) => OpCode::Hello as i64,
            Self::Identify(_) => OpCode::Identify as i64,
            Self::Identified(_) => OpCode::Identified as i64,
            Self::Reidentify(_) => OpCode::Reidentify as i64,
            Self::Event(_) => OpCode::Event as i64,
            Self::Request(_) => OpCode::Request as i64,
            Self::RequestResponse(_) => OpCode::RequestResponse as i64,
            Self::RequestBatch(_) => OpCode::RequestBatch as i64,
            Self::RequestBatchResponse(_) => OpCode::RequestBatchResponse as i64,
            Self::Unhandled { op, .. } => *op,
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    op: i64,
    d: Value,
}

/// Encode a message into a JSON text frame.
pub fn encode(message: &Message) -> Result<String, ObsError> {
    let d = match message {
        Message::Hello(m) => serde_json::to_value(m),
        Message::Identify(m) => serde_json::to_value(m),
        Message::Identified(m) => serde_json::to_value(m),
        Message::Reidentify(m) => serde_json::to_value(m),
        Message::Event(m) => serde_json::to_value(m),
        Message::Request(m) => serde_json::to_value(m),
        Message::RequestResponse(m) => serde_json::to_value(m),
        Message::RequestBatch(m) => serde_json::to_value(m),
        Message::RequestBatchResponse(m) => serde_json::to_value(m),
        Message::Unhandled { d, .. } => Ok(d.clone()),
    }
    .map_err(|e| ObsError::MalformedMessage(format!("encode failed: {e}")))?;

    Ok(json!({ "op": message.op(), "d": d }).to_string())
}

/// Decode a JSON text frame. Unknown opcodes yield [`Message::Unhandled`].
pub fn decode(text: &str) -> Result<Message, ObsError> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| ObsError::MalformedMessage(format!("invalid frame: {e}")))?;

    let Some(op) = OpCode::from_i64(raw.op) else {
        return Ok(Message::Unhandled { op: raw.op, d: raw.d });
    };

    Ok(match op {
        OpCode::Hello => Message::Hello(payload(op, raw.d)?),
        OpCode::Identify => Message::Identify(payload(op, raw.d)?),
        OpCode::Identified => Message::Identified(payload(op, raw.d)?),
        OpCode::Reidentify => Message::Reidentify(payload(op, raw.d)?),
        OpCode::Event => Message::Event(payload(op, raw.d)?),
        OpCode::Request => Message::Request(payload(op, raw.d)?),
        OpCode::RequestResponse => Message::RequestResponse(payload(op, raw.d)?),
        OpCode::RequestBatch => Message::RequestBatch(payload(op, raw.d)?),
        OpCode::RequestBatchResponse => Message::RequestBatchResponse(payload(op, raw.d)?),
    })
}

fn payload<T: DeserializeOwned>(op: OpCode, d: Value) -> Result<T, ObsError> {
    serde_json::from_value(d)
        .map_err(|e| ObsError::MalformedMessage(format!("{op:?} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello_with_authentication() {
        let text = r#"{"op":0,"d":{"obsStudioVersion":"30.1.2","obsWebSocketVersion":"5.4.2","rpcVersion":1,"authentication":{"challenge":"+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=","salt":"lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI="}}}"#;
        let Message::Hello(hello) = decode(text).unwrap() else {
            panic!("expected Hello");
        };
        assert_eq!(hello.rpc_version, 1);
        assert_eq!(hello.obs_web_socket_version, "5.4.2");
        let auth = hello.authentication.unwrap();
        assert_eq!(auth.salt, "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=");
    }

    #[test]
    fn decodes_hello_without_authentication() {
        let text = r#"{"op":0,"d":{"obsStudioVersion":"30.0.0","obsWebSocketVersion":"5.3.0","rpcVersion":1}}"#;
        let Message::Hello(hello) = decode(text).unwrap() else {
            panic!("expected Hello");
        };
        assert!(hello.authentication.is_none());
    }

    #[test]
    fn identify_omits_absent_authentication() {
        let text = encode(&Message::Identify(Identify {
            rpc_version: 1,
            authentication: None,
            event_subscriptions: EventSubscription::ALL.bits(),
        }))
        .unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, json!({"op": 1, "d": {"rpcVersion": 1, "eventSubscriptions": 2047}}));
    }

    #[test]
    fn request_encodes_camel_case_fields() {
        let text = encode(&Message::Request(Request {
            request_type: "SetCurrentProgramScene".into(),
            request_id: "abc".into(),
            request_data: Some(json!({"sceneName": "Live"})),
        }))
        .unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["op"], 6);
        assert_eq!(v["d"]["requestType"], "SetCurrentProgramScene");
        assert_eq!(v["d"]["requestId"], "abc");
        assert_eq!(v["d"]["requestData"]["sceneName"], "Live");
    }

    #[test]
    fn decodes_failed_request_response() {
        let text = r#"{"op":7,"d":{"requestType":"GetSceneItemId","requestId":"r1","requestStatus":{"result":false,"code":600,"comment":"No scene items were found"}}}"#;
        let Message::RequestResponse(resp) = decode(text).unwrap() else {
            panic!("expected RequestResponse");
        };
        assert!(!resp.request_status.result);
        assert_eq!(resp.request_status.code, 600);
        assert_eq!(resp.request_status.comment.as_deref(), Some("No scene items were found"));
        assert!(resp.response_data.is_none());
    }

    #[test]
    fn decodes_event_without_data() {
        let text = r#"{"op":5,"d":{"eventType":"ExitStarted","eventIntent":1}}"#;
        let Message::Event(event) = decode(text).unwrap() else {
            panic!("expected Event");
        };
        assert_eq!(event.event_type, "ExitStarted");
        assert!(event.event_data.is_none());
    }

    #[test]
    fn unknown_opcode_is_unhandled_not_error() {
        let msg = decode(r#"{"op":42,"d":{"future":true}}"#).unwrap();
        assert_eq!(msg, Message::Unhandled { op: 42, d: json!({"future": true}) });

        // 4 is a gap in the opcode table
        assert!(matches!(decode(r#"{"op":4,"d":{}}"#).unwrap(), Message::Unhandled { op: 4, .. }));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{"op":2,"d":{"negotiatedRpcVersion":1,"somethingNew":[1,2]}}"#;
        assert_eq!(
            decode(text).unwrap(),
            Message::Identified(Identified { negotiated_rpc_version: 1 })
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in [
            "not json",
            r#"{"d":{}}"#,
            r#"{"op":2}"#,
            r#"{"op":2,"d":{}}"#,
            r#"{"op":7,"d":{"requestType":"GetVersion","requestId":"x"}}"#,
            r#"{"op":"0","d":{}}"#,
        ] {
            assert!(
                matches!(decode(text), Err(ObsError::MalformedMessage(_))),
                "expected MalformedMessage for {text}"
            );
        }
    }

    #[test]
    fn batch_response_decodes_results() {
        let text = r#"{"op":9,"d":{"requestId":"b1","results":[
            {"requestType":"GetVersion","requestStatus":{"result":true,"code":100},"responseData":{"rpcVersion":1}},
            {"requestType":"Sleep","requestStatus":{"result":false,"code":402}}
        ]}}"#;
        let Message::RequestBatchResponse(resp) = decode(text).unwrap() else {
            panic!("expected RequestBatchResponse");
        };
        assert_eq!(resp.request_id, "b1");
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[1].request_status.code, 402);
    }

    #[test]
    fn subscription_all_covers_every_category() {
        assert_eq!(EventSubscription::ALL.bits(), 0x7ff);
        for (_, s) in EventSubscription::NAMED {
            assert!(EventSubscription::ALL.contains(s));
        }
        assert_eq!(EventSubscription::from_bits_truncate(u32::MAX), EventSubscription::ALL);
    }

    #[test]
    fn subscription_from_names() {
        let mask = EventSubscription::from_names(["Scenes", "outputs"]).unwrap();
        assert_eq!(mask, EventSubscription::SCENES | EventSubscription::OUTPUTS);
        assert_eq!(mask.bits(), (1 << 2) | (1 << 6));
        assert!(EventSubscription::from_names(["Bogus"]).is_err());
        assert_eq!(EventSubscription::from_names(["All"]).unwrap(), EventSubscription::ALL);
    }
}
