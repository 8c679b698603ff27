//! Wire messages.
//!
//! Every message is `{"type": ..., "data": {...}}`. A batch arrives as a
//! single message, an array of messages, or a session-wrapped object
//! `{"session": "3", "messages": [...]}`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ProtocolError;
use crate::ids::{ObjId, VarId};

pub type Properties = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Message {
    Create(CreateMessage),
    Destroy(VarMessage),
    Update(UpdateMessage),
    Watch(VarMessage),
    Unwatch(VarMessage),
    Error(ErrorMessage),
    Get(GetMessage),
    GetObjects(GetObjectsMessage),
    Poll(PollMessage),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    /// Caller-assigned id from its own range. Allocated by the engine when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<VarId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<VarId>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, rename = "nowatch", skip_serializing_if = "std::ops::Not::not")]
    pub no_watch: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unbound: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarMessage {
    pub var_id: VarId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub var_id: VarId,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_id: Option<VarId>,
    pub code: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessage {
    pub var_ids: Vec<VarId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetObjectsMessage {
    pub obj_ids: Vec<ObjId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PollMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<String>,
}

/// One entry of a `get` result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableData {
    pub id: VarId,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

/// One entry of a `getObjects` result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    #[serde(rename = "obj")]
    pub id: ObjId,
    pub value: serde_json::Value,
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Destroy(_) => "destroy",
            Self::Update(_) => "update",
            Self::Watch(_) => "watch",
            Self::Unwatch(_) => "unwatch",
            Self::Error(_) => "error",
            Self::Get(_) => "get",
            Self::GetObjects(_) => "getObjects",
            Self::Poll(_) => "poll",
        }
    }

    /// The variable this message targets, if it targets exactly one.
    pub fn var_id(&self) -> Option<VarId> {
        match self {
            Self::Create(m) => m.id,
            Self::Destroy(m) | Self::Watch(m) | Self::Unwatch(m) => Some(m.var_id),
            Self::Update(m) => Some(m.var_id),
            Self::Error(m) => m.var_id,
            Self::Get(_) | Self::GetObjects(_) | Self::Poll(_) => None,
        }
    }

    pub fn update(var_id: VarId, value: Option<serde_json::Value>, properties: Properties) -> Self {
        Self::Update(UpdateMessage {
            var_id,
            value,
            properties,
        })
    }

    pub fn destroy(var_id: VarId) -> Self {
        Self::Destroy(VarMessage { var_id })
    }

    pub fn watch(var_id: VarId) -> Self {
        Self::Watch(VarMessage { var_id })
    }

    pub fn unwatch(var_id: VarId) -> Self {
        Self::Unwatch(VarMessage { var_id })
    }

    pub fn error(var_id: Option<VarId>, err: &ProtocolError) -> Self {
        Self::Error(ErrorMessage {
            var_id,
            code: err.code().to_string(),
            description: err.to_string(),
        })
    }

    /// Decode one message from an already-parsed JSON value.
    pub fn decode(raw: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(raw).map_err(ProtocolError::malformed)
    }
}

/// An incoming batch before the individual messages are decoded, so one
/// malformed entry cannot reject its siblings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub session: Option<String>,
    pub messages: Vec<serde_json::Value>,
    /// Set by display clients when the batch stems from direct user input;
    /// replies to it skip the outgoing debounce.
    pub user_event: bool,
}

impl Batch {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let json: serde_json::Value =
            serde_json::from_slice(payload).map_err(ProtocolError::malformed)?;
        Self::from_json(json)
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self, ProtocolError> {
        match json {
            serde_json::Value::Array(messages) => Ok(Self {
                messages,
                ..Self::default()
            }),
            serde_json::Value::Object(mut map) if map.contains_key("messages") => {
                let session = match map.remove("session") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(serde_json::Value::String(s)) => Some(s),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    Some(other) => {
                        return Err(ProtocolError::malformed(format!(
                            "session must be a string, got {other}"
                        )))
                    }
                };
                match map.remove("messages") {
                    Some(serde_json::Value::Array(messages)) => Ok(Self {
                        session,
                        messages,
                        user_event: user_event(map.get("userEvent")),
                    }),
                    _ => Err(ProtocolError::malformed("messages must be an array")),
                }
            }
            single @ serde_json::Value::Object(_) => Ok(Self {
                messages: vec![single],
                ..Self::default()
            }),
            other => Err(ProtocolError::malformed(format!(
                "expected message, array or session batch, got {other}"
            ))),
        }
    }
}

fn user_event(flag: Option<&serde_json::Value>) -> bool {
    matches!(flag, Some(serde_json::Value::Bool(true)))
}

/// A batch addressed to an interpreted-backend session on a shared transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionBatch {
    pub session: String,
    pub messages: Vec<Message>,
}

/// Anything that can sit in a connection's pending queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outgoing {
    Message(Message),
    Batch(SessionBatch),
}

impl From<Message> for Outgoing {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

impl From<SessionBatch> for Outgoing {
    fn from(batch: SessionBatch) -> Self {
        Self::Batch(batch)
    }
}

/// Response to every request on the packet and text protocols.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The wire id of the session the request applied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<Outgoing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Parse a long-poll wait: `"250ms"`, `"5s"`, `"1m"`, `"1.5s"`, or a bare
/// number of milliseconds.
pub fn parse_wait(s: &str) -> Result<Duration, ProtocolError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let amount: f64 = number
        .parse()
        .map_err(|_| ProtocolError::malformed(format!("invalid wait {s:?}")))?;
    let millis = match unit {
        "" | "ms" => amount,
        "us" | "µs" => amount / 1000.0,
        "s" => amount * 1000.0,
        "m" => amount * 60_000.0,
        "h" => amount * 3_600_000.0,
        _ => return Err(ProtocolError::malformed(format!("invalid wait unit {unit:?}"))),
    };
    Ok(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
}

impl PollMessage {
    pub fn wait_duration(&self) -> Result<Duration, ProtocolError> {
        self.wait.as_deref().map_or(Ok(Duration::ZERO), parse_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_wire_shape() {
        let raw = json!({
            "type": "create",
            "data": {"parentId": 1, "value": 3, "properties": {"path": "count"}, "nowatch": true}
        });
        let msg = Message::decode(raw).unwrap();
        let Message::Create(create) = &msg else {
            panic!("expected create, got {msg:?}");
        };
        assert_eq!(create.parent_id, Some(VarId(1)));
        assert_eq!(create.value, Some(json!(3)));
        assert_eq!(create.properties.get("path").map(String::as_str), Some("count"));
        assert!(create.no_watch);
        assert!(!create.unbound);
        assert_eq!(create.id, None);
    }

    #[test]
    fn explicit_null_value_is_present() {
        let msg = Message::decode(json!({"type": "update", "data": {"varId": 4, "value": null}})).unwrap();
        assert_eq!(msg, Message::update(VarId(4), Some(serde_json::Value::Null), Properties::new()));

        let msg = Message::decode(json!({"type": "update", "data": {"varId": 4}})).unwrap();
        assert_eq!(msg, Message::update(VarId(4), None, Properties::new()));
    }

    #[test]
    fn get_objects_tag_is_camel_case() {
        let json = serde_json::to_value(Message::GetObjects(GetObjectsMessage {
            obj_ids: vec![ObjId(-1)],
        }))
        .unwrap();
        assert_eq!(json, json!({"type": "getObjects", "data": {"objIds": [-1]}}));
    }

    #[test]
    fn error_push_shape() {
        let err = ProtocolError::path_failure("a.b", "a is missing");
        let json = serde_json::to_value(Message::error(Some(VarId(9)), &err)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["varId"], 9);
        assert_eq!(json["data"]["code"], "path-failure");
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = Message::decode(json!({"type": "explode", "data": {}})).unwrap_err();
        assert_eq!(err.code(), "malformed");
    }

    #[test]
    fn batch_forms() {
        let single = Batch::parse(br#"{"type":"watch","data":{"varId":1}}"#).unwrap();
        assert_eq!(single.session, None);
        assert_eq!(single.messages.len(), 1);

        let array = Batch::parse(br#"[{"type":"watch","data":{"varId":1}}, {"bogus": true}]"#).unwrap();
        assert_eq!(array.messages.len(), 2);

        let wrapped = Batch::parse(br#"{"session":"3","messages":[]}"#).unwrap();
        assert_eq!(wrapped.session.as_deref(), Some("3"));
        assert!(!wrapped.user_event);

        let typed = Batch::parse(br#"{"messages":[],"userEvent":true}"#).unwrap();
        assert_eq!(typed.session, None);
        assert!(typed.user_event);

        let numeric = Batch::parse(br#"{"session":3,"messages":[]}"#).unwrap();
        assert_eq!(numeric.session.as_deref(), Some("3"));

        assert!(Batch::parse(b"not json").is_err());
        assert!(Batch::parse(b"42").is_err());
        assert!(Batch::parse(br#"{"session":"1","messages":{}}"#).is_err());
    }

    #[test]
    fn outgoing_serializes_untagged() {
        let batch = Outgoing::Batch(SessionBatch {
            session: "2".into(),
            messages: vec![Message::watch(VarId(5))],
        });
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["session"], "2");
        assert_eq!(json["messages"][0]["type"], "watch");

        let back: Outgoing = serde_json::from_value(json).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_string(&Response::default()).unwrap();
        assert_eq!(json, "{}");
        let json = serde_json::to_value(Response::error("unknown session")).unwrap();
        assert_eq!(json, json!({"error": "unknown session"}));
    }

    #[test]
    fn wait_durations() {
        assert_eq!(parse_wait("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_wait("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_wait("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_wait("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_wait("100").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_wait("").unwrap(), Duration::ZERO);
        assert!(parse_wait("soon").is_err());
        assert!(parse_wait("5y").is_err());
    }
}
