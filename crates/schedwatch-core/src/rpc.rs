use crate::{ResourceId, ResourceRecord, ResourceState};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
/// Inbound cap; experiment snapshots run to many megabytes.
pub const DEFAULT_MAX_INBOUND_BYTES: usize = 64 * 1024 * 1024;
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of an outbound call. The server echoes ids back as strings,
/// so both numeric and string forms are accepted on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RequestIdVisitor;

        impl<'de> Visitor<'de> for RequestIdVisitor {
            type Value = RequestId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a request id as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(RequestId(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!("request id cannot be negative: {value}")));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let id = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|err| E::custom(format!("invalid request id '{value}': {err}")))?;
                Ok(RequestId(id))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(RequestIdVisitor)
    }
}

/// Outbound envelope. Calls carry an `id`; notifications do not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn call(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params: normalize_params(params),
        }
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: normalize_params(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// The server rejects a missing params member for some methods; send `{}`.
fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceAdded,
    StateChanged,
    Progress,
    ResourceRemoved,
    ExperimentResourceAdded,
    ExperimentAdded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ResourceAdded => "RESOURCE_ADDED",
            EventKind::StateChanged => "STATE_CHANGED",
            EventKind::Progress => "PROGRESS",
            EventKind::ResourceRemoved => "RESOURCE_REMOVED",
            EventKind::ExperimentResourceAdded => "EXPERIMENT_RESOURCE_ADDED",
            EventKind::ExperimentAdded => "EXPERIMENT_ADDED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "RESOURCE_ADDED" => Ok(EventKind::ResourceAdded),
            "STATE_CHANGED" => Ok(EventKind::StateChanged),
            "PROGRESS" => Ok(EventKind::Progress),
            "RESOURCE_REMOVED" => Ok(EventKind::ResourceRemoved),
            "EXPERIMENT_RESOURCE_ADDED" => Ok(EventKind::ExperimentResourceAdded),
            "EXPERIMENT_ADDED" => Ok(EventKind::ExperimentAdded),
            other => Err(format!("Unknown event: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangedPayload {
    #[serde(alias = "resource")]
    pub id: ResourceId,
    pub state: ResourceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    #[serde(alias = "resource")]
    pub id: ResourceId,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRemovedPayload {
    #[serde(alias = "resource")]
    pub id: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentResourcePayload {
    pub name: String,
    #[serde(default)]
    pub timestamp: i64,
    pub resource: ResourceRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentAddedPayload {
    pub name: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Push notification carried in `result` with an `event` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    ResourceAdded(ResourceRecord),
    StateChanged(StateChangedPayload),
    Progress(ProgressPayload),
    ResourceRemoved(ResourceRemovedPayload),
    ExperimentResourceAdded(ExperimentResourcePayload),
    ExperimentAdded(ExperimentAddedPayload),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::ResourceAdded(_) => EventKind::ResourceAdded,
            ServerEvent::StateChanged(_) => EventKind::StateChanged,
            ServerEvent::Progress(_) => EventKind::Progress,
            ServerEvent::ResourceRemoved(_) => EventKind::ResourceRemoved,
            ServerEvent::ExperimentResourceAdded(_) => EventKind::ExperimentResourceAdded,
            ServerEvent::ExperimentAdded(_) => EventKind::ExperimentAdded,
        }
    }
}

/// Classification of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: Option<RequestId>,
        result: Value,
    },
    Error {
        id: Option<RequestId>,
        error: RpcErrorObject,
    },
    Event(ServerEvent),
    UnknownEvent {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidEvent { kind: EventKind, reason: String },
}

pub fn encode_request(request: &RpcRequest, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(request).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<Inbound, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    classify_inbound(value)
}

pub fn classify_inbound(value: Value) -> Result<Inbound, FrameError> {
    let Value::Object(mut object) = value else {
        return Err(FrameError::Decode("message is not a JSON object".to_string()));
    };
    let id = object.get("id").and_then(parse_request_id);

    match object.remove("error") {
        Some(Value::Null) | None => {}
        Some(error) => {
            let error = serde_json::from_value::<RpcErrorObject>(error)
                .map_err(|err| FrameError::Decode(format!("invalid error member: {err}")))?;
            return Ok(Inbound::Error { id, error });
        }
    }

    let Some(result) = object.remove("result") else {
        return Err(FrameError::Decode(
            "message has neither result nor error".to_string(),
        ));
    };

    let event_name = result
        .as_object()
        .and_then(|map| map.get("event"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(name) = event_name else {
        return Ok(Inbound::Response { id, result });
    };

    let kind = match name.parse::<EventKind>() {
        Ok(kind) => kind,
        Err(_) => return Ok(Inbound::UnknownEvent { name }),
    };
    serde_json::from_value::<ServerEvent>(result)
        .map(Inbound::Event)
        .map_err(|err| FrameError::InvalidEvent {
            kind,
            reason: err.to_string(),
        })
}

/// Correlation id of a message that could not be decoded, if one can still
/// be read from it.
pub fn peek_response_id(text: &str) -> Option<RequestId> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(default)]
        id: Value,
    }
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    parse_request_id(&envelope.id)
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    if value.is_null() {
        return None;
    }
    RequestId::deserialize(value).ok()
}
