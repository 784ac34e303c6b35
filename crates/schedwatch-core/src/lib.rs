use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod rpc;

/// Identifier of a resource (job). The scheduler sends numbers, the dashboard
/// keys everything by the string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for ResourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_id(deserializer).map(ResourceId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceState {
    Waiting,
    Ready,
    Running,
    OnHold,
    Error,
    Done,
}

impl ResourceState {
    pub const ALL: [ResourceState; 6] = [
        ResourceState::Waiting,
        ResourceState::Ready,
        ResourceState::Running,
        ResourceState::OnHold,
        ResourceState::Error,
        ResourceState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Waiting => "waiting",
            ResourceState::Ready => "ready",
            ResourceState::Running => "running",
            ResourceState::OnHold => "on_hold",
            ResourceState::Error => "error",
            ResourceState::Done => "done",
        }
    }

    /// Position in [`ResourceState::ALL`]; used to index counter tables.
    pub fn index(&self) -> usize {
        match self {
            ResourceState::Waiting => 0,
            ResourceState::Ready => 1,
            ResourceState::Running => 2,
            ResourceState::OnHold => 3,
            ResourceState::Error => 4,
            ResourceState::Done => 5,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "waiting" => Ok(ResourceState::Waiting),
            "ready" => Ok(ResourceState::Ready),
            "running" => Ok(ResourceState::Running),
            "on_hold" | "on-hold" | "onhold" => Ok(ResourceState::OnHold),
            "error" => Ok(ResourceState::Error),
            "done" => Ok(ResourceState::Done),
            other => Err(format!("Unknown resource state: {other}")),
        }
    }
}

impl Serialize for ResourceState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StateVisitor;

        impl<'de> Visitor<'de> for StateVisitor {
            type Value = ResourceState;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a resource state name")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<ResourceState>().map_err(E::custom)
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_str(StateVisitor)
    }
}

/// One `(name, value)` tag attached to a resource. Order is significant and
/// names may repeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    #[serde(default)]
    pub locator: String,
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(
        default,
        rename = "taskid",
        alias = "taskId",
        alias = "task_id",
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_tags", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
}

impl ResourceRecord {
    pub fn new(
        id: impl Into<ResourceId>,
        locator: impl Into<String>,
        state: ResourceState,
    ) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            state,
            progress: None,
            task_id: None,
            tags: Vec::new(),
        }
    }
}

/// The experiment the dashboard is currently mirroring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    pub name: String,
    /// Milliseconds since the epoch; `0` asks the server for the latest run.
    #[serde(default)]
    pub timestamp: i64,
}

impl Experiment {
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
        }
    }

    pub fn matches(&self, name: &str, timestamp: i64) -> bool {
        self.name == name && self.timestamp == timestamp
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

/// Entry of the `experiments.latest-names` listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentReference {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ExperimentReference {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentInfo {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Result of `experiments.resources`: the experiment, its task id -> task name
/// mapping and the resources of that run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSnapshot {
    #[serde(default)]
    pub experiment: Option<ExperimentInfo>,
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BuildInformation {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, rename = "commitID")]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub tags: Value,
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Tags arrive either as `[name, value]` pairs or as `{name, value}` objects.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<Tag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Value = Value::deserialize(deserializer)?;
    let items = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => return Err(serde::de::Error::custom("expected an array of tags")),
    };
    let mut tags = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(mut pair) if pair.len() == 2 => {
                let value = pair.pop().unwrap_or(Value::Null);
                let name = match pair.pop() {
                    Some(Value::String(name)) => name,
                    _ => return Err(serde::de::Error::custom("tag name must be a string")),
                };
                tags.push(Tag { name, value });
            }
            Value::Object(_) => {
                let tag: Tag = serde_json::from_value(item).map_err(serde::de::Error::custom)?;
                tags.push(tag);
            }
            _ => return Err(serde::de::Error::custom("invalid tag entry")),
        }
    }
    Ok(tags)
}
