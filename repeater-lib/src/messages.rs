//! Payloads exchanged with the control plane over the bus.
//!
//! Every payload is JSON. `BusMessage::TYPE` is the logical message name
//! carried next to the payload so the receiving side can dispatch it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::headers::Headers;

/// A payload with a fixed message name on the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

/// Registration command sent once per run, answered with a
/// [`RegistrationOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterRegistering {
    pub repeater_id: String,
    pub version: String,
    pub local_scripts_used: bool,
}

impl BusMessage for RepeaterRegistering {
    const TYPE: &'static str = "RepeaterRegistering";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotActive,
    NotFound,
    Busy,
    RequiresToBeUpdated,
}

/// Scripts pushed by the control plane: either one script for every host or
/// a map of hostname wildcard to source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteScripts {
    Single(String),
    ByHost(serde_json::Map<String, Value>),
}

impl RemoteScripts {
    /// `(pattern, source)` pairs in the order they were sent. A single script
    /// applies to `*`. Non-string values in the map are skipped.
    pub fn into_entries(self) -> Vec<(String, String)> {
        match self {
            RemoteScripts::Single(source) => vec![("*".to_string(), source)],
            RemoteScripts::ByHost(map) => map
                .into_iter()
                .filter_map(|(pattern, source)| match source {
                    Value::String(source) => Some((pattern, source)),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RemoteScripts::Single(source) => source.is_empty(),
            RemoteScripts::ByHost(map) => map.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RegistrationReply {
    Rejected {
        error: RejectReason,
    },
    Registered {
        version: String,
        #[serde(default)]
        script: Option<RemoteScripts>,
    },
}

/// Reply to [`RepeaterRegistering`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered {
        server_version: String,
        script: Option<RemoteScripts>,
    },
    Rejected(RejectReason),
}

impl RegistrationOutcome {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_value(value)? {
            RegistrationReply::Rejected { error } => RegistrationOutcome::Rejected(error),
            RegistrationReply::Registered { version, script } => {
                RegistrationOutcome::Registered {
                    server_version: version,
                    script,
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeaterStatus {
    Connected,
    Disconnected,
}

/// Status event, published on connect, every heartbeat and on close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterStatusUpdated {
    pub repeater_id: String,
    pub status: RepeaterStatus,
}

impl RepeaterStatusUpdated {
    pub fn new(repeater_id: impl Into<String>, status: RepeaterStatus) -> Self {
        Self {
            repeater_id: repeater_id.into(),
            status,
        }
    }
}

impl BusMessage for RepeaterStatusUpdated {
    const TYPE: &'static str = "RepeaterStatusUpdated";
}

/// Remote script push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterScripts {
    #[serde(default)]
    pub script: Option<RemoteScripts>,
}

impl BusMessage for RegisterScripts {
    const TYPE: &'static str = "RepeaterScriptsUpdated";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTestType {
    Ping,
    Traceroute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkTestInput {
    One(String),
    Many(Vec<String>),
}

impl NetworkTestInput {
    pub fn urls(&self) -> Vec<&str> {
        match self {
            NetworkTestInput::One(url) => vec![url.as_str()],
            NetworkTestInput::Many(urls) => urls.iter().map(String::as_str).collect(),
        }
    }
}

/// Connectivity probe requested by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTest {
    #[serde(rename = "type")]
    pub kind: NetworkTestType,
    pub input: NetworkTestInput,
}

impl BusMessage for NetworkTest {
    const TYPE: &'static str = "NetworkTestingRequested";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkTestResult {
    Output { output: String },
    Error { error: String },
}

/// Request execution command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteScript {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id_regex: Option<String>,
}

impl BusMessage for ExecuteScript {
    const TYPE: &'static str = "ExecuteScript";
}

/// Reply to [`ExecuteScript`]. Exactly one of `status_code` or
/// `error_code`/`message` is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}
