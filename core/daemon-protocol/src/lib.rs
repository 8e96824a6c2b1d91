//! IPC protocol types and validation for coverage-daemon.
//!
//! This crate is shared by the daemon and the agents that feed it, so the
//! schema cannot drift between them. The daemon remains the authority on
//! validation, but agents can reuse the same types to build valid requests.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024; // class bytes travel inline

const MAX_TARGET_ID_LEN: usize = 128;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    GetTopic,
    GetScopes,
    GetSessionState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::new("malformed_payload", message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Identity of one monitored deployment. Owned by the agent manager; the
/// daemon only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub build_version: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl TargetInfo {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_target", "target.id is required"));
        }
        if self.id.len() > MAX_TARGET_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_target",
                "target.id must be 128 characters or fewer",
            ));
        }
        if self.build_version.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_target",
                "target.build_version is required",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Init,
    ClassBytes,
    Initialized,
    SessionStarted,
    SessionCancelled,
    CoverageDataPart,
    SessionFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "INIT",
            EventKind::ClassBytes => "CLASS_BYTES",
            EventKind::Initialized => "INITIALIZED",
            EventKind::SessionStarted => "SESSION_STARTED",
            EventKind::SessionCancelled => "SESSION_CANCELLED",
            EventKind::CoverageDataPart => "COVERAGE_DATA_PART",
            EventKind::SessionFinished => "SESSION_FINISHED",
        }
    }
}

/// Params of an `event` request: the target plus the `{type, data}` envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventRequest {
    pub target: TargetInfo,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitInfo {
    pub classes_count: usize,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBytes {
    pub class_name: String,
    #[serde(deserialize_with = "de_bytes")]
    pub bytes: Vec<u8>,
}

/// One execution window's probe flags for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
    #[serde(deserialize_with = "de_probe_id")]
    pub id: u64,
    #[serde(alias = "codeUnitName")]
    pub class_name: String,
    #[serde(alias = "bitmap")]
    pub probes: Vec<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageEvent {
    Init(InitInfo),
    ClassBytes(ClassBytes),
    Initialized(String),
    SessionStarted(String),
    SessionCancelled(String),
    CoverageDataPart(Vec<ProbeRecord>),
    SessionFinished,
}

impl CoverageEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoverageEvent::Init(_) => EventKind::Init,
            CoverageEvent::ClassBytes(_) => EventKind::ClassBytes,
            CoverageEvent::Initialized(_) => EventKind::Initialized,
            CoverageEvent::SessionStarted(_) => EventKind::SessionStarted,
            CoverageEvent::SessionCancelled(_) => EventKind::SessionCancelled,
            CoverageEvent::CoverageDataPart(_) => EventKind::CoverageDataPart,
            CoverageEvent::SessionFinished => EventKind::SessionFinished,
        }
    }
}

/// Outbound observer topics, addressed per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    CollectionState,
    Coverage,
    CoverageNew,
    NewMethods,
    CoverageByPackages,
    TestsUsages,
    AssociatedTests,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::CollectionState,
        Topic::Coverage,
        Topic::CoverageNew,
        Topic::NewMethods,
        Topic::CoverageByPackages,
        Topic::TestsUsages,
        Topic::AssociatedTests,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Topic::CollectionState => "/collection-state",
            Topic::Coverage => "/coverage",
            Topic::CoverageNew => "/coverage-new",
            Topic::NewMethods => "/new-methods",
            Topic::CoverageByPackages => "/coverage-by-packages",
            Topic::TestsUsages => "/tests-usages",
            Topic::AssociatedTests => "/associated-tests",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.path() == path)
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.path())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        Topic::from_path(&path)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown topic {}", path)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicQuery {
    pub target_id: String,
    pub topic: Topic,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeQuery {
    #[serde(default)]
    pub target_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetQuery {
    pub target_id: String,
}

pub fn parse_event_request(params: Value) -> Result<(TargetInfo, CoverageEvent), ErrorInfo> {
    let request: EventRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    request.target.validate()?;
    let event = parse_event(request.kind, request.data)?;
    Ok((request.target, event))
}

/// Decodes the type-specific `data` of an envelope and validates it.
pub fn parse_event(kind: EventKind, data: Value) -> Result<CoverageEvent, ErrorInfo> {
    let event = match kind {
        EventKind::Init => CoverageEvent::Init(decode(kind, data)?),
        EventKind::ClassBytes => {
            let class: ClassBytes = decode(kind, data)?;
            if class.class_name.trim().is_empty() {
                return Err(ErrorInfo::malformed("CLASS_BYTES.className is required"));
            }
            CoverageEvent::ClassBytes(class)
        }
        EventKind::Initialized => CoverageEvent::Initialized(text(data)),
        EventKind::SessionStarted => CoverageEvent::SessionStarted(text(data)),
        EventKind::SessionCancelled => CoverageEvent::SessionCancelled(text(data)),
        EventKind::CoverageDataPart => {
            let mut records: Vec<ProbeRecord> = decode(kind, data)?;
            for record in &mut records {
                if record.class_name.trim().is_empty() {
                    return Err(ErrorInfo::malformed(format!(
                        "probe record {} has no className",
                        record.id
                    )));
                }
                if record
                    .test_name
                    .as_deref()
                    .map(|name| name.trim().is_empty())
                    .unwrap_or(false)
                {
                    record.test_name = None;
                }
            }
            CoverageEvent::CoverageDataPart(records)
        }
        EventKind::SessionFinished => CoverageEvent::SessionFinished,
    };
    Ok(event)
}

// Older agents send `data` as a JSON document encoded into a string.
fn decode<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, ErrorInfo> {
    let result = match data {
        Value::String(raw) => serde_json::from_str(&raw),
        other => serde_json::from_value(other),
    };
    result.map_err(|err| {
        ErrorInfo::malformed(format!("{} payload is invalid: {}", kind.as_str(), err))
    })
}

fn text(data: Value) -> String {
    match data {
        Value::String(value) => value,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// JVM agents serialize bytes as signed values.
fn de_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = Vec::<i64>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|value| match value {
            -128..=-1 => Ok((value + 256) as u8),
            0..=255 => Ok(value as u8),
            _ => Err(serde::de::Error::custom(format!(
                "byte value {} out of range",
                value
            ))),
        })
        .collect()
}

// Class ids are 64-bit hashes; JVM agents send them as signed longs.
fn de_probe_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Unsigned(value) => value,
        RawId::Signed(value) => value as u64,
    })
}
