use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status recorded for an endpoint that was never probed
pub const NEVER_CHECKED: &str = "Never";

/// Response time recorded for an endpoint that was never probed
pub const NO_RESPONSE_TIME: &str = "0";

/// Outcome of the latest probe of an endpoint
///
/// Stored and streamed in its display form, e.g. `Success: 200`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Unknown,
    Success(u16),
    Failure(u16),
    /// The request never produced an HTTP status; details are in the logs
    Error,
}

impl ProbeStatus {
    /// Classify an HTTP status code.
    pub fn from_code(code: u16) -> Self {
        if (200..300).contains(&code) {
            ProbeStatus::Success(code)
        } else {
            ProbeStatus::Failure(code)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeStatus::Success(_))
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Unknown => write!(f, "Unknown"),
            ProbeStatus::Success(code) => write!(f, "Success: {code}"),
            ProbeStatus::Failure(code) => write!(f, "Failure: {code}"),
            ProbeStatus::Error => write!(f, "Error: check logs"),
        }
    }
}

impl FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_code = |code: &str| code.trim().parse::<u16>().map_err(|_| s.to_string());

        if s == "Unknown" {
            Ok(ProbeStatus::Unknown)
        } else if s.starts_with("Error") {
            Ok(ProbeStatus::Error)
        } else if let Some(code) = s.strip_prefix("Success:") {
            parse_code(code).map(ProbeStatus::Success)
        } else if let Some(code) = s.strip_prefix("Failure:") {
            parse_code(code).map(ProbeStatus::Failure)
        } else {
            Err(s.to_string())
        }
    }
}

impl Serialize for ProbeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProbeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|raw| serde::de::Error::custom(format!("invalid probe status: {raw}")))
    }
}

/// Configuration of a monitored target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: String,

    pub name: String,

    pub url: String,

    pub project_id: String,
}

/// Input for creating an endpoint; the id is generated by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEndpoint {
    pub project_id: String,
    pub name: String,
    pub url: String,
}

impl NewEndpoint {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self { project_id: project_id.into(), name: name.into(), url: url.into() }
    }
}

/// Latest probe result of an endpoint
///
/// This is also the payload of a `pingresult` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub id: String,

    pub status: ProbeStatus,

    /// Probe start (RFC3339) or `Never`
    pub last_checked_at: String,

    /// Probe completion (RFC3339) or `0`
    pub response_time: String,
}

impl EndpointStatus {
    /// Status of an endpoint that has not been probed yet.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ProbeStatus::Unknown,
            last_checked_at: NEVER_CHECKED.to_string(),
            response_time: NO_RESPONSE_TIME.to_string(),
        }
    }

    /// Status of a finished probe that started at `started_at` and took `elapsed`.
    pub fn checked(
        id: impl Into<String>,
        status: ProbeStatus,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: id.into(),
            status,
            last_checked_at: format_timestamp(started_at),
            response_time: format_timestamp(started_at + elapsed),
        }
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Configuration joined with the latest status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub url: String,
    pub project_id: String,
    pub status: ProbeStatus,
    pub last_checked_at: String,
    pub response_time: String,
}

impl Endpoint {
    pub fn from_parts(info: EndpointInfo, status: EndpointStatus) -> Self {
        Self {
            id: info.id,
            name: info.name,
            url: info.url,
            project_id: info.project_id,
            status: status.status,
            last_checked_at: status.last_checked_at,
            response_time: status.response_time,
        }
    }
}
