//! Webhook event types
//!
//! Defines the QA domain event catalogue, event-name syntax and the payload
//! shapes sent to each kind of receiver.

use crate::{Result, WebhookError};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Longest accepted event name
pub const MAX_EVENT_NAME_LEN: usize = 128;

/// Well-known QA domain event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaEventType {
    // Package events
    PackageCreated,
    PackageUpdated,
    PackageCompleted,
    PackageDeleted,

    // Scenario generation events
    ScenarioGenerated,
    ScenarioGenerationFailed,

    // Run events
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,

    // Webhook housekeeping
    WebhookTest,
}

impl QaEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PackageCreated => "package.created",
            Self::PackageUpdated => "package.updated",
            Self::PackageCompleted => "package.completed",
            Self::PackageDeleted => "package.deleted",
            Self::ScenarioGenerated => "scenario.generated",
            Self::ScenarioGenerationFailed => "scenario.generation_failed",
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::WebhookTest => "webhook.test",
        }
    }

    /// Get category for this event type
    pub fn category(&self) -> &'static str {
        match self {
            Self::PackageCreated
            | Self::PackageUpdated
            | Self::PackageCompleted
            | Self::PackageDeleted => "package",
            Self::ScenarioGenerated | Self::ScenarioGenerationFailed => "scenario",
            Self::RunStarted | Self::RunCompleted | Self::RunFailed | Self::RunCancelled => "run",
            Self::WebhookTest => "webhook",
        }
    }

    /// Whether the event reports something going wrong
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ScenarioGenerationFailed | Self::RunFailed)
    }

    pub fn all() -> &'static [QaEventType] {
        &[
            Self::PackageCreated,
            Self::PackageUpdated,
            Self::PackageCompleted,
            Self::PackageDeleted,
            Self::ScenarioGenerated,
            Self::ScenarioGenerationFailed,
            Self::RunStarted,
            Self::RunCompleted,
            Self::RunFailed,
            Self::RunCancelled,
            Self::WebhookTest,
        ]
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for QaEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that an event name is dot separated lowercase segments
///
/// Segments may contain `a-z`, `0-9`, `_` and `-`. Names outside the
/// catalogue are allowed so new producers do not need a release here.
pub fn validate_event_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(WebhookError::InvalidEventType(format!(
            "event name must be 1..={MAX_EVENT_NAME_LEN} characters"
        )));
    }
    if !name.split('.').all(is_valid_segment) {
        return Err(WebhookError::InvalidEventType(name.to_string()));
    }
    Ok(())
}

pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Payload shape expected by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// The event payload is posted verbatim
    #[default]
    Generic,
    /// Slack incoming-webhook message
    Slack,
}

impl DeliveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Slack => "slack",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "generic" => Some(Self::Generic),
            "slack" => Some(Self::Slack),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the request body for a receiver of the given kind
///
/// The result is stored on the delivery record and never rebuilt, so
/// retries send byte-identical bodies with identical signatures.
pub fn shape_payload(kind: DeliveryKind, event_type: &str, payload: &[u8]) -> Result<Vec<u8>> {
    match kind {
        DeliveryKind::Generic => Ok(payload.to_vec()),
        DeliveryKind::Slack => {
            let data: serde_json::Value = serde_json::from_slice(payload).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
            });
            let details = serde_json::to_string_pretty(&data)?;
            let color = match QaEventType::parse(event_type) {
                Some(t) if t.is_failure() => "#d93025",
                Some(_) => "#1e8e3e",
                None => "#5f6368",
            };

            let message = json!({
                "text": format!("qahub event `{event_type}`"),
                "attachments": [{
                    "color": color,
                    "text": format!("```{details}```"),
                }],
            });
            Ok(serde_json::to_vec(&message)?)
        }
    }
}
