pub mod io;

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{EVENT_SOURCE, EVENT_TYPE_PREFIX, LEGACY_EVENT_TYPE_PREFIXES};

/// CloudEvent: the v1.0 envelope carrying every control-plane message, plus
/// the extensions this system relies on. Extension attribute names are
/// lowercase per the CloudEvents attribute naming rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotencykey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlationid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causationid: Option<String>,
}

impl CloudEvent {
    /// Composes an event this controller emits. Emission is always canonical:
    /// legacy type names never appear on the wire on the way out.
    pub fn new_emitted(
        event_type: EventType,
        subject: Option<String>,
        data: serde_json::Value,
        correlation_id: Uuid,
        causation_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        CloudEvent {
            specversion: "1.0".to_string(),
            id: Uuid::new_v4().to_string(),
            source: EVENT_SOURCE.to_string(),
            event_type: event_type.as_canonical(),
            subject,
            time: Utc::now(),
            datacontenttype: Some("application/json".to_string()),
            dataschema: None,
            data,
            idempotencykey: idempotency_key,
            correlationid: Some(correlation_id),
            causationid: causation_id,
        }
    }

    /// Envelope validation per ingress contract: `specversion`, `type`, `id`,
    /// `source` and `time` are required (`time` is enforced by deserialization).
    pub fn validate(&self) -> Result<(), String> {
        if self.specversion != "1.0" {
            return Err(format!("unsupported specversion `{}`", self.specversion));
        }
        if self.id.is_empty() {
            return Err("event id cannot be empty".to_string());
        }
        if self.source.is_empty() {
            return Err("event source cannot be empty".to_string());
        }
        if self.event_type.is_empty() {
            return Err("event type cannot be empty".to_string());
        }
        Ok(())
    }

    pub fn parsed_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }
}

/// CommandKind: inbound requests ("do X"), present-tense verbs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CommandKind {
    BuildStart,
    BuildCancel,
    BuildRetry,
    ServiceCreate,
    ServiceUpdate,
    ServiceDelete,
    FunctionDeploy,
    FunctionRollback,
}

impl CommandKind {
    fn suffix(&self) -> &'static str {
        match self {
            CommandKind::BuildStart => "command.build.start",
            CommandKind::BuildCancel => "command.build.cancel",
            CommandKind::BuildRetry => "command.build.retry",
            CommandKind::ServiceCreate => "command.service.create",
            CommandKind::ServiceUpdate => "command.service.update",
            CommandKind::ServiceDelete => "command.service.delete",
            CommandKind::FunctionDeploy => "command.function.deploy",
            CommandKind::FunctionRollback => "command.function.rollback",
        }
    }
}

/// LifecycleKind: notifications ("X happened"), past-tense.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleKind {
    BuildStarted,
    BuildCompleted,
    BuildFailed,
    BuildTimeout,
    BuildCancelled,
    ServiceCreated,
    ServiceUpdated,
    ServiceDeleted,
    ServiceReady,
    FunctionDegraded,
    FunctionFailed,
}

impl LifecycleKind {
    fn suffix(&self) -> &'static str {
        match self {
            LifecycleKind::BuildStarted => "lifecycle.build.started",
            LifecycleKind::BuildCompleted => "lifecycle.build.completed",
            LifecycleKind::BuildFailed => "lifecycle.build.failed",
            LifecycleKind::BuildTimeout => "lifecycle.build.timeout",
            LifecycleKind::BuildCancelled => "lifecycle.build.cancelled",
            LifecycleKind::ServiceCreated => "lifecycle.service.created",
            LifecycleKind::ServiceUpdated => "lifecycle.service.updated",
            LifecycleKind::ServiceDeleted => "lifecycle.service.deleted",
            LifecycleKind::ServiceReady => "lifecycle.service.ready",
            LifecycleKind::FunctionDegraded => "lifecycle.function.degraded",
            LifecycleKind::FunctionFailed => "lifecycle.function.failed",
        }
    }

    /// Terminal lifecycle kinds close a command's causal chain.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleKind::BuildFailed
                | LifecycleKind::BuildTimeout
                | LifecycleKind::BuildCancelled
                | LifecycleKind::ServiceDeleted
                | LifecycleKind::ServiceReady
                | LifecycleKind::FunctionDegraded
                | LifecycleKind::FunctionFailed
        )
    }
}

/// EventType: the parsed `type` attribute of an inbound or outbound event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    Command(CommandKind),
    Lifecycle(LifecycleKind),
}

const COMMAND_KINDS: [CommandKind; 8] = [
    CommandKind::BuildStart,
    CommandKind::BuildCancel,
    CommandKind::BuildRetry,
    CommandKind::ServiceCreate,
    CommandKind::ServiceUpdate,
    CommandKind::ServiceDelete,
    CommandKind::FunctionDeploy,
    CommandKind::FunctionRollback,
];

const LIFECYCLE_KINDS: [LifecycleKind; 11] = [
    LifecycleKind::BuildStarted,
    LifecycleKind::BuildCompleted,
    LifecycleKind::BuildFailed,
    LifecycleKind::BuildTimeout,
    LifecycleKind::BuildCancelled,
    LifecycleKind::ServiceCreated,
    LifecycleKind::ServiceUpdated,
    LifecycleKind::ServiceDeleted,
    LifecycleKind::ServiceReady,
    LifecycleKind::FunctionDegraded,
    LifecycleKind::FunctionFailed,
];

impl EventType {
    /// Accepts the canonical `io.knative.lambda.` prefix and the two legacy
    /// prefixes still present in the wild (`network.notifi.lambda.`,
    /// `lambda.`). Emission goes through `as_canonical` only.
    pub fn parse(raw: &str) -> Option<EventType> {
        let suffix = std::iter::once(EVENT_TYPE_PREFIX)
            .chain(LEGACY_EVENT_TYPE_PREFIXES)
            .find_map(|prefix| raw.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('.')))?;

        for kind in COMMAND_KINDS {
            if kind.suffix() == suffix {
                return Some(EventType::Command(kind));
            }
        }
        for kind in LIFECYCLE_KINDS {
            if kind.suffix() == suffix {
                return Some(EventType::Lifecycle(kind));
            }
        }
        None
    }

    pub fn as_canonical(&self) -> String {
        let suffix = match self {
            EventType::Command(kind) => kind.suffix(),
            EventType::Lifecycle(kind) => kind.suffix(),
        };
        format!("{EVENT_TYPE_PREFIX}.{suffix}")
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_canonical())
    }
}
