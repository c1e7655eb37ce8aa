use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::ResourceLimits;

/// Optional CPU/RAM request attached by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHints {
    #[serde(default, alias = "cpus", skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
    #[serde(default, alias = "ram", skip_serializing_if = "Option::is_none")]
    pub ram_bytes: Option<u64>,
}

impl ResourceHints {
    /// Resolve hints against `defaults`. Zero counts as "not given".
    pub fn resolve(&self, defaults: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_count: self
                .cpu_count
                .filter(|&c| c > 0)
                .unwrap_or(defaults.cpu_count),
            ram_bytes: self
                .ram_bytes
                .filter(|&r| r > 0)
                .unwrap_or(defaults.ram_bytes),
        }
    }
}

/// A job addressed to one host, stored at `executionRequests/{hostId}/{requestId}`.
///
/// Every field is optional on the wire so that partial or foreign records
/// deserialize and can be discarded by the dispatcher instead of erroring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default, alias = "clientRoomId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, alias = "resources", skip_serializing_if = "Option::is_none")]
    pub resource_hints: Option<ResourceHints>,
    #[serde(default)]
    pub processed: bool,
}

impl ExecutionRequest {
    pub fn new(
        request_id: impl Into<String>,
        client_id: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_id: Some(client_id.into()),
            code: Some(code.into()),
            resource_hints: None,
            processed: false,
        }
    }

    pub fn with_hints(mut self, hints: ResourceHints) -> Self {
        self.resource_hints = Some(hints);
        self
    }

    /// Limits to run this request with.
    pub fn limits(&self, defaults: ResourceLimits) -> ResourceLimits {
        self.resource_hints
            .unwrap_or_default()
            .resolve(defaults)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Status only moves forward and never leaves a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Progress of a client's job, stored at `clients/{clientId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatusRecord {
    #[serde(default)]
    pub request_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

impl ClientStatusRecord {
    pub fn new(
        request_id: impl Into<String>,
        status: JobStatus,
        output: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            output: output.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn running(request_id: impl Into<String>) -> Self {
        Self::new(request_id, JobStatus::Running, "")
    }

    pub fn completed(request_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(request_id, JobStatus::Completed, output)
    }

    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(request_id, JobStatus::Error, message)
    }
}
