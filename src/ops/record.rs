//! ops::record
//!
//! Operation and progress types, plus the record persisted for each
//! running operation.
//!
//! # Wire form
//!
//! Enum values serialize in upper case (`PUSH`, `RUNNING`, `COMPLETE`) and
//! struct fields in camelCase, so persisted records and progress streams
//! read the same from any client.

use serde::{Deserialize, Serialize};

use crate::core::types::RemoteParameters;

/// Direction of data movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Push,
    Pull,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Push => "push",
            OperationType::Pull => "pull",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationState {
    Running,
    Complete,
    Failed,
    Aborted,
}

impl OperationState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Running)
    }
}

/// A push or pull of one commit against one remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub state: OperationState,
    pub remote: String,
    pub commit_id: String,
}

/// Kind of a progress entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgressType {
    Message,
    Start,
    Progress,
    End,
    Error,
    Abort,
    Failed,
    Complete,
}

/// One entry in an operation's progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    #[serde(rename = "type")]
    pub kind: ProgressType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl ProgressEntry {
    pub fn new(kind: ProgressType, message: Option<String>) -> Self {
        Self {
            kind,
            message,
            percent: None,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new(ProgressType::Message, Some(text.into()))
    }

    /// Start of a named phase, e.g. one volume's transfer.
    pub fn start(text: impl Into<String>) -> Self {
        Self::new(ProgressType::Start, Some(text.into()))
    }

    pub fn progress(percent: u8, text: Option<String>) -> Self {
        Self {
            kind: ProgressType::Progress,
            message: text,
            percent: Some(percent.min(100)),
        }
    }

    pub fn end() -> Self {
        Self::new(ProgressType::End, None)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(ProgressType::Error, Some(text.into()))
    }

    pub fn abort() -> Self {
        Self::new(ProgressType::Abort, None)
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self::new(ProgressType::Failed, Some(text.into()))
    }

    pub fn complete() -> Self {
        Self::new(ProgressType::Complete, None)
    }

    /// The state this entry moves its operation into, if it is terminal.
    pub fn terminal_state(&self) -> Option<OperationState> {
        match self.kind {
            ProgressType::Complete => Some(OperationState::Complete),
            ProgressType::Failed => Some(OperationState::Failed),
            ProgressType::Abort => Some(OperationState::Aborted),
            _ => None,
        }
    }
}

/// What the metadata store keeps for a running operation.
///
/// Enough to resume the operation after a restart: the operation itself,
/// the parameters it was started with, and whether it moves data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub repository: String,
    pub operation: Operation,
    pub params: RemoteParameters,
    #[serde(default)]
    pub metadata_only: bool,
}

impl OperationRecord {
    pub fn id(&self) -> &str {
        &self.operation.id
    }
}
