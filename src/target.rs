use std::fmt;

use serde::{Deserialize, Serialize};

/// One addressable log stream: the stream id plus the endpoint that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub id: String,
    pub endpoint: String,
}

impl TargetRef {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Both fields present and non-blank.
    pub fn is_complete(&self) -> bool {
        !self.id.trim().is_empty() && !self.endpoint.trim().is_empty()
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

/// Where a freshly created cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Oldest retained message in the partition.
    TrimHorizon,
    /// Just past the newest message in the partition.
    Latest,
}

/// A service-issued read position, valid only for the target that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub target: TargetRef,
    pub cursor: String,
}

impl CursorState {
    pub fn belongs_to(&self, target: &TargetRef) -> bool {
        &self.target == target
    }
}
