//! Message Protocol
//!
//! Defines the documents exchanged between the agent and the control service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Desired state for this host, fetched once per cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DesiredConfiguration {
    pub attribute_revision_id: String,
    /// Opaque attribute document, written verbatim for policy execution
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default, rename = "policyfiles")]
    pub policy_files: Vec<PolicyFileDescriptor>,
}

/// A downloadable, versioned policy bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyFileDescriptor {
    pub id: String,
    pub revision_id: String,
    pub download_url: String,
}

/// One slice of a running policy command's output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogChunk {
    pub stdout: String,
}

/// A policy revision that was applied successfully
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedPolicy {
    pub policy_id: String,
    pub revision_id: String,
}

/// End-of-cycle summary reported to the control service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedConfiguration {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attribute_revision_id: String,
    #[serde(rename = "policyfile_revisions")]
    pub policy_revisions: Vec<AppliedPolicy>,
}

impl LogChunk {
    /// Build a chunk from raw process output
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            stdout: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}
