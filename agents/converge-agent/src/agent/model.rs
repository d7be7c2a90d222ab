//! Cycle data model
//!
//! Per-cycle working records derived from a fetched [`DesiredConfiguration`].
//! Policy records are never mutated in place; each stage hands back an
//! updated copy through the `with_*` transitions.

use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::connection::protocol::{
    AppliedConfiguration, AppliedPolicy, DesiredConfiguration, PolicyFileDescriptor,
};

/// A descriptor the agent refuses to build local state from
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("malformed download URL {url:?} for policy {policy_id}: {reason}")]
    MalformedUrl {
        policy_id: String,
        url: String,
        reason: String,
    },

    #[error("identifier {0:?} cannot be used in a file name")]
    UnsafeName(String),
}

/// Attribute document for the cycle
#[derive(Debug, Clone, PartialEq)]
pub struct AttributesState {
    revision_id: String,
    file_name: String,
    file_path: PathBuf,
    raw_data: serde_json::Value,
}

impl AttributesState {
    pub fn new(
        revision_id: &str,
        raw_data: serde_json::Value,
        workdir: &Path,
    ) -> Result<Self, DescriptorError> {
        ensure_safe(revision_id)?;
        let file_name = format!("attrs-{}.json", revision_id);
        Ok(Self {
            revision_id: revision_id.to_string(),
            file_path: workdir.join(&file_name),
            file_name,
            raw_data,
        })
    }

    pub fn revision_id(&self) -> &str {
        &self.revision_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn raw_data(&self) -> &serde_json::Value {
        &self.raw_data
    }
}

/// Local state of one policy file within a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyState {
    id: String,
    revision_id: String,
    name: String,
    tarball_file_name: String,
    relative_query_path: String,
    tarball_local_path: PathBuf,
    extracted_folder_path: PathBuf,
    downloaded: bool,
    extracted: bool,
    executed: bool,
    reported: bool,
}

impl PolicyState {
    /// Derive local paths for a descriptor under `workdir`
    pub fn from_descriptor(
        descriptor: &PolicyFileDescriptor,
        workdir: &Path,
    ) -> Result<Self, DescriptorError> {
        ensure_safe(&descriptor.id)?;
        ensure_safe(&descriptor.revision_id)?;

        let relative_query_path = relative_query_path(descriptor)?;
        let name = format!("{}-{}", descriptor.id, descriptor.revision_id);
        let tarball_file_name = format!("{}.tgz", name);

        Ok(Self {
            id: descriptor.id.clone(),
            revision_id: descriptor.revision_id.clone(),
            relative_query_path,
            tarball_local_path: workdir.join(&tarball_file_name),
            extracted_folder_path: workdir.join(&name),
            tarball_file_name,
            name,
            downloaded: false,
            extracted: false,
            executed: false,
            reported: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn revision_id(&self) -> &str {
        &self.revision_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tarball_file_name(&self) -> &str {
        &self.tarball_file_name
    }

    pub fn relative_query_path(&self) -> &str {
        &self.relative_query_path
    }

    pub fn tarball_local_path(&self) -> &Path {
        &self.tarball_local_path
    }

    pub fn extracted_folder_path(&self) -> &Path {
        &self.extracted_folder_path
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }

    pub fn is_extracted(&self) -> bool {
        self.extracted
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    pub fn with_downloaded(self) -> Self {
        Self {
            downloaded: true,
            ..self
        }
    }

    /// No-op unless the tarball was downloaded
    pub fn with_extracted(self) -> Self {
        Self {
            extracted: self.downloaded,
            ..self
        }
    }

    /// No-op unless the bundle was extracted
    pub fn with_executed(self, succeeded: bool) -> Self {
        Self {
            executed: succeeded && self.extracted,
            ..self
        }
    }

    /// No-op unless the policy was executed
    pub fn with_reported(self) -> Self {
        Self {
            reported: self.executed,
            ..self
        }
    }
}

/// Working record for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleState {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attributes: AttributesState,
    pub policies: Vec<PolicyState>,
}

impl CycleState {
    /// Build fresh state from the desired configuration, preserving policy order
    pub fn from_desired(
        desired: &DesiredConfiguration,
        workdir: &Path,
        started_at: DateTime<Utc>,
    ) -> Result<Self, DescriptorError> {
        let attributes = AttributesState::new(
            &desired.attribute_revision_id,
            desired.attributes.clone(),
            workdir,
        )?;

        let policies = desired
            .policy_files
            .iter()
            .map(|descriptor| PolicyState::from_descriptor(descriptor, workdir))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            started_at,
            finished_at: None,
            attributes,
            policies,
        })
    }

    /// Every working-directory entry this cycle owns
    pub fn retained_names(&self) -> HashSet<String> {
        let mut names = HashSet::with_capacity(1 + self.policies.len() * 2);
        names.insert(self.attributes.file_name().to_string());
        for policy in &self.policies {
            names.insert(policy.tarball_file_name().to_string());
            names.insert(policy.name().to_string());
        }
        names
    }

    /// Summary of executed policies; `None` until the cycle has finished
    pub fn applied_configuration(&self) -> Option<AppliedConfiguration> {
        let finished_at = self.finished_at?;
        Some(AppliedConfiguration {
            started_at: self.started_at,
            finished_at,
            attribute_revision_id: self.attributes.revision_id().to_string(),
            policy_revisions: self
                .policies
                .iter()
                .filter(|p| p.is_executed())
                .map(|p| AppliedPolicy {
                    policy_id: p.id().to_string(),
                    revision_id: p.revision_id().to_string(),
                })
                .collect(),
        })
    }
}

fn ensure_safe(component: &str) -> Result<(), DescriptorError> {
    let unsafe_name = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if unsafe_name {
        return Err(DescriptorError::UnsafeName(component.to_string()));
    }
    Ok(())
}

/// Path and query of the download URL; the download endpoint is service-relative.
fn relative_query_path(descriptor: &PolicyFileDescriptor) -> Result<String, DescriptorError> {
    let malformed = |reason: String| DescriptorError::MalformedUrl {
        policy_id: descriptor.id.clone(),
        url: descriptor.download_url.clone(),
        reason,
    };

    let url = Url::parse(&descriptor.download_url).map_err(|e| malformed(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(malformed("URL has no path".to_string()));
    }

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(path)
}
