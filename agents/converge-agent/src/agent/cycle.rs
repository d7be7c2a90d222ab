//! Cycle Orchestrator
//!
//! Runs one synchronization cycle: fetch the desired configuration, sync
//! policy bundles, clean the working directory, persist attributes, execute
//! policies in order and report what was applied.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::model::{AttributesState, CycleState, DescriptorError, PolicyState};
use crate::agent::reporter::ChunkReporter;
use crate::agent::state::{CycleStage, StageTracker};
use crate::agent::sync::{cleanup, Synchronizer};
use crate::cli::config::{Config, ExecutorConfig};
use crate::connection::client::ControlPlane;
use crate::connection::retry::{check_status, retry, RetryPolicy};
use crate::runtime::adapter::{CommandRunner, CommandSpec};
use crate::runtime::chunker::Thresholds;

const ATTRIBUTES_PLACEHOLDER: &str = "{attributes}";
const POLICY_DIR_PLACEHOLDER: &str = "{policy_dir}";

/// Reasons a cycle ends before executing anything
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to fetch desired configuration: {0:#}")]
    Fetch(#[source] anyhow::Error),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("cycle cancelled before it started")]
    Cancelled,
}

/// Settings a cycle needs from the agent configuration
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub workdir: PathBuf,
    pub executor: ExecutorConfig,
    pub thresholds: Thresholds,
    pub retry: RetryPolicy,
}

impl CycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workdir: config.paths.workdir.clone(),
            executor: config.executor.clone(),
            thresholds: config.chunking.thresholds(),
            retry: config.retry.policy(),
        }
    }
}

/// Drives the cycle stages against a control plane and a command runner
pub struct CycleOrchestrator<C: ControlPlane, R: CommandRunner> {
    control_plane: Arc<C>,
    runner: Arc<R>,
    synchronizer: Synchronizer<C>,
    settings: CycleSettings,
    stages: StageTracker,
}

impl<C: ControlPlane, R: CommandRunner> CycleOrchestrator<C, R> {
    pub fn new(
        control_plane: Arc<C>,
        runner: Arc<R>,
        settings: CycleSettings,
        stages: StageTracker,
    ) -> Self {
        Self {
            synchronizer: Synchronizer::new(control_plane.clone()),
            control_plane,
            runner,
            settings,
            stages,
        }
    }

    pub fn stages(&self) -> &StageTracker {
        &self.stages
    }

    /// Run one full cycle.
    ///
    /// Only initialization failures are returned as errors; once the cycle
    /// state exists every stage runs and the final state is handed back,
    /// even when policies failed or reporting was not accepted.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleState, CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        self.stages.transition_to(CycleStage::Initializing, None);
        let mut state = match self.initialize().await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Cycle aborted during initialization");
                self.stages.set_idle(Some(e.to_string()));
                return Err(e);
            }
        };
        info!(
            attribute_revision = %state.attributes.revision_id(),
            policies = state.policies.len(),
            "Desired configuration fetched"
        );

        self.stages.transition_to(CycleStage::Syncing, None);
        state.policies = self
            .synchronizer
            .sync_all(std::mem::take(&mut state.policies))
            .await;

        self.stages.transition_to(CycleStage::Cleaning, None);
        match cleanup(&self.settings.workdir, &state.retained_names()).await {
            Ok(report) => info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "Working directory cleaned"
            ),
            Err(e) => warn!(error = %format!("{:#}", e), "Skipping working directory cleanup"),
        }

        self.stages.transition_to(CycleStage::PersistingAttributes, None);
        if let Err(e) = persist_attributes(&state.attributes).await {
            error!(error = %format!("{:#}", e), "Failed to persist attributes");
        }

        self.stages.transition_to(CycleStage::Executing, None);
        state.policies = self
            .execute_all(std::mem::take(&mut state.policies), &state.attributes, cancel)
            .await;

        self.stages.transition_to(CycleStage::Reporting, None);
        state.finished_at = Some(Utc::now());
        self.report(&mut state, cancel).await;

        self.stages.set_idle(None);
        Ok(state)
    }

    async fn initialize(&self) -> Result<CycleState, CycleError> {
        let started_at = Utc::now();
        let desired = self
            .control_plane
            .fetch_desired_configuration()
            .await
            .map_err(CycleError::Fetch)?;
        Ok(CycleState::from_desired(&desired, &self.settings.workdir, started_at)?)
    }

    /// Execute policies in order, stopping at the first one that does not succeed
    async fn execute_all(
        &self,
        policies: Vec<PolicyState>,
        attributes: &AttributesState,
        cancel: &CancellationToken,
    ) -> Vec<PolicyState> {
        let mut executed = Vec::with_capacity(policies.len());
        let mut halted = false;

        for policy in policies {
            if halted {
                executed.push(policy);
                continue;
            }
            if cancel.is_cancelled() {
                warn!(policy = %policy.name(), "Shutdown requested, skipping remaining policies");
                halted = true;
                executed.push(policy);
                continue;
            }

            let next = self.execute(policy, attributes, cancel).await;
            if !next.is_executed() {
                halted = true;
            }
            executed.push(next);
        }

        executed
    }

    async fn execute(
        &self,
        policy: PolicyState,
        attributes: &AttributesState,
        cancel: &CancellationToken,
    ) -> PolicyState {
        if !policy.is_extracted() {
            error!(policy = %policy.name(), "Policy bundle not available, halting execution");
            return policy.with_executed(false);
        }

        let spec = command_for(&self.settings.executor, &policy, attributes);
        debug!(policy = %policy.name(), program = %spec.program, args = ?spec.args, "Executing policy");

        let mut reporter = ChunkReporter::new(
            self.control_plane.clone(),
            self.settings.retry,
            cancel.clone(),
            policy.name(),
        );

        match self
            .runner
            .run_streaming(&spec, self.settings.thresholds, &mut reporter, cancel)
            .await
        {
            Ok(outcome) => {
                if let Some(e) = &outcome.sink_error {
                    warn!(
                        policy = %policy.name(),
                        delivered = reporter.delivered(),
                        error = %format!("{:#}", e),
                        "Output reporting stopped early"
                    );
                }
                if outcome.success() {
                    info!(policy = %policy.name(), "Policy applied");
                } else {
                    error!(
                        policy = %policy.name(),
                        exit_code = outcome.exit_code,
                        "Policy failed, halting execution"
                    );
                }
                policy.with_executed(outcome.success())
            }
            Err(e) => {
                error!(policy = %policy.name(), error = %format!("{:#}", e), "Policy command did not complete");
                policy.with_executed(false)
            }
        }
    }

    async fn report(&self, state: &mut CycleState, cancel: &CancellationToken) {
        let Some(summary) = state.applied_configuration() else {
            return;
        };
        let summary = &summary;
        let control_plane = &self.control_plane;
        let retry_client_errors = self.settings.retry.retry_client_errors;

        let result = retry(&self.settings.retry, cancel, || async move {
            let status = control_plane.submit_applied_configuration(summary).await?;
            check_status(status, retry_client_errors)?;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    applied = summary.policy_revisions.len(),
                    total = state.policies.len(),
                    "Applied configuration reported"
                );
                state.policies = std::mem::take(&mut state.policies)
                    .into_iter()
                    .map(PolicyState::with_reported)
                    .collect();
            }
            Err(e) => error!(error = %e, "Failed to report applied configuration"),
        }
    }
}

async fn persist_attributes(attributes: &AttributesState) -> Result<()> {
    let body = serde_json::to_vec_pretty(attributes.raw_data())
        .context("Failed to serialize attributes")?;
    tokio::fs::write(attributes.file_path(), body)
        .await
        .with_context(|| format!("Failed to write {}", attributes.file_path().display()))?;
    debug!(path = %attributes.file_path().display(), "Attributes persisted");
    Ok(())
}

/// Build the command for a policy, run from inside its extracted folder
fn command_for(
    executor: &ExecutorConfig,
    policy: &PolicyState,
    attributes: &AttributesState,
) -> CommandSpec {
    let attributes_path = attributes.file_path().display().to_string();
    let policy_dir = policy.extracted_folder_path().display().to_string();

    CommandSpec {
        program: executor.command.clone(),
        args: executor
            .args
            .iter()
            .map(|arg| {
                arg.replace(ATTRIBUTES_PLACEHOLDER, &attributes_path)
                    .replace(POLICY_DIR_PLACEHOLDER, &policy_dir)
            })
            .collect(),
        cwd: Some(policy.extracted_folder_path().to_path_buf()),
        env: executor
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}
