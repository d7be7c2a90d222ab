//! Test doubles for the control plane and command runner.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::connection::client::ControlPlane;
use crate::connection::protocol::{
    AppliedConfiguration, DesiredConfiguration, LogChunk, PolicyFileDescriptor,
};
use crate::runtime::adapter::{ChunkSink, CommandOutcome, CommandRunner, CommandSpec};
use crate::runtime::chunker::Thresholds;

/// Encode a `.tgz` containing `files` (path, contents).
pub fn tarball_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn write_tarball(path: &Path, files: &[(&str, &str)]) {
    std::fs::write(path, tarball_bytes(files)).unwrap();
}

pub fn descriptor(id: &str, revision: &str) -> PolicyFileDescriptor {
    PolicyFileDescriptor {
        id: id.to_string(),
        revision_id: revision.to_string(),
        download_url: format!("https://cp.example.com/blueprint/policyfiles/{id}/{revision}?sig=x"),
    }
}

pub fn artifact_path(id: &str, revision: &str) -> String {
    format!("/blueprint/policyfiles/{id}/{revision}?sig=x")
}

/// Scripted in-memory control plane that records every call
#[derive(Default)]
pub struct MockControlPlane {
    pub desired: Mutex<Option<DesiredConfiguration>>,
    pub artifacts: Mutex<HashMap<String, Vec<u8>>>,
    pub chunk_statuses: Mutex<VecDeque<u16>>,
    pub applied_statuses: Mutex<VecDeque<u16>>,
    pub downloads: Mutex<Vec<String>>,
    pub chunks: Mutex<Vec<LogChunk>>,
    pub applied: Mutex<Vec<AppliedConfiguration>>,
    pub applied_attempts: Mutex<usize>,
}

impl MockControlPlane {
    pub fn new(desired: DesiredConfiguration) -> Self {
        Self {
            desired: Mutex::new(Some(desired)),
            ..Self::default()
        }
    }

    /// A control plane whose configuration endpoint always fails
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_artifact(self, id: &str, revision: &str, files: &[(&str, &str)]) -> Self {
        self.with_raw_artifact(id, revision, &tarball_bytes(files))
    }

    /// Serve `body` verbatim, whether or not it is a valid archive
    pub fn with_raw_artifact(self, id: &str, revision: &str, body: &[u8]) -> Self {
        self.artifacts
            .lock()
            .insert(artifact_path(id, revision), body.to_vec());
        self
    }

    pub fn with_chunk_statuses(self, statuses: &[u16]) -> Self {
        self.chunk_statuses.lock().extend(statuses);
        self
    }

    pub fn with_applied_statuses(self, statuses: &[u16]) -> Self {
        self.applied_statuses.lock().extend(statuses);
        self
    }

    pub fn chunk_text(&self) -> String {
        self.chunks.lock().iter().map(|c| c.stdout.as_str()).collect()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn fetch_desired_configuration(&self) -> Result<DesiredConfiguration> {
        match self.desired.lock().clone() {
            Some(desired) => Ok(desired),
            None => bail!("connection refused"),
        }
    }

    async fn download_artifact(&self, relative_path: &str, local_path: &Path) -> Result<u16> {
        self.downloads.lock().push(relative_path.to_string());
        let body = self.artifacts.lock().get(relative_path).cloned();
        match body {
            Some(body) => {
                tokio::fs::write(local_path, body)
                    .await
                    .with_context(|| format!("Failed to write {}", local_path.display()))?;
                Ok(200)
            }
            None => Ok(404),
        }
    }

    async fn submit_log_chunk(&self, chunk: &LogChunk) -> Result<u16> {
        let status = self.chunk_statuses.lock().pop_front().unwrap_or(200);
        if status == 200 {
            self.chunks.lock().push(chunk.clone());
        }
        Ok(status)
    }

    async fn submit_applied_configuration(&self, summary: &AppliedConfiguration) -> Result<u16> {
        *self.applied_attempts.lock() += 1;
        let status = self.applied_statuses.lock().pop_front().unwrap_or(200);
        if status == 200 {
            self.applied.lock().push(summary.clone());
        }
        Ok(status)
    }
}

/// Command runner returning scripted exit codes keyed by working-directory name
#[derive(Default)]
pub struct ScriptedRunner {
    pub exit_codes: HashMap<String, i32>,
    pub output: HashMap<String, String>,
    pub runs: Mutex<Vec<CommandSpec>>,
    pub cancel_during: Option<String>,
}

impl ScriptedRunner {
    pub fn new(exit_codes: &[(&str, i32)]) -> Self {
        Self {
            exit_codes: exit_codes
                .iter()
                .map(|(name, code)| (name.to_string(), *code))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, name: &str, output: &str) -> Self {
        self.output.insert(name.to_string(), output.to_string());
        self
    }

    /// Cancel the cycle while `name` is running, as a shutdown signal would
    pub fn with_cancel_during(mut self, name: &str) -> Self {
        self.cancel_during = Some(name.to_string());
        self
    }

    /// Folder names of every command run, in order
    pub fn ran(&self) -> Vec<String> {
        self.runs
            .lock()
            .iter()
            .filter_map(|spec| spec.cwd.as_ref())
            .filter_map(|cwd| cwd.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        _thresholds: Thresholds,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        if cancel.is_cancelled() {
            bail!("cancelled");
        }
        self.runs.lock().push(spec.clone());

        let name = spec
            .cwd
            .as_ref()
            .and_then(|cwd| cwd.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.cancel_during.as_deref() == Some(name.as_str()) {
            cancel.cancel();
            bail!("{} cancelled", spec.program);
        }

        let mut sink_error = None;
        if let Some(output) = self.output.get(&name) {
            for line in output.split_inclusive('\n') {
                if let Err(e) = sink.on_chunk(Bytes::from(line.to_string())).await {
                    sink_error = Some(e);
                    break;
                }
            }
        }

        Ok(CommandOutcome {
            exit_code: self.exit_codes.get(&name).copied().unwrap_or(0),
            sink_error,
        })
    }
}
