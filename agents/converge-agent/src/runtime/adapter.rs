//! Command Runner Trait
//!
//! Defines the common interface for running a local policy command while
//! streaming its output.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::runtime::chunker::Thresholds;

/// What to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// How a streamed command ended
#[derive(Debug)]
pub struct CommandOutcome {
    /// Process exit code; `-1` when terminated by a signal
    pub exit_code: i32,
    /// First chunk delivery failure; later chunks were not delivered
    pub sink_error: Option<anyhow::Error>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Receives output chunks in program order
#[async_trait]
pub trait ChunkSink: Send {
    async fn on_chunk(&mut self, chunk: Bytes) -> Result<()>;
}

/// Command runner trait - runs a process and streams its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, handing output to `sink` as `thresholds` are reached.
    ///
    /// Cancellation terminates the process and returns an error.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        thresholds: Thresholds,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome>;
}
