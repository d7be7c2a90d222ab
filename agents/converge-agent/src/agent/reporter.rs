//! Chunk Reporter
//!
//! Forwards chunks of policy output to the control service, retrying each
//! chunk under the shared delivery policy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::client::ControlPlane;
use crate::connection::protocol::LogChunk;
use crate::connection::retry::{check_status, retry, RetryPolicy};
use crate::runtime::adapter::ChunkSink;

/// Sink delivering output chunks for one policy run
pub struct ChunkReporter<C: ControlPlane> {
    control_plane: Arc<C>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    label: String,
    delivered: usize,
}

impl<C: ControlPlane> ChunkReporter<C> {
    pub fn new(
        control_plane: Arc<C>,
        policy: RetryPolicy,
        cancel: CancellationToken,
        label: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            policy,
            cancel,
            label: label.into(),
            delivered: 0,
        }
    }

    /// Chunks accepted by the control service so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

#[async_trait]
impl<C: ControlPlane> ChunkSink for ChunkReporter<C> {
    async fn on_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let payload = LogChunk::from_bytes(&chunk);
        let payload = &payload;
        let control_plane = &self.control_plane;
        let retry_client_errors = self.policy.retry_client_errors;

        retry(&self.policy, &self.cancel, || async move {
            let status = control_plane.submit_log_chunk(payload).await?;
            check_status(status, retry_client_errors)?;
            Ok(())
        })
        .await
        .with_context(|| {
            format!(
                "Failed to deliver output chunk {} for {}",
                self.delivered + 1,
                self.label
            )
        })?;

        self.delivered += 1;
        debug!(policy = %self.label, chunk = self.delivered, bytes = chunk.len(), "Output chunk delivered");
        Ok(())
    }
}
