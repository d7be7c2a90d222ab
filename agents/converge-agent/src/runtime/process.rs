//! Process Runner
//!
//! Implementation of CommandRunner on top of tokio child processes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::adapter::{ChunkSink, CommandOutcome, CommandRunner, CommandSpec};
use crate::runtime::chunker::{ChunkBuffer, Thresholds};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Runs commands as local child processes, merging stdout and stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

/// Forwards chunks to the sink until it fails once
struct Delivery<'a> {
    sink: &'a mut dyn ChunkSink,
    error: Option<anyhow::Error>,
    dropped: usize,
}

impl Delivery<'_> {
    async fn deliver(&mut self, chunk: Bytes) {
        if self.error.is_some() {
            self.dropped += 1;
            return;
        }
        if let Err(e) = self.sink.on_chunk(chunk).await {
            warn!(error = %e, "Chunk delivery failed, discarding remaining output");
            self.error = Some(e);
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Bytes>) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Ok(());
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap cancelled child");
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    cmd
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        thresholds: Thresholds,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        let mut child = build_command(spec)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;
        debug!(program = %spec.program, pid = ?child.id(), "Command started");

        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = child.stderr.take().context("Child stderr not captured")?;

        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(pump(stdout, tx.clone()));
        tokio::spawn(pump(stderr, tx));

        let mut buffer = ChunkBuffer::new(thresholds);
        let mut delivery = Delivery {
            sink,
            error: None,
            dropped: 0,
        };

        loop {
            let deadline = buffer.deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    bail!("{} cancelled", spec.program);
                }
                piece = rx.recv() => match piece {
                    Some(piece) => {
                        for chunk in buffer.push(&piece, Instant::now()) {
                            delivery.deliver(chunk).await;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(chunk) = buffer.flush_due(Instant::now()) {
                        delivery.deliver(chunk).await;
                    }
                }
            }
        }

        if let Some(chunk) = buffer.finish() {
            delivery.deliver(chunk).await;
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                bail!("{} cancelled", spec.program);
            }
            status = child.wait() => status.with_context(|| format!("Failed to wait for {}", spec.program))?,
        };

        if delivery.dropped > 0 {
            warn!(dropped = delivery.dropped, "Output chunks not reported");
        }

        Ok(CommandOutcome {
            exit_code: status.code().unwrap_or(-1),
            sink_error: delivery.error,
        })
    }
}
