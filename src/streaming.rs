use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, bounded};
use crate::error::{EngineError, EngineResult};
use crate::model::{ContainerTarget, TerminalSize};

pub const DEFAULT_SHELL: &str = "/bin/sh";

const OUTPUT_CHUNK: usize = 4096;

/// One text frame received from a terminal client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TerminalFrame {
    Input(Vec<u8>),
    Resize(TerminalSize),
}

#[derive(Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

impl TerminalFrame {
    /// `{"type":"resize","cols":C,"rows":R}` is a resize; anything else is input.
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(frame) if frame.kind == "resize" => Self::Resize(TerminalSize {
                cols: frame.cols,
                rows: frame.rows,
            }),
            _ => Self::Input(text.as_bytes().to_vec()),
        }
    }
}

/// Comma separated argv; empty means the default shell.
pub fn parse_command(command: Option<&str>) -> Vec<String> {
    let argv: Vec<String> = command
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    if argv.is_empty() {
        vec![DEFAULT_SHELL.to_string()]
    } else {
        argv
    }
}

/// A live exec. Output arrives in chunks; `recv` yields `None` once the remote side is done.
pub struct TerminalChannel {
    target: ContainerTarget,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    output: mpsc::Receiver<Vec<u8>>,
    resize: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
}

impl TerminalChannel {
    pub fn target(&self) -> &ContainerTarget {
        &self.target
    }

    pub async fn send(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let cluster = &self.target.cluster;
        self.stdin
            .write_all(bytes)
            .await
            .map_err(|error| EngineError::upstream(cluster, format!("terminal write: {error}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|error| EngineError::upstream(cluster, format!("terminal flush: {error}")))
    }

    pub async fn resize(&self, size: TerminalSize) -> EngineResult<()> {
        self.resize.send(size).await.map_err(|_| {
            EngineError::upstream(&self.target.cluster, "terminal closed before resize")
        })
    }

    /// Routes one client text frame to stdin or the resize channel.
    pub async fn handle_frame(&mut self, text: &str) -> EngineResult<()> {
        match TerminalFrame::decode(text) {
            TerminalFrame::Resize(size) => self.resize(size).await,
            TerminalFrame::Input(bytes) => self.send(&bytes).await,
        }
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    pub async fn close(mut self) {
        if let Err(error) = self.stdin.shutdown().await {
            debug!("terminal stdin for {} already closed: {error}", self.target);
        }
        self.cancel.cancel();
    }
}

impl Drop for TerminalChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Follows a container's log. Ends on close, on drop, or when the stream does.
pub struct LogTail {
    lines: mpsc::Receiver<EngineResult<String>>,
    cancel: CancellationToken,
}

impl LogTail {
    pub async fn next_line(&mut self) -> Option<EngineResult<String>> {
        self.lines.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct StreamingGateway {
    backend: Arc<dyn ClusterBackend>,
    request_timeout: Duration,
}

impl StreamingGateway {
    pub fn new(backend: Arc<dyn ClusterBackend>, request_timeout: Duration) -> Self {
        Self {
            backend,
            request_timeout,
        }
    }

    /// Init containers first.
    pub async fn containers(
        &self,
        cluster: &str,
        namespace: &str,
        pod: &str,
    ) -> EngineResult<Vec<String>> {
        bounded(
            cluster,
            "list containers",
            self.request_timeout,
            self.backend.pod_containers(cluster, namespace, pod),
        )
        .await
    }

    pub async fn open_terminal(
        &self,
        target: &ContainerTarget,
        command: Option<&str>,
    ) -> EngineResult<TerminalChannel> {
        self.ensure_container(target).await?;
        let argv = parse_command(command);
        info!("opening terminal on {target}: {}", argv.join(" "));

        let session = bounded(
            &target.cluster,
            "open terminal",
            self.request_timeout,
            self.backend.exec(target, argv),
        )
        .await?;

        let cancel = CancellationToken::new();
        let (output_tx, output) = mpsc::channel(64);
        let mut stdout = session.stdout;
        let reader_cancel = cancel.clone();
        let reader_target = target.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0_u8; OUTPUT_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    read = stdout.read(&mut buffer) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(count) => {
                        if output_tx.send(buffer[..count].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("terminal output for {reader_target} failed: {error}");
                        break;
                    }
                }
            }
            debug!("terminal reader for {reader_target} stopped");
        });

        let completion = session.completion;
        let completion_cancel = cancel.clone();
        let completion_target = target.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = completion_cancel.cancelled() => {}
                outcome = completion => match outcome {
                    Ok(()) => info!("terminal on {completion_target} exited"),
                    Err(error) => warn!("terminal on {completion_target} ended with error: {error:#}"),
                },
            }
        });

        Ok(TerminalChannel {
            target: target.clone(),
            stdin: session.stdin,
            output,
            resize: session.resize,
            cancel,
        })
    }

    pub async fn tail_logs(&self, target: &ContainerTarget) -> EngineResult<LogTail> {
        self.ensure_container(target).await?;
        let mut stream = bounded(
            &target.cluster,
            "open log stream",
            self.request_timeout,
            self.backend.stream_pod_logs(target),
        )
        .await?;

        let cancel = CancellationToken::new();
        let (lines_tx, lines) = mpsc::channel(256);
        let task_cancel = cancel.clone();
        let cluster = target.cluster.clone();
        let label = target.to_string();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                let Some(line) = next else {
                    break;
                };
                let line = line.map_err(|error| EngineError::from_anyhow(&cluster, &error));
                let failed = line.is_err();
                if lines_tx.send(line).await.is_err() || failed {
                    break;
                }
            }
            debug!("log tail for {label} stopped");
        });

        Ok(LogTail { lines, cancel })
    }

    /// One-shot command without a TTY, e.g. `curl,localhost:15000/config_dump`
    /// in an `istio-proxy` container. Returns stdout.
    pub async fn run_command(&self, target: &ContainerTarget, command: &str) -> EngineResult<String> {
        if command.split(',').all(|part| part.trim().is_empty()) {
            return Err(EngineError::InvalidInput(
                "command must not be empty".to_string(),
            ));
        }
        self.ensure_container(target).await?;
        let argv = parse_command(Some(command));
        debug!("running {} in {target}", argv.join(" "));

        bounded(
            &target.cluster,
            "run command",
            self.request_timeout,
            self.backend.exec_capture(target, argv),
        )
        .await
    }

    pub async fn fetch_logs(&self, target: &ContainerTarget) -> EngineResult<String> {
        bounded(
            &target.cluster,
            "fetch logs",
            self.request_timeout,
            self.backend.get_pod_container_logs(target),
        )
        .await
    }

    async fn ensure_container(&self, target: &ContainerTarget) -> EngineResult<()> {
        let containers = self
            .containers(&target.cluster, &target.namespace, &target.pod)
            .await?;
        if containers.iter().any(|name| name == &target.container) {
            return Ok(());
        }

        Err(EngineError::upstream(
            &target.cluster,
            format!(
                "container {} not found in pod {}/{}",
                target.container, target.namespace, target.pod
            ),
        ))
    }
}
