//! Per-session live-execution driver.
//!
//! One driver per client connection. It claims a pool seat, then loops:
//! wait for a `CODE:` frame, prepare the exec (host-compiling first for
//! compiled languages), attach, and pump bytes until the process ends, the
//! client stops or replaces it, the timeout fires, or the transport goes
//! away. Replacing the code mid-run keeps the same sandbox and seat.
//!
//! Each attachment owns a token derived from the session's, which is
//! derived from the process-wide one; cancelling it stops the output pump,
//! the liveness watch, and the input loop within one poll interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use pool::{LangSpec, Pool};
use runtime::{ContainerRuntime, ExecSpec, ExecStream, OutputStream};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compile;
use crate::error::SessionError;
use crate::transport::{Outbound, CODE_PREFIX, EXEC_TERMINATED, EXEC_TIMEOUT, STOP_COMMAND};

/// Largest program-output chunk forwarded in one frame.
const MAX_OUTPUT_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hard cap on a single execution.
    pub exec_timeout: Duration,
    /// How often the liveness watch inspects the exec.
    pub liveness_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(300),
            liveness_poll: Duration::from_millis(500),
        }
    }
}

/// Why an attachment ended.
enum Attachment {
    /// Process exited, was stopped, or timed out; await the next frame.
    Finished,
    /// A new `CODE:` frame arrived mid-run; run it in the same sandbox.
    HotSwap(String),
    /// The transport closed.
    SessionClosed,
}

pub struct SessionDriver<R> {
    pool: Arc<Pool<R>>,
    runtime: Arc<R>,
    paths: pool::HostPaths,
    lang: String,
    config: SessionConfig,
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<String>,
}

impl<R: ContainerRuntime> SessionDriver<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<Pool<R>>,
        runtime: Arc<R>,
        paths: pool::HostPaths,
        lang: String,
        config: SessionConfig,
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            pool,
            runtime,
            paths,
            lang,
            config,
            outbound,
            inbound,
        }
    }

    /// Drive the session to completion. The seat is always released on the
    /// way out, whatever the exit reason.
    pub async fn run(mut self, session: CancellationToken) -> Result<(), SessionError> {
        let spec = match self.pool.catalog().get(&self.lang) {
            Ok(spec) => spec,
            Err(e) => {
                self.send_error(&e).await;
                return Err(e.into());
            }
        };

        let sandbox_id = match self.pool.acquire(&self.lang).await {
            Ok(id) => id,
            Err(e) => {
                self.send_error(&e).await;
                return Err(e.into());
            }
        };
        self.send_text(format!("Container started: {sandbox_id}"))
            .await;

        let result = self.drive(&spec, &sandbox_id, &session).await;
        self.pool.release(&sandbox_id).await;
        result
    }

    async fn drive(
        &mut self,
        spec: &LangSpec,
        sandbox_id: &str,
        session: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut pending: Option<String> = None;

        loop {
            // Await-Code
            let message = match pending.take() {
                Some(swap) => swap,
                None => tokio::select! {
                    _ = session.cancelled() => return Ok(()),
                    frame = self.inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => return Ok(()),
                    },
                },
            };

            let Some(source) = message.strip_prefix(CODE_PREFIX) else {
                return Err(SessionError::Protocol(format!(
                    "expected a {CODE_PREFIX} frame"
                )));
            };

            // Prepare
            let exec_arg = if spec.is_compiled {
                match compile::host_compile(spec, &self.paths, sandbox_id, source).await {
                    Ok(artifact) => artifact,
                    Err(e) => {
                        self.send_error(&e).await;
                        continue;
                    }
                }
            } else {
                source.to_string()
            };

            let argv = (spec.exec_cmd)(&exec_arg);
            let exec_spec = ExecSpec::new(argv, spec.env.clone());

            let exec_id = match self.runtime.create_exec(sandbox_id, &exec_spec).await {
                Ok(id) => id,
                Err(e) => {
                    self.send_error(&e).await;
                    continue;
                }
            };
            let stream = match self.runtime.attach_exec(&exec_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.send_error(&e).await;
                    continue;
                }
            };

            // Attached
            debug!(sandbox_id, exec_id, "exec attached");
            match self.attached(&exec_id, stream, session).await {
                Attachment::Finished => {}
                Attachment::HotSwap(frame) => {
                    info!(sandbox_id, "replacing program, sandbox kept");
                    pending = Some(frame);
                }
                Attachment::SessionClosed => return Ok(()),
            }
        }
    }

    /// Run the three attachment activities until all agree to stop.
    async fn attached(
        &mut self,
        exec_id: &str,
        stream: ExecStream,
        session: &CancellationToken,
    ) -> Attachment {
        let token = session.child_token();
        let ExecStream { output, mut stdin } = stream;

        let pump = tokio::spawn(output_pump(output, self.outbound.clone(), token.clone()));
        let watch = tokio::spawn(liveness_watch(
            Arc::clone(&self.runtime),
            exec_id.to_string(),
            self.outbound.clone(),
            token.clone(),
            self.config.clone(),
        ));

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Attachment::Finished,
                frame = self.inbound.recv() => match frame {
                    None => {
                        token.cancel();
                        break Attachment::SessionClosed;
                    }
                    Some(frame) if frame.starts_with(CODE_PREFIX) => {
                        token.cancel();
                        break Attachment::HotSwap(frame);
                    }
                    Some(frame) if frame == STOP_COMMAND => {
                        token.cancel();
                        break Attachment::Finished;
                    }
                    Some(frame) => {
                        // Everything else is stdin for the program.
                        let mut line = frame.into_bytes();
                        line.push(b'\n');
                        if let Err(e) = stdin.write_all(&line).await {
                            warn!(exec_id, error = %e, "stdin write failed");
                        } else {
                            let _ = stdin.flush().await;
                        }
                    }
                },
            }
        };

        let _ = pump.await;
        let _ = watch.await;
        outcome
    }

    async fn send_text(&self, text: String) {
        let _ = self.outbound.send(Outbound::Text(text)).await;
    }

    async fn send_error(&self, error: &impl std::fmt::Display) {
        self.send_text(format!("error: {error}")).await;
    }
}

/// Forward exec output to the client in bounded chunks until EOF, read
/// error, or cancellation.
async fn output_pump(
    mut output: OutputStream,
    outbound: mpsc::Sender<Outbound>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            chunk = output.next() => match chunk {
                Some(Ok(bytes)) => {
                    for part in bytes.chunks(MAX_OUTPUT_CHUNK) {
                        if outbound
                            .send(Outbound::Output(Bytes::copy_from_slice(part)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "exec output read failed");
                    return;
                }
                None => return,
            },
        }
    }
}

/// Poll the exec every `liveness_poll`: a finished process yields
/// [`EXEC_TERMINATED`], an over-budget one [`EXEC_TIMEOUT`]; either way the
/// attachment token is tripped.
async fn liveness_watch<R: ContainerRuntime>(
    runtime: Arc<R>,
    exec_id: String,
    outbound: mpsc::Sender<Outbound>,
    token: CancellationToken,
    config: SessionConfig,
) {
    let started = Instant::now();
    let mut poll = tokio::time::interval(config.liveness_poll);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = poll.tick() => {
                if started.elapsed() >= config.exec_timeout {
                    info!(exec_id = %exec_id, "execution timed out");
                    token.cancel();
                    let _ = outbound.send(Outbound::Text(EXEC_TIMEOUT.to_string())).await;
                    return;
                }
                match runtime.exec_running(&exec_id).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        token.cancel();
                        let _ = outbound.send(Outbound::Text(EXEC_TERMINATED.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}
