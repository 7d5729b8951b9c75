//! In-memory [`ContainerRuntime`] for tests.
//!
//! No daemon, no processes: sandboxes and execs are bookkeeping entries,
//! and the test drives the exec's lifecycle by pushing output chunks and
//! flipping the running flag. Everything the runtime was asked to do is
//! recorded and can be asserted on afterwards.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::error::{Result, RuntimeError};
use crate::types::{ExecSpec, ExecStream, ResourceUpdate, SandboxSpec, SandboxStats};
use crate::ContainerRuntime;

#[derive(Default)]
struct State {
    next_sandbox: u64,
    next_exec: u64,
    sandboxes: HashMap<String, SandboxSpec>,
    removed: Vec<String>,
    updates: Vec<(String, ResourceUpdate)>,
    stats: HashMap<String, SandboxStats>,
    images: Vec<String>,
    volumes: Vec<String>,
    execs: HashMap<String, Exec>,
    fail_create: bool,
    fail_stats: Vec<String>,
    fail_update: Vec<String>,
}

struct Exec {
    sandbox_id: String,
    spec: ExecSpec,
    running: Arc<AtomicBool>,
    output_tx: Option<mpsc::UnboundedSender<Bytes>>,
    output_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    stdin: Arc<Mutex<Vec<u8>>>,
}

/// Scriptable runtime double. Clone-free: share it via `Arc`.
#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_sandbox` fail.
    pub fn fail_creates(&self) {
        self.lock().fail_create = true;
    }

    /// Script the next stats sample for a sandbox.
    pub fn set_stats(&self, id: &str, stats: SandboxStats) {
        self.lock().stats.insert(id.to_string(), stats);
    }

    /// Make `sandbox_stats` fail for this sandbox.
    pub fn fail_stats(&self, id: &str) {
        self.lock().fail_stats.push(id.to_string());
    }

    /// Make `update_resources` fail for this sandbox.
    pub fn fail_update(&self, id: &str) {
        self.lock().fail_update.push(id.to_string());
    }

    /// Emit an output chunk from a live exec.
    pub fn push_output(&self, exec_id: &str, chunk: &[u8]) {
        if let Some(exec) = self.lock().execs.get(exec_id) {
            if let Some(tx) = &exec.output_tx {
                let _ = tx.send(Bytes::copy_from_slice(chunk));
            }
        }
    }

    /// Mark an exec's process as exited and close its output stream.
    pub fn finish_exec(&self, exec_id: &str) {
        if let Some(exec) = self.lock().execs.get_mut(exec_id) {
            exec.running.store(false, Ordering::SeqCst);
            exec.output_tx = None;
        }
    }

    pub fn created_count(&self) -> u64 {
        self.lock().next_sandbox
    }

    pub fn live_sandboxes(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().sandboxes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn updates(&self) -> Vec<(String, ResourceUpdate)> {
        self.lock().updates.clone()
    }

    pub fn exec_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().execs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn exec_spec(&self, exec_id: &str) -> Option<ExecSpec> {
        self.lock().execs.get(exec_id).map(|e| e.spec.clone())
    }

    pub fn exec_sandbox(&self, exec_id: &str) -> Option<String> {
        self.lock().execs.get(exec_id).map(|e| e.sandbox_id.clone())
    }

    /// Everything written to an exec's stdin so far.
    pub fn stdin_bytes(&self, exec_id: &str) -> Vec<u8> {
        self.lock()
            .execs
            .get(exec_id)
            .map(|e| e.stdin.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().images.clone()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.lock().volumes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.lock().images.push(image.to_string());
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        self.lock().volumes.push(name.to_string());
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(RuntimeError::CreationFailed("scripted failure".into()));
        }
        state.next_sandbox += 1;
        let id = format!("sbx-{:04}", state.next_sandbox);
        state.sandboxes.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn remove_sandbox(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.sandboxes.remove(id);
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<()> {
        let mut state = self.lock();
        if state.fail_update.iter().any(|f| f == id) {
            return Err(RuntimeError::Exec(format!("scripted update failure: {id}")));
        }
        state.updates.push((id.to_string(), update));
        Ok(())
    }

    async fn sandbox_stats(&self, id: &str) -> Result<SandboxStats> {
        let state = self.lock();
        if state.fail_stats.iter().any(|f| f == id) {
            return Err(RuntimeError::Exec(format!("scripted stats failure: {id}")));
        }
        Ok(state.stats.get(id).copied().unwrap_or_default())
    }

    async fn create_exec(&self, sandbox_id: &str, spec: &ExecSpec) -> Result<String> {
        let mut state = self.lock();
        if !state.sandboxes.contains_key(sandbox_id) {
            return Err(RuntimeError::Exec(format!("no such sandbox: {sandbox_id}")));
        }
        state.next_exec += 1;
        let id = format!("exec-{:04}", state.next_exec);
        let (tx, rx) = mpsc::unbounded_channel();
        state.execs.insert(
            id.clone(),
            Exec {
                sandbox_id: sandbox_id.to_string(),
                spec: spec.clone(),
                running: Arc::new(AtomicBool::new(true)),
                output_tx: Some(tx),
                output_rx: Some(rx),
                stdin: Arc::new(Mutex::new(Vec::new())),
            },
        );
        Ok(id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<ExecStream> {
        let mut state = self.lock();
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::Exec(format!("no such exec: {exec_id}")))?;
        let mut rx = exec
            .output_rx
            .take()
            .ok_or_else(|| RuntimeError::Exec(format!("already attached: {exec_id}")))?;
        let stdin = Arc::clone(&exec.stdin);
        Ok(ExecStream {
            output: Box::pin(stream::poll_fn(move |cx| rx.poll_recv(cx)).map(Ok::<_, RuntimeError>)),
            stdin: Box::pin(CaptureWriter(stdin)),
        })
    }

    async fn exec_running(&self, exec_id: &str) -> Result<bool> {
        let state = self.lock();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| RuntimeError::Exec(format!("no such exec: {exec_id}")))?;
        Ok(exec.running.load(Ordering::SeqCst))
    }
}

/// AsyncWrite that appends everything into a shared buffer.
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
