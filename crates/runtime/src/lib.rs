//! Sandbox runtime abstraction.
//!
//! The pool and the session driver never talk to a container engine
//! directly; they go through [`ContainerRuntime`], which covers exactly the
//! RPC surface the service needs: image/volume preparation, sandbox
//! create/remove/update/stats, and exec create/attach/inspect.
//!
//! [`docker::DockerRuntime`] implements the trait against a local Docker
//! daemon. [`testing::InMemoryRuntime`] is a scriptable double for tests.

mod error;
mod types;

pub mod docker;
pub mod testing;

pub use error::{Result, RuntimeError};
pub use types::{
    ExecSpec, ExecStream, MountKind, MountSpec, OutputStream, ResourceUpdate, SandboxSpec,
    SandboxStats, StdinWriter, CPU_PERIOD, CPU_UNIT,
};

use async_trait::async_trait;

/// RPC client for the engine hosting the sandboxes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Make an image available locally, pulling it if absent.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create a named volume if it does not already exist.
    async fn ensure_volume(&self, name: &str) -> Result<()>;

    /// Create and start a sandbox; returns its id.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Force-remove a sandbox and its anonymous volumes.
    async fn remove_sandbox(&self, id: &str) -> Result<()>;

    /// Apply new memory/CPU quotas to a running sandbox.
    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<()>;

    /// Take a one-shot usage sample.
    async fn sandbox_stats(&self, id: &str) -> Result<SandboxStats>;

    /// Create an exec instance inside a sandbox; returns the exec id.
    async fn create_exec(&self, sandbox_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Attach to an exec instance, starting it.
    async fn attach_exec(&self, exec_id: &str) -> Result<ExecStream>;

    /// Whether the exec's process is still running.
    async fn exec_running(&self, exec_id: &str) -> Result<bool>;
}
