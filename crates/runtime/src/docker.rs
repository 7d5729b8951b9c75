//! Docker-backed [`ContainerRuntime`].
//!
//! Every sandbox is created with the same hardening regardless of language:
//! no new privileges, all capabilities dropped, read-only rootfs, pids and
//! rlimit caps, and an always-restart policy so a crashed interpreter comes
//! back without pool intervention.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerUpdateBody, HostConfig, Mount, MountTypeEnum, ResourcesUlimits,
    RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::ContainerRuntime;
use crate::types::{
    ExecSpec, ExecStream, MountKind, MountSpec, ResourceUpdate, SandboxSpec, SandboxStats,
    CPU_PERIOD, CPU_UNIT,
};

/// Grace period Docker allows a sandbox to stop before killing it (seconds).
const STOP_TIMEOUT_SECS: i64 = 300;

/// Process-count cap per sandbox.
const PIDS_LIMIT: i64 = 100;

/// Soft/hard rlimits applied to `nproc` and `nofile`.
const RLIMIT_SOFT: i64 = 50;
const RLIMIT_HARD: i64 = 100;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::NotAvailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn to_mount(m: &MountSpec) -> Mount {
    Mount {
        typ: Some(match m.kind {
            MountKind::Bind => MountTypeEnum::BIND,
            MountKind::Volume => MountTypeEnum::VOLUME,
        }),
        source: Some(m.source.clone()),
        target: Some(m.target.clone()),
        read_only: Some(m.read_only),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling image");
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| RuntimeError::Image(format!("{image}: {e}")))?;
        }
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                driver: Some("local".to_string()),
                ..Default::default()
            })
            .await
            .map_err(|e| RuntimeError::Volume(format!("{name}: {e}")))?;
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        let host_config = HostConfig {
            auto_remove: Some(false),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            readonly_rootfs: Some(true),
            memory: Some(spec.memory),
            memory_swap: Some(spec.memory * 2),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some(spec.cpu * CPU_UNIT),
            cpu_shares: Some(512),
            blkio_weight: Some(100),
            pids_limit: Some(PIDS_LIMIT),
            ulimits: Some(
                ["nproc", "nofile"]
                    .iter()
                    .map(|name| ResourcesUlimits {
                        name: Some(name.to_string()),
                        soft: Some(RLIMIT_SOFT),
                        hard: Some(RLIMIT_HARD),
                    })
                    .collect(),
            ),
            mounts: Some(spec.mounts.iter().map(to_mount).collect()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        // The sandbox idles in an interactive shell between execs; the shell
        // needs a TTY and open stdin to stay alive. Exec attachments are
        // created without a TTY (see create_exec).
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["sh".to_string()]),
            stop_timeout: Some(STOP_TIMEOUT_SECS),
            env: Some(spec.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|e| RuntimeError::CreationFailed(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::CreationFailed(format!("start {}: {e}", created.id)))?;

        Ok(created.id)
    }

    async fn remove_sandbox(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<()> {
        self.docker
            .update_container(
                id,
                ContainerUpdateBody {
                    memory: Some(update.memory),
                    memory_swap: Some(update.memory * 2),
                    cpu_period: Some(CPU_PERIOD),
                    cpu_quota: Some(update.cpu * CPU_UNIT),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn sandbox_stats(&self, id: &str) -> Result<SandboxStats> {
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut stream = self.docker.stats(id, Some(options));
        let sample = match stream.next().await {
            Some(sample) => sample?,
            None => return Err(RuntimeError::Exec(format!("no stats for {id}"))),
        };

        let memory = sample.memory_stats.unwrap_or_default();
        let cpu = sample.cpu_stats.unwrap_or_default();
        let precpu = sample.precpu_stats.unwrap_or_default();

        let total = cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
        let pre_total = precpu
            .cpu_usage
            .as_ref()
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let system = cpu.system_cpu_usage.unwrap_or(0);
        let pre_system = precpu.system_cpu_usage.unwrap_or(0);

        Ok(SandboxStats {
            memory_usage: memory.usage.unwrap_or(0) as u64,
            memory_limit: memory.limit.unwrap_or(0) as u64,
            cpu_delta: total.saturating_sub(pre_total) as u64,
            system_delta: system.saturating_sub(pre_system) as u64,
            online_cpus: cpu.online_cpus.unwrap_or(0) as u32,
        })
    }

    async fn create_exec(&self, sandbox_id: &str, spec: &ExecSpec) -> Result<String> {
        let created = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(spec.cmd.clone()),
                    env: Some(spec.env.clone()),
                    user: Some(spec.user.clone()),
                    working_dir: Some(spec.working_dir.clone()),
                    privileged: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;
        Ok(created.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<ExecStream> {
        let started = self
            .docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                output: Box::pin(output.map(|chunk| {
                    chunk
                        .map(|log| log.into_bytes())
                        .map_err(RuntimeError::from)
                })),
                stdin: input,
            }),
            StartExecResults::Detached => {
                Err(RuntimeError::Exec(format!("exec {exec_id} detached")))
            }
        }
    }

    async fn exec_running(&self, exec_id: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;
        Ok(inspect.running.unwrap_or(false))
    }
}
