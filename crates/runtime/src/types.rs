use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncWrite;

use crate::error::Result;

/// CPU quota granted per CPU unit, in µs of a 100 000 µs period (half a core).
pub const CPU_UNIT: i64 = 50_000;

/// Scheduling period for CPU quotas, in µs.
pub const CPU_PERIOD: i64 = 100_000;

// ---------------------------------------------------------------------------
// Sandbox creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

/// A single mount attached to a sandbox at creation.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything the runtime needs to create one sandbox.
///
/// The hard isolation settings (no new privileges, dropped capabilities,
/// read-only rootfs, pids/fd limits) are not configurable per call — the
/// runtime applies them to every sandbox it creates.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    /// Memory limit in bytes. Swap is set to twice this value.
    pub memory: i64,
    /// CPU allowance in [`CPU_UNIT`]s.
    pub cpu: i64,
}

/// Target resources for a live sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// Memory limit in bytes. Swap follows at twice this value.
    pub memory: i64,
    /// CPU allowance in [`CPU_UNIT`]s.
    pub cpu: i64,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// One-shot usage sample for a sandbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxStats {
    pub memory_usage: u64,
    pub memory_limit: u64,
    /// Sandbox CPU time consumed since the previous sample, in ns.
    pub cpu_delta: u64,
    /// Host CPU time elapsed since the previous sample, in ns.
    pub system_delta: u64,
    pub online_cpus: u32,
}

impl SandboxStats {
    /// Memory usage as a percentage of the limit. Zero limit reads as 0%.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit == 0 {
            return 0.0;
        }
        self.memory_usage as f64 / self.memory_limit as f64 * 100.0
    }

    /// CPU usage as a percentage of one core, scaled by the online CPU
    /// count. Zero deltas read as 0%.
    pub fn cpu_percent(&self) -> f64 {
        if self.system_delta == 0 || self.cpu_delta == 0 {
            return 0.0;
        }
        self.cpu_delta as f64 / self.system_delta as f64 * self.online_cpus as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// A process to start inside a running sandbox.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub working_dir: String,
}

impl ExecSpec {
    /// Exec spec with the standard unprivileged defaults (`nobody`, `/tmp`).
    pub fn new(cmd: Vec<String>, env: Vec<String>) -> Self {
        Self {
            cmd,
            env,
            user: "nobody".to_string(),
            working_dir: "/tmp".to_string(),
        }
    }
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
pub type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Duplex byte channel to a process running inside a sandbox.
///
/// `output` interleaves stdout and stderr chunks in emission order (no TTY
/// is allocated, so the chunks are raw bytes, partial lines included).
pub struct ExecStream {
    pub output: OutputStream,
    pub stdin: StdinWriter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_percent_basic() {
        let stats = SandboxStats {
            memory_usage: 90,
            memory_limit: 100,
            ..Default::default()
        };
        assert!((stats.memory_percent() - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn memory_percent_zero_limit_is_zero() {
        let stats = SandboxStats::default();
        assert_eq!(stats.memory_percent(), 0.0);
    }

    #[test]
    fn cpu_percent_scales_by_online_cpus() {
        let stats = SandboxStats {
            cpu_delta: 50,
            system_delta: 100,
            online_cpus: 4,
            ..Default::default()
        };
        assert!((stats.cpu_percent() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_zero_denominator_is_zero() {
        let stats = SandboxStats {
            cpu_delta: 50,
            system_delta: 0,
            online_cpus: 4,
            ..Default::default()
        };
        assert_eq!(stats.cpu_percent(), 0.0);
    }
}
