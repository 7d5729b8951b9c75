//! Language profiles.
//!
//! One [`LangSpec`] per supported language: image, resource envelope, idle
//! thresholds, mounts, and the command builders the session driver uses.
//! The set is fixed at startup — there is no dynamic registration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use runtime::{MountKind, MountSpec, SandboxSpec};

use crate::error::{PoolError, Result};
use crate::paths::HostPaths;

const fn mib(n: i64) -> i64 {
    n * 1024 * 1024
}

const BASE_ENV: &[&str] = &[
    "HOME=/tmp",
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
];

const PYTHON_ENV: &[&str] = &[
    "HOME=/tmp",
    "PYTHONUNBUFFERED=1",
    "PYTHONPATH=/opt/py-packages",
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
];

const JAVA_ENV: &[&str] = &[
    "HOME=/tmp",
    "PATH=/usr/local/openjdk-21/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
];

// ---------------------------------------------------------------------------
// LangSpec
// ---------------------------------------------------------------------------

/// How a host compilation's output is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// The source file name with its extension replaced by this one.
    Ext(&'static str),
    /// A per-compilation directory of class files; the entry class is
    /// discovered by scanning it.
    ClassDir,
}

/// Host-side compile step for a compiled language.
#[derive(Clone, Debug)]
pub struct HostCompile {
    /// Build the compiler argv for (source path, output directory).
    pub build_argv: fn(&Path, &Path) -> Vec<String>,
    pub artifact: Artifact,
}

/// Immutable profile of one supported language.
#[derive(Clone, Debug)]
pub struct LangSpec {
    pub tag: String,
    pub image: String,
    pub is_compiled: bool,
    /// CPU allowance bounds, in runtime CPU units.
    pub min_cpu: i64,
    pub max_cpu: i64,
    pub incr_cpu: i64,
    /// Memory bounds in bytes.
    pub min_mem: i64,
    pub max_mem: i64,
    pub incr_mem: i64,
    /// Below both idle thresholds (percent), a sandbox is reaped.
    pub cpu_idle_threshold: f64,
    pub mem_idle_threshold: f64,
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    /// Build the in-sandbox argv. For interpreted languages the argument is
    /// the source itself; for compiled ones it is the artifact path.
    pub exec_cmd: fn(&str) -> Vec<String>,
    pub host_compile: Option<HostCompile>,
    /// Per-user source file name for compiled languages.
    pub file_name: Option<fn(&str) -> String>,
}

impl LangSpec {
    /// Creation request for a sandbox of this language, at minimum quota.
    pub fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            image: self.image.clone(),
            env: self.env.clone(),
            mounts: self.mounts.clone(),
            memory: self.min_mem,
            cpu: self.min_cpu,
        }
    }
}

// ---------------------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------------------

fn node_eval(source: &str) -> Vec<String> {
    vec!["node".into(), "-e".into(), source.into()]
}

fn node_run(artifact: &str) -> Vec<String> {
    vec!["node".into(), artifact.into()]
}

fn python_eval(source: &str) -> Vec<String> {
    vec!["python3".into(), "-c".into(), source.into()]
}

fn php_eval(source: &str) -> Vec<String> {
    vec!["php".into(), "-r".into(), source.into()]
}

fn binary_run(artifact: &str) -> Vec<String> {
    vec![artifact.into()]
}

/// Run the first compiled class found in the directory, or `Main`.
///
/// The class directory is bind-mounted at its own host path, so scanning
/// the argument works from the host side too.
fn java_run(class_dir: &str) -> Vec<String> {
    let entry = std::fs::read_dir(class_dir)
        .ok()
        .and_then(|entries| {
            entries.filter_map(|e| e.ok()).find_map(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_suffix(".class").map(str::to_string)
            })
        })
        .unwrap_or_else(|| "Main".to_string());
    vec!["java".into(), "-cp".into(), class_dir.into(), entry]
}

fn tsc_argv(source: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "tsc".into(),
        source.display().to_string(),
        "--outDir".into(),
        out_dir.display().to_string(),
    ]
}

fn compiled_output(source: &Path, out_dir: &Path, ext: &str) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    out_dir.join(format!("{stem}.{ext}")).display().to_string()
}

fn gcc_argv(source: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "gcc".into(),
        source.display().to_string(),
        "-o".into(),
        compiled_output(source, out_dir, "out"),
    ]
}

fn gpp_argv(source: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "g++".into(),
        source.display().to_string(),
        "-o".into(),
        compiled_output(source, out_dir, "out"),
    ]
}

fn javac_argv(source: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "javac".into(),
        "-d".into(),
        out_dir.display().to_string(),
        source.display().to_string(),
    ]
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn ts_file_name(sandbox_id: &str) -> String {
    format!("{sandbox_id}-{}-code.ts", unix_nanos())
}

fn c_file_name(sandbox_id: &str) -> String {
    format!("{sandbox_id}-{}-code.c", unix_nanos())
}

fn cpp_file_name(sandbox_id: &str) -> String {
    format!("{sandbox_id}-{}-code.cpp", unix_nanos())
}

fn java_file_name(sandbox_id: &str) -> String {
    format!("{sandbox_id}-{}-code.java", unix_nanos())
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Read-only registry of language profiles, keyed by tag.
pub struct Catalog {
    specs: HashMap<String, Arc<LangSpec>>,
}

impl Catalog {
    /// The production language set.
    pub fn builtin(paths: &HostPaths) -> Self {
        let compiled_dir = paths.compiled_files();
        let compiled_mount = MountSpec {
            kind: MountKind::Bind,
            source: compiled_dir.display().to_string(),
            target: compiled_dir.display().to_string(),
            read_only: true,
        };
        let npm_mount = MountSpec {
            kind: MountKind::Volume,
            source: "vol-npm".into(),
            target: "/usr/local/lib/node_modules".into(),
            read_only: true,
        };
        let pip_mount = MountSpec {
            kind: MountKind::Volume,
            source: "vol-pip".into(),
            target: "/opt/py-packages".into(),
            read_only: true,
        };

        let env = |e: &[&str]| e.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let specs = vec![
            LangSpec {
                tag: "js".into(),
                image: "node:22.14-alpine".into(),
                is_compiled: false,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(128),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 5.0,
                mem_idle_threshold: 15.0,
                env: env(BASE_ENV),
                mounts: vec![npm_mount.clone()],
                exec_cmd: node_eval,
                host_compile: None,
                file_name: None,
            },
            LangSpec {
                tag: "ts".into(),
                image: "node:22.14-alpine".into(),
                is_compiled: true,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(128),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 5.0,
                mem_idle_threshold: 15.0,
                env: env(BASE_ENV),
                mounts: vec![npm_mount, compiled_mount.clone()],
                exec_cmd: node_run,
                host_compile: Some(HostCompile {
                    build_argv: tsc_argv,
                    artifact: Artifact::Ext("js"),
                }),
                file_name: Some(ts_file_name),
            },
            LangSpec {
                tag: "py".into(),
                image: "python:3.12-alpine".into(),
                is_compiled: false,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(128),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 5.0,
                mem_idle_threshold: 15.0,
                env: env(PYTHON_ENV),
                mounts: vec![pip_mount.clone()],
                exec_cmd: python_eval,
                host_compile: None,
                file_name: None,
            },
            LangSpec {
                tag: "py-ml".into(),
                image: "python:3.12-alpine".into(),
                is_compiled: false,
                min_cpu: 2,
                max_cpu: 4,
                incr_cpu: 1,
                min_mem: mib(256),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 5.0,
                mem_idle_threshold: 30.0,
                env: env(PYTHON_ENV),
                mounts: vec![pip_mount],
                exec_cmd: python_eval,
                host_compile: None,
                file_name: None,
            },
            LangSpec {
                tag: "c".into(),
                image: "debian:12.10-slim".into(),
                is_compiled: true,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(128),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 3.0,
                mem_idle_threshold: 5.0,
                env: env(BASE_ENV),
                mounts: vec![compiled_mount.clone()],
                exec_cmd: binary_run,
                host_compile: Some(HostCompile {
                    build_argv: gcc_argv,
                    artifact: Artifact::Ext("out"),
                }),
                file_name: Some(c_file_name),
            },
            LangSpec {
                tag: "cpp".into(),
                image: "gcc:14".into(),
                is_compiled: true,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(128),
                max_mem: mib(1024),
                incr_mem: mib(100),
                cpu_idle_threshold: 3.0,
                mem_idle_threshold: 5.0,
                env: env(BASE_ENV),
                mounts: vec![compiled_mount.clone()],
                exec_cmd: binary_run,
                host_compile: Some(HostCompile {
                    build_argv: gpp_argv,
                    artifact: Artifact::Ext("out"),
                }),
                file_name: Some(cpp_file_name),
            },
            LangSpec {
                tag: "java".into(),
                image: "openjdk:21-slim".into(),
                is_compiled: true,
                min_cpu: 1,
                max_cpu: 2,
                incr_cpu: 1,
                min_mem: mib(256),
                max_mem: mib(1024),
                incr_mem: mib(128),
                cpu_idle_threshold: 3.0,
                mem_idle_threshold: 15.0,
                env: env(JAVA_ENV),
                mounts: vec![compiled_mount],
                exec_cmd: java_run,
                host_compile: Some(HostCompile {
                    build_argv: javac_argv,
                    artifact: Artifact::ClassDir,
                }),
                file_name: Some(java_file_name),
            },
            LangSpec {
                tag: "php".into(),
                image: "php:8.3-cli".into(),
                is_compiled: false,
                min_cpu: 1,
                max_cpu: 1,
                incr_cpu: 1,
                min_mem: mib(64),
                max_mem: mib(256),
                incr_mem: mib(64),
                cpu_idle_threshold: 3.0,
                mem_idle_threshold: 5.0,
                env: env(BASE_ENV),
                mounts: vec![],
                exec_cmd: php_eval,
                host_compile: None,
                file_name: None,
            },
        ];

        Self::with_specs(specs)
    }

    /// Catalog from an explicit spec list (tests).
    pub fn with_specs(specs: Vec<LangSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.tag.clone(), Arc::new(spec)))
                .collect(),
        }
    }

    pub fn get(&self, tag: &str) -> Result<Arc<LangSpec>> {
        self.specs
            .get(tag)
            .cloned()
            .ok_or_else(|| PoolError::UnsupportedLanguage(tag.to_string()))
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<LangSpec>> {
        self.specs.values()
    }
}
