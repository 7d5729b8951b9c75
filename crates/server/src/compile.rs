//! Host-side compile step for compiled languages.
//!
//! The source is written under the code directory, the language's compiler
//! runs as a host subprocess, and the resulting artifact path — valid on
//! both sides of the compiled-directory bind mount — becomes the exec
//! argument.

use std::path::Path;

use pool::{Artifact, HostPaths, LangSpec};
use tracing::debug;
use uuid::Uuid;

use crate::error::CompileError;

/// Compile `source` for `spec`, returning the artifact path to execute.
pub async fn host_compile(
    spec: &LangSpec,
    paths: &HostPaths,
    sandbox_id: &str,
    source: &str,
) -> Result<String, CompileError> {
    let host = spec
        .host_compile
        .as_ref()
        .ok_or_else(|| CompileError::Compile(format!("no host compiler for {}", spec.tag)))?;
    let file_name = spec
        .file_name
        .map(|name| name(sandbox_id))
        .ok_or_else(|| CompileError::Compile(format!("no source file rule for {}", spec.tag)))?;

    let source_path = paths.code_files().join(&file_name);
    tokio::fs::write(&source_path, source).await?;

    let out_dir = match host.artifact {
        Artifact::Ext(_) => paths.compiled_files(),
        Artifact::ClassDir => {
            let dir = paths.compiled_files().join(Uuid::new_v4().to_string());
            tokio::fs::create_dir_all(&dir).await?;
            dir
        }
    };

    let argv = (host.build_argv)(&source_path, &out_dir);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CompileError::Compile(format!("empty compiler command for {}", spec.tag)))?;

    debug!(lang = %spec.tag, program, "running host compiler");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(CompileError::Compile(combined.trim().to_string()));
    }

    let artifact = match host.artifact {
        Artifact::Ext(ext) => {
            let stem = Path::new(&file_name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone());
            out_dir.join(format!("{stem}.{ext}"))
        }
        Artifact::ClassDir => out_dir,
    };
    Ok(artifact.display().to_string())
}
