#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("sandbox creation failed: {0}")]
    SandboxCreateFailed(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
