#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime not available: {0}")]
    NotAvailable(String),

    #[error("image preparation failed: {0}")]
    Image(String),

    #[error("volume creation failed: {0}")]
    Volume(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
