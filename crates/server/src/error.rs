#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Runtime(#[from] runtime::RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session ended abnormally. A clean transport close is not an error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Pool(#[from] pool::PoolError),
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("failed to write source: {0}")]
    Write(#[from] std::io::Error),

    /// Combined compiler stdout+stderr; displayed verbatim to the client.
    #[error("{0}")]
    Compile(String),
}
