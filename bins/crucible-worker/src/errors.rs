use crucible_common::types::Language;
use thiserror::Error;

/// Faults at the container runtime boundary.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to pull image {image}")]
    ImagePull {
        image: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("failed to create sandbox")]
    Create(#[source] bollard::errors::Error),
    #[error("failed to stage files into sandbox")]
    Stage(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("execution exceeded {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("exec failed inside sandbox")]
    Exec(#[source] bollard::errors::Error),
    #[error("failed to enumerate sandboxes")]
    List(#[source] bollard::errors::Error),
    #[error("failed to remove sandbox {name}")]
    Remove {
        name: String,
        #[source]
        source: bollard::errors::Error,
    },
}

impl SandboxError {
    /// Timeouts are per test case and never escalate to a task fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::ExecutionTimeout { .. })
    }
}

/// Faults in pool management.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no sandbox pool configured for language: {0}")]
    NoPool(Language),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Faults surfaced to the queue worker; anything here drives the
/// retry/dead-letter state machine.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("execution failed: {0}")]
    ExecutionFailed(anyhow::Error),
}
