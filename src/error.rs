//! Error types for the engine and the sandbox layer.

use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced through the engine's public contract.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("session not accepting input (state={0})")]
    InvalidState(SessionState),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Errors from the container runtime and workspace handling.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out writing to container stdin")]
    StdinTimeout,
}
