pub mod process;
pub mod progress;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use process::{FfmpegProcess, ProcessConfig};
pub use scripted::{EngineOp, ScriptedEngine};

/// Event emitted by an engine while it loads or executes.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Fraction of the current command done, nominally 0.0..=1.0.
    Progress(f64),
    Log(String),
}

/// Receiver of engine events. Called synchronously from the engine, so all
/// events of a command are delivered before `exec` returns.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Collected output of a command that finished successfully.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub log: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine resource unavailable: {0}")]
    Resource(String),
    #[error("engine is not loaded")]
    NotLoaded,
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("command failed (exit code {code:?}): {diagnostic}")]
    Exec {
        code: Option<i32>,
        diagnostic: String,
    },
    #[error("file {name}: {source}")]
    File {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Text the engine printed for a failed command, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            EngineError::Exec { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

/// A transcoding engine with a private file area. Calls are not safe to
/// interleave: callers run write/exec/read sequences one at a time.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn load(&self, sink: Arc<dyn EventSink>) -> Result<(), EngineError>;

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    async fn exec(&self, args: &[String]) -> Result<ExecOutput, EngineError>;

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError>;
}

pub(crate) fn check_file_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EngineError::InvalidFileName(name.to_string()));
    }
    Ok(())
}
