//! Error types for the pipeline core
//!
//! Every failure carries an [`ErrorKind`] so the supervisor can decide between
//! teardown and ignore without inspecting messages.

use thiserror::Error;

use crate::pipeline::stream::StreamId;
use crate::pipeline::types::Timestamp;

/// Error classes with one handling policy each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Sequencing bug; never tolerated
    ContractViolation,
    /// Local overload; the unit of work is dropped and the pipeline continues
    TransientOverload,
    /// Unrecoverable failure of a collaborator; the topology must be torn down
    Fatal,
    /// A pool could not serve the requested allocation shape
    ResourceExhaustion,
    /// The stream is not part of the pinned topology (it has drained)
    NotConnected,
    /// The surrounding work context was cancelled
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ContractViolation => "contract violation",
            ErrorKind::TransientOverload => "transient overload",
            ErrorKind::Fatal => "fatal",
            ErrorKind::ResourceExhaustion => "resource exhaustion",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Main error type for the pipeline core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Duplicate request on edge {from} -> {to}: packet {packet} while {pending} is outstanding")]
    DuplicateRequest {
        from: StreamId,
        to: StreamId,
        packet: u64,
        pending: u64,
    },

    #[error("Out-of-order packet {packet} on edge {from} -> {to} (last {last:?}, pending {pending:?})")]
    OutOfOrderPacket {
        from: StreamId,
        to: StreamId,
        packet: u64,
        last: Option<u64>,
        pending: Option<u64>,
    },

    #[error("Stream {0} was never added to the topology")]
    UnknownStream(StreamId),

    #[error("Stream {0} is not connected in the pinned topology")]
    NotConnected(StreamId),

    #[error("Buffer pool '{0}' used after dispose")]
    PoolDisposed(String),

    #[error("Buffer pool '{pool}' disposed with {outstanding} buffers still checked out")]
    PoolLeak { pool: String, outstanding: usize },

    #[error("Buffer pool '{pool}' allocates {expected}, requested {requested}")]
    ShapeMismatch {
        pool: String,
        expected: String,
        requested: String,
    },

    #[error("Mixer input {input} has neither data nor leftover for packet {packet}")]
    MixerInputMissing { input: usize, packet: u64 },

    #[error("Due time {due} already elapsed (now {now})")]
    DueTimeElapsed { due: Timestamp, now: Timestamp },

    #[error("Clock sink '{0}' refused to start")]
    ClockRefused(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Fatal error in {stream}: {message}")]
    Fatal { stream: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn fatal(stream: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Fatal {
            stream: stream.into(),
            message: message.into(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        PipelineError::Contract(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::DuplicateRequest { .. }
            | PipelineError::OutOfOrderPacket { .. }
            | PipelineError::UnknownStream(_)
            | PipelineError::PoolDisposed(_)
            | PipelineError::PoolLeak { .. }
            | PipelineError::MixerInputMissing { .. }
            | PipelineError::InvalidState { .. }
            | PipelineError::Contract(_) => ErrorKind::ContractViolation,
            PipelineError::DueTimeElapsed { .. } | PipelineError::Overloaded(_) => {
                ErrorKind::TransientOverload
            }
            PipelineError::ShapeMismatch { .. } => ErrorKind::ResourceExhaustion,
            PipelineError::ClockRefused(_) | PipelineError::Fatal { .. } => ErrorKind::Fatal,
            PipelineError::NotConnected(_) => ErrorKind::NotConnected,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the error must abort the current call chain
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Fatal | ErrorKind::ContractViolation | ErrorKind::ResourceExhaustion
        )
    }
}

/// Convenience Result type using the pipeline error
pub type Result<T> = std::result::Result<T, PipelineError>;
