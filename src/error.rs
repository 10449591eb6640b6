//! Typed error kinds for the manifest graph, object store, and sandbox.
//!
//! These are the "exceptions that become typed results" called for in the
//! design notes: cache-miss/busy-object/protocol/remote conditions that a
//! caller might want to branch on, as opposed to plain I/O failures which
//! are wrapped with [`anyhow::Context`] at the call site instead.

use std::fmt;

/// A single unmatched checkpoint glob pattern, reported back to the caller
/// instead of silently doing nothing (spec.md §4.8, §8 boundary behaviors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedPattern(pub String);

#[derive(Debug)]
pub enum GraphError {
    /// Manifest failed schema or cross-reference validation.
    Validation(String),
    /// A stage/input/device/mount/source type name has no registered handler.
    UnknownModule { kind: &'static str, name: String },
    /// A dependency cycle was found among pipelines or devices.
    Cycle(String),
    /// Object store API misused: a write was attempted while a reader is live.
    BusyRead,
    /// Object store API misused: a write was attempted while a writer is live.
    BusyWrite,
    /// `finalize` was called while a writer was still active.
    InUse,
    /// An RPC payload was malformed or named an unknown method.
    Protocol(String),
    /// A service handler raised an exception-equivalent.
    Remote { kind: String, message: String },
    /// Mount setup or teardown failed.
    Mount(String),
    /// Device open/close failed.
    Device(String),
    /// Loop-device allocation or binding failed.
    Loop(String),
    /// A stage process exited with a non-zero return code.
    StageFailed { stage: String, returncode: i32 },
    /// A stage ran longer than its configured timeout and was killed.
    Timeout { stage: String, secs: u64 },
    /// The build was interrupted (SIGINT).
    Cancelled,
    /// A write was attempted on an object already published as a ref.
    ReadOnly,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Validation(msg) => write!(f, "manifest validation failed: {msg}"),
            GraphError::UnknownModule { kind, name } => {
                write!(f, "unknown {kind} module: {name}")
            }
            GraphError::Cycle(msg) => write!(f, "dependency cycle: {msg}"),
            GraphError::BusyRead => write!(f, "object is being read"),
            GraphError::BusyWrite => write!(f, "object is being written"),
            GraphError::InUse => write!(f, "object has an active writer"),
            GraphError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            GraphError::Remote { kind, message } => write!(f, "remote error ({kind}): {message}"),
            GraphError::Mount(msg) => write!(f, "mount error: {msg}"),
            GraphError::Device(msg) => write!(f, "device error: {msg}"),
            GraphError::Loop(msg) => write!(f, "loop device error: {msg}"),
            GraphError::StageFailed { stage, returncode } => {
                write!(f, "stage '{stage}' failed with code {returncode}")
            }
            GraphError::Timeout { stage, secs } => {
                write!(f, "stage '{stage}' timed out after {secs}s")
            }
            GraphError::Cancelled => write!(f, "build cancelled"),
            GraphError::ReadOnly => write!(f, "object is already published and cannot be written"),
        }
    }
}

impl std::error::Error for GraphError {}
