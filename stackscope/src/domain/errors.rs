//! Structured error types for stackscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! One enum per failure domain; the recovery policy lives at the call sites
//! (an unreadable frame becomes the INVALID sentinel, a failed task read
//! skips that task, and so on). Nothing here is retried.

use super::types::{StringKey, VmAddr};
use thiserror::Error;

/// Failures of the fault-tolerant memory readers.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("read of {len} bytes at {addr} faulted")]
    ReadFault { addr: VmAddr, len: usize },

    #[error("refusing read below the first page ({addr})")]
    ZeroPage { addr: VmAddr },

    #[error("source range at {addr} overlaps the destination buffer")]
    Overlap { addr: VmAddr },

    #[error("no safe-copy strategy is available")]
    Unavailable,
}

/// Failures while materialising a single frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("frame executable is not a code object")]
    NotCode,

    #[error("no callable name could be recovered")]
    NoName,

    #[error(transparent)]
    String(#[from] StringError),
}

/// Failures while resolving a string-table key.
#[derive(Error, Debug)]
pub enum StringError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("string payload is not valid utf-8")]
    Utf8,

    #[error("string object of {0} bytes exceeds the copy bound")]
    Oversized(usize),

    #[error("key {0:?} is not registered")]
    Unregistered(StringKey),
}

/// Failures while materialising one coroutine node.
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("object is not a coroutine or generator")]
    NotCoroutine,

    #[error("coroutine chain exceeds the recursion limit")]
    DepthExceeded,
}

/// Failures while materialising a task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("task coroutine could not be read: {0}")]
    Generator(#[from] GeneratorError),

    #[error("task name could not be resolved: {0}")]
    Name(#[from] StringError),

    #[error("waiter chain exceeds the recursion limit")]
    DepthExceeded,

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// Failures while mirroring a runtime container.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("container storage of {0} bytes exceeds the mirror bound")]
    Oversized(usize),
}

/// Failures while reconstructing a value-stack chunk.
#[derive(Error, Debug)]
pub enum StackChunkError {
    #[error(transparent)]
    Read(#[from] VmError),

    #[error("chunk header is malformed")]
    Malformed,
}

/// Invalid configuration or control-surface misuse. Configuration calls
/// that fail leave global state untouched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid vm read mode {0} (expected 0, 1 or 2)")]
    InvalidVmReadMode(i32),

    #[error("sampling interval must be non-zero")]
    ZeroInterval,

    #[error("max_frames must be non-zero")]
    ZeroMaxFrames,

    #[error("runtime version {major}.{minor} is not supported")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("profiler has not been initialised")]
    NotInitialised,

    #[error("profiler is already running")]
    AlreadyRunning,

    #[error("failed to initialise the safe reader: {0}")]
    Vm(#[from] VmError),

    #[error("output channel unavailable: {0}")]
    Output(String),
}

/// Failures while decoding a binary event stream.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("stream does not start with the MOJ magic")]
    BadMagic,

    #[error("unsupported stream version {0}")]
    Version(i64),

    #[error("unknown event type {0:#x}")]
    UnknownEvent(u8),

    #[error("stream truncated inside an event")]
    Truncated,

    #[error("string payload is not valid utf-8")]
    Utf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fault_display() {
        let err = VmError::ReadFault { addr: VmAddr(0x8), len: 16 };
        assert_eq!(err.to_string(), "read of 16 bytes at 0x8 faulted");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UnsupportedVersion { major: 3, minor: 7 };
        assert!(err.to_string().contains("3.7"));
        assert_eq!(
            ConfigError::InvalidVmReadMode(5).to_string(),
            "invalid vm read mode 5 (expected 0, 1 or 2)"
        );
    }

    #[test]
    fn test_error_chaining() {
        let vm = VmError::ZeroPage { addr: VmAddr(4) };
        let frame: FrameError = vm.into();
        assert!(frame.to_string().contains("first page"));
    }
}
