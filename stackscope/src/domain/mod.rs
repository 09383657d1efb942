//! Domain model for stackscope
//!
//! Core newtypes and structured errors shared by every subsystem:
//! - Compile-time safety via the newtype pattern
//! - Self-documenting signatures for addresses and interning keys
//! - One error enum per failure domain

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{FrameKey, InterpreterId, Microseconds, Pid, StackKey, StringKey, Tid, VmAddr};

pub use errors::{
    ConfigError, DecodeError, FrameError, GeneratorError, MirrorError, StackChunkError,
    StringError, TaskError, VmError,
};
