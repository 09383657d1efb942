//! Newtypes for the identifiers that flow through the profiler.
//!
//! Raw `usize`/`u64` values are easy to mix up when a function takes a
//! process id, a thread id, an interning key and an address in the same
//! signature. Each identity gets its own type instead.

use std::fmt;

/// Microsecond count, as produced by the monotonic clock.
pub type Microseconds = u64;

/// Operating-system process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Operating-system thread id (`gettid`), not a pthread handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Identifier of one interpreter inside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpreterId(pub i64);

/// An address inside the runtime's memory.
///
/// Values of this type are never dereferenced directly; every access goes
/// through the fault-tolerant readers in [`crate::vm`]. The pointee may be
/// unmapped, torn, or freed at any moment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmAddr(pub usize);

impl VmAddr {
    pub const NULL: VmAddr = VmAddr(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address advanced by `n` bytes.
    #[must_use]
    pub fn offset(self, n: usize) -> VmAddr {
        VmAddr(self.0.wrapping_add(n))
    }
}

impl fmt::Display for VmAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VmAddr {
    fn from(v: usize) -> Self {
        VmAddr(v)
    }
}

/// Interning key into the string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringKey(pub u64);

/// Identity of a resolved frame in the frame cache and the output stream.
///
/// Key `0` is reserved for the invalid-frame sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey(pub u64);

impl FrameKey {
    pub const INVALID: FrameKey = FrameKey(0);

    #[must_use]
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

/// Identity of an interned frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackKey(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
    }

    #[test]
    fn test_vm_addr_offset_and_null() {
        let a = VmAddr(0x1000);
        assert_eq!(a.offset(8), VmAddr(0x1008));
        assert!(VmAddr::NULL.is_null());
        assert!(!a.is_null());
        assert_eq!(a.to_string(), "0x1000");
    }

    #[test]
    fn test_invalid_frame_key() {
        assert!(FrameKey::INVALID.is_invalid());
        assert!(!FrameKey(1).is_invalid());
    }
}
