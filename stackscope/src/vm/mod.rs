//! Fault-tolerant reads of runtime memory.
//!
//! The sampler walks linked structures owned by threads it has not stopped,
//! so every pointer it follows may be stale, torn, or point into an
//! unmapped page. All such reads go through a [`VmReader`], which copies
//! bytes into a local buffer and reports a fault instead of crashing.
//!
//! Three strategies, selected at initialisation (`vm_read_mode`):
//!
//! 1. **Kernel** (mode 1, preferred): `process_vm_readv` against our own
//!    pid. The kernel validates the source range, so an unmapped page turns
//!    into `EFAULT`.
//! 2. **Trampoline** (mode 2): a process-wide `SIGSEGV`/`SIGBUS` handler
//!    that long-jumps back to an armed landing site; the copy proceeds in
//!    page-bounded chunks so one bad page costs one fault.
//! 3. **Mirror** (mode 0): `pwritev` of the source range into an unlinked
//!    temporary file, read back through a shared mapping. The kernel again
//!    does the validation, on the write side.
//!
//! Requesting a higher mode falls back to the mirror strategy when the
//! preferred one is unavailable (seccomp filters commonly deny
//! `process_vm_readv`).

#![allow(unsafe_code)]

pub mod mirror;
pub mod page_cache;
pub mod trampoline;

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use crate::domain::{VmAddr, VmError};

pub const PAGE_SIZE: usize = 4096;

/// Environment variable that, when truthy, skips the kernel-primitive probe.
pub const ALT_VM_READ_FORCE_VAR: &str = "ECHION_ALT_VM_READ_FORCE";

const TRUTHY: [&str; 6] = ["1", "true", "yes", "on", "enable", "enabled"];

/// Strategy selector, as exposed on the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmReadMode {
    Mirror = 0,
    Kernel = 1,
    Trampoline = 2,
}

impl TryFrom<i32> for VmReadMode {
    type Error = crate::domain::ConfigError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(VmReadMode::Mirror),
            1 => Ok(VmReadMode::Kernel),
            2 => Ok(VmReadMode::Trampoline),
            other => Err(crate::domain::ConfigError::InvalidVmReadMode(other)),
        }
    }
}

/// A fault-tolerant reader. One `copy` operation, three strategies.
pub enum VmReader {
    Kernel,
    Trampoline(trampoline::SegvCatcher),
    Mirror(mirror::MirrorReader),
}

impl VmReader {
    /// Initialise the requested strategy, falling back to the mirror reader
    /// when it is unavailable. Returns the reader and the mode actually in
    /// effect.
    pub fn init(mode: VmReadMode) -> Result<(Self, VmReadMode), VmError> {
        match mode {
            VmReadMode::Kernel => {
                if kernel_probe() {
                    return Ok((VmReader::Kernel, VmReadMode::Kernel));
                }
                log::warn!("process_vm_readv unavailable, falling back to the mirror reader");
                Self::mirror_fallback()
            }
            VmReadMode::Trampoline => match trampoline::SegvCatcher::install() {
                Ok(catcher) => Ok((VmReader::Trampoline(catcher), VmReadMode::Trampoline)),
                Err(e) => {
                    log::warn!("trampoline reader unavailable ({e}), falling back to the mirror");
                    Self::mirror_fallback()
                }
            },
            VmReadMode::Mirror => Self::mirror_fallback(),
        }
    }

    fn mirror_fallback() -> Result<(Self, VmReadMode), VmError> {
        let reader = mirror::MirrorReader::create()?;
        Ok((VmReader::Mirror(reader), VmReadMode::Mirror))
    }

    /// Copy `dst.len()` bytes from `src` into `dst`.
    ///
    /// Zero-length reads succeed trivially. Addresses below the first page
    /// are refused outright. A source range overlapping the destination
    /// buffer is refused (the chunked strategies would observe their own
    /// partial writes).
    ///
    /// # Errors
    /// [`VmError::ReadFault`] when any byte of the source range cannot be
    /// read; `dst` may then be partially written and must not be used.
    pub fn copy(&self, src: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
        if dst.is_empty() {
            return Ok(());
        }
        if src.0 < PAGE_SIZE {
            return Err(VmError::ZeroPage { addr: src });
        }
        let dst_range = dst.as_ptr() as usize..dst.as_ptr() as usize + dst.len();
        let src_range = src.0..src.0.wrapping_add(dst.len());
        if src_range.start < dst_range.end && dst_range.start < src_range.end {
            return Err(VmError::Overlap { addr: src });
        }

        match self {
            VmReader::Kernel => kernel_copy(src, dst),
            VmReader::Trampoline(catcher) => catcher.copy(src, dst),
            VmReader::Mirror(reader) => reader.copy(src, dst),
        }
    }
}

// The installed reader. Replaced wholesale when the read mode changes; the
// previous reader is intentionally leaked because the signal path may still
// hold a reference to it.
static READER: AtomicPtr<VmReader> = AtomicPtr::new(std::ptr::null_mut());

static PAGE_CACHE: Mutex<Option<page_cache::PageCache>> = Mutex::new(None);

// The cache only runs while the sampler does: cached pages must not outlive
// the tick cadence that bounds their staleness.
static PAGE_CACHE_ENABLED: std::sync::atomic::AtomicBool =
    std::sync::atomic::AtomicBool::new(false);

/// Install the reader for the requested mode. Returns the effective mode.
///
/// # Errors
/// Fails only when no strategy at all could be initialised; the profiler
/// cannot start in that state.
pub fn init(mode: VmReadMode) -> Result<VmReadMode, VmError> {
    let (reader, effective) = VmReader::init(mode)?;
    READER.store(Box::into_raw(Box::new(reader)), Ordering::Release);
    if let Ok(mut cache) = PAGE_CACHE.lock() {
        cache.get_or_insert_with(page_cache::PageCache::new).clear();
    }
    Ok(effective)
}

fn reader() -> Result<&'static VmReader, VmError> {
    // SAFETY: the pointer is either null or a leaked Box published with
    // Release ordering; leaked readers are never freed.
    unsafe { READER.load(Ordering::Acquire).as_ref() }.ok_or(VmError::Unavailable)
}

/// Read through the page cache when the request fits inside one page.
///
/// Large or page-crossing reads bypass the cache, as does any read while
/// another thread holds the cache lock.
///
/// # Errors
/// See [`VmReader::copy`].
pub fn read_into(addr: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
    let reader = reader()?;
    if PAGE_CACHE_ENABLED.load(Ordering::Acquire)
        && !dst.is_empty()
        && dst.len() <= PAGE_SIZE
        && page_cache::page_offset(addr.0) + dst.len() <= PAGE_SIZE
    {
        if let Ok(mut guard) = PAGE_CACHE.try_lock() {
            if let Some(cache) = guard.as_mut() {
                return cache.read(addr, dst, |page_addr, buf| reader.copy(page_addr, buf));
            }
        }
    }
    reader.copy(addr, dst)
}

/// Read without consulting the page cache. Allocation-free; the only path
/// the profile-signal handler is allowed to use.
///
/// # Errors
/// See [`VmReader::copy`].
pub fn read_into_raw(addr: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
    reader()?.copy(addr, dst)
}

/// Turn the page-cache accelerator on or off. The sampler enables it for
/// the duration of a run; turning it off also drops every cached page.
pub fn enable_page_cache(enabled: bool) {
    PAGE_CACHE_ENABLED.store(enabled, Ordering::Release);
    if !enabled {
        clear_page_cache();
    }
}

/// Drop every cached page. Called on stop and after a fork.
pub fn clear_page_cache() {
    if let Ok(mut guard) = PAGE_CACHE.lock() {
        if let Some(cache) = guard.as_mut() {
            cache.clear();
        }
    }
}

/// Which read discipline a walk uses.
///
/// `Safe` is the fault-tolerant reader above. `Direct` is a plain in-process
/// copy for structures the calling thread owns, as on the allocation path
/// where the walk happens inline in the allocating thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    Safe,
    Direct,
}

impl Mem {
    /// # Errors
    /// See [`VmReader::copy`]; direct reads only refuse the zero page.
    pub fn read_into(self, addr: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
        match self {
            Mem::Safe => read_into(addr, dst),
            Mem::Direct => {
                if dst.is_empty() {
                    return Ok(());
                }
                if addr.0 < PAGE_SIZE {
                    return Err(VmError::ZeroPage { addr });
                }
                // SAFETY: the caller vouches that the source belongs to the
                // current thread and stays alive for the duration of the
                // copy; ranges were checked non-overlapping by construction
                // (dst is a fresh local buffer).
                unsafe {
                    std::ptr::copy_nonoverlapping(addr.0 as *const u8, dst.as_mut_ptr(), dst.len());
                }
                Ok(())
            }
        }
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_usize(self, addr: VmAddr) -> Result<usize, VmError> {
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        self.read_into(addr, &mut buf)?;
        Ok(usize::from_ne_bytes(buf))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_addr(self, addr: VmAddr) -> Result<VmAddr, VmError> {
        Ok(VmAddr(self.read_usize(addr)?))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_u64(self, addr: VmAddr) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_i64(self, addr: VmAddr) -> Result<i64, VmError> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(i64::from_ne_bytes(buf))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_u32(self, addr: VmAddr) -> Result<u32, VmError> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_i32(self, addr: VmAddr) -> Result<i32, VmError> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_u8(self, addr: VmAddr) -> Result<u8, VmError> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_i8(self, addr: VmAddr) -> Result<i8, VmError> {
        #[allow(clippy::cast_possible_wrap)]
        Ok(self.read_u8(addr)? as i8)
    }

    /// # Errors
    /// See [`Mem::read_into`].
    pub fn read_bytes(self, addr: VmAddr, len: usize) -> Result<Vec<u8>, VmError> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Read a NUL-terminated C string of at most `max` bytes.
    ///
    /// Copies in page-bounded chunks so a string that ends near an unmapped
    /// page does not fault spuriously.
    ///
    /// # Errors
    /// Faults if the first chunk is unreadable; a missing terminator within
    /// `max` bytes yields the truncated prefix.
    pub fn read_c_str(self, addr: VmAddr, max: usize) -> Result<String, VmError> {
        let mut out: Vec<u8> = Vec::with_capacity(max.min(256));
        let mut cursor = addr;
        let mut remaining = max;
        while remaining > 0 {
            let to_page = PAGE_SIZE - page_cache::page_offset(cursor.0);
            let chunk_len = remaining.min(to_page).min(256);
            let mut chunk = [0u8; 256];
            if self.read_into(cursor, &mut chunk[..chunk_len]).is_err() {
                if out.is_empty() {
                    return Err(VmError::ReadFault { addr, len: max });
                }
                break;
            }
            if let Some(nul) = chunk[..chunk_len].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..chunk_len]);
            cursor = cursor.offset(chunk_len);
            remaining -= chunk_len;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Probe `process_vm_readv` with a self-read, honouring the environment
/// override that forces the alternative strategies.
fn kernel_probe() -> bool {
    if let Ok(force) = std::env::var(ALT_VM_READ_FORCE_VAR) {
        if TRUTHY.contains(&force.to_ascii_lowercase().as_str()) {
            return false;
        }
    }
    let src = [0x41u8; 128];
    let mut dst = [0u8; 128];
    kernel_copy(VmAddr(src.as_ptr() as usize), &mut dst).is_ok() && dst == src
}

fn kernel_copy(src: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
    let local = libc::iovec { iov_base: dst.as_mut_ptr().cast(), iov_len: dst.len() };
    let remote = libc::iovec { iov_base: src.0 as *mut libc::c_void, iov_len: dst.len() };
    // SAFETY: both iovecs describe valid lengths; the local one points into
    // dst, and the kernel validates the remote one.
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if copied == dst.len() as isize {
        Ok(())
    } else {
        Err(VmError::ReadFault { addr: src, len: dst.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_kernel() {
        init(VmReadMode::Kernel).expect("reader init");
    }

    #[test]
    fn test_zero_page_refused() {
        init_kernel();
        let mut buf = [0u8; 8];
        for addr in [0usize, 8, 4095] {
            let err = read_into(VmAddr(addr), &mut buf).unwrap_err();
            assert!(matches!(err, VmError::ZeroPage { .. }), "addr {addr:#x}: {err}");
        }
    }

    #[test]
    fn test_self_read_round_trip() {
        init_kernel();
        let data: Vec<u8> = (0..=255).collect();
        let mut out = vec![0u8; data.len()];
        read_into(VmAddr(data.as_ptr() as usize), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_zero_length_read_succeeds() {
        init_kernel();
        let mut buf = [0u8; 0];
        // Even a bad address is fine for an empty read.
        read_into(VmAddr(0x10), &mut buf).unwrap();
    }

    #[test]
    fn test_overlap_refused() {
        init_kernel();
        let mut buf = [0u8; 16];
        let addr = VmAddr(buf.as_ptr() as usize);
        let err = reader().unwrap().copy(addr, &mut buf).unwrap_err();
        assert!(matches!(err, VmError::Overlap { .. }));
    }

    #[test]
    fn test_read_c_str() {
        init_kernel();
        let s = b"frame_eval\0garbage";
        let got = Mem::Safe.read_c_str(VmAddr(s.as_ptr() as usize), 64).unwrap();
        assert_eq!(got, "frame_eval");
    }

    #[test]
    fn test_direct_reads() {
        let value = 0xdead_beef_u32;
        let addr = VmAddr(std::ptr::addr_of!(value) as usize);
        assert_eq!(Mem::Direct.read_u32(addr).unwrap(), 0xdead_beef);
        assert!(Mem::Direct.read_u32(VmAddr(8)).is_err());
    }
}
