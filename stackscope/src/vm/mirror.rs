//! Mirror reads: bounce the source range off a file the kernel validates.
//!
//! `pwritev` with the source range as the input vector makes the kernel
//! walk the pages on our behalf; an unmapped source turns into `EFAULT`
//! instead of a crash. The bytes land in an unlinked temporary file mapped
//! shared, and are copied back out of the mapping. Slow, but works where
//! both `process_vm_readv` and signal juggling are off the table.

#![allow(unsafe_code)]

use std::fs::File;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::domain::{VmAddr, VmError};

const CANDIDATE_DIRS: [&str; 3] = ["/dev/shm", "/tmp", "/var/tmp"];

// The buffer never shrinks below this.
const LOWER_BOUND: usize = 1 << 20;

struct Inner {
    file: File,
    map: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned by this Inner alone and only touched under
// the MirrorReader mutex.
unsafe impl Send for Inner {}

pub struct MirrorReader {
    inner: Mutex<Inner>,
}

impl MirrorReader {
    /// Create the backing file and its mapping.
    ///
    /// # Errors
    /// [`VmError::Unavailable`] when no candidate directory yields a usable
    /// mapping.
    pub fn create() -> Result<Self, VmError> {
        for dir in CANDIDATE_DIRS {
            let Ok(file) = tempfile::tempfile_in(dir) else { continue };
            if file.set_len(LOWER_BOUND as u64).is_err() {
                continue;
            }
            // SAFETY: fd is valid for the lifetime of file; a shared
            // mapping reflects later pwritev updates.
            let map = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    LOWER_BOUND,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                continue;
            }
            let Some(map) = NonNull::new(map.cast::<u8>()) else { continue };
            log::debug!("mirror reader backed by a file in {dir}");
            return Ok(Self { inner: Mutex::new(Inner { file, map, len: LOWER_BOUND }) });
        }
        Err(VmError::Unavailable)
    }

    /// # Errors
    /// [`VmError::ReadFault`] when the kernel rejects the source range.
    pub fn copy(&self, src: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if dst.len() > inner.len {
            inner.grow(dst.len())?;
        }

        let iov = libc::iovec { iov_base: src.0 as *mut libc::c_void, iov_len: dst.len() };
        // SAFETY: the iovec describes the remote range; the kernel checks
        // readability and writes into our file at offset zero.
        let written = unsafe { libc::pwritev(inner.file.as_raw_fd(), &iov, 1, 0) };
        if written != dst.len() as isize {
            return Err(VmError::ReadFault { addr: src, len: dst.len() });
        }

        // SAFETY: the shared mapping covers at least dst.len() bytes and
        // reflects the write above.
        unsafe {
            std::ptr::copy_nonoverlapping(inner.map.as_ptr(), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

impl Inner {
    /// Grow the file and remap. The buffer only ever grows.
    fn grow(&mut self, needed: usize) -> Result<(), VmError> {
        let new_len = needed.max(LOWER_BOUND).next_power_of_two();
        self.file
            .set_len(new_len as u64)
            .map_err(|_| VmError::Unavailable)?;
        // SAFETY: old mapping was created by us with the old length.
        let remapped = unsafe {
            libc::mremap(
                self.map.as_ptr().cast(),
                self.len,
                new_len,
                libc::MREMAP_MAYMOVE,
            )
        };
        if remapped == libc::MAP_FAILED {
            return Err(VmError::Unavailable);
        }
        self.map = NonNull::new(remapped.cast::<u8>()).ok_or(VmError::Unavailable)?;
        self.len = new_len;
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: map/len describe a mapping we own.
        unsafe {
            libc::munmap(self.map.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let reader = MirrorReader::create().expect("mirror reader");
        let data: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let mut out = vec![0u8; data.len()];
        reader.copy(VmAddr(data.as_ptr() as usize), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_growth_beyond_lower_bound() {
        let reader = MirrorReader::create().expect("mirror reader");
        let data = vec![0xabu8; LOWER_BOUND + 4096];
        let mut out = vec![0u8; data.len()];
        reader.copy(VmAddr(data.as_ptr() as usize), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_bad_range_reports_fault() {
        let reader = MirrorReader::create().expect("mirror reader");
        // SAFETY: map then unmap a page to obtain a known-bad address.
        let bad = unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED);
            libc::munmap(p, 4096);
            p as usize
        };
        let mut buf = [0u8; 32];
        let err = reader.copy(VmAddr(bad), &mut buf).unwrap_err();
        assert!(matches!(err, VmError::ReadFault { .. }));
    }
}
