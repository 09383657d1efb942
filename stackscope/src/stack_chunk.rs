//! Local mirror of a thread's value-stack chunks.
//!
//! On runtimes that allocate interpreter frames inside chunked value
//! stacks, a frame pointer captured from a running thread may point into a
//! chunk that is recycled before we finish reading it. Copying the chunks
//! once per sample and resolving frame addresses against the copy makes
//! the subsequent frame reads self-consistent.

use crate::domain::{StackChunkError, VmAddr};
use crate::runtime::abi::Abi;
use crate::vm::Mem;

// Chunks larger than this are assumed to be torn headers.
const MAX_CHUNK_SIZE: usize = 1 << 20;

#[derive(Default)]
pub struct StackChunk {
    origin: VmAddr,
    size: usize,
    data: Vec<u8>,
    previous: Option<Box<StackChunk>>,
}

impl StackChunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-mirror the chunk list rooted at `chunk_addr`.
    ///
    /// # Errors
    /// Read faults or a malformed header; the caller drops the mirror and
    /// unwinds against live memory (fallback without address resolution).
    pub fn update(&mut self, mem: Mem, abi: &Abi, chunk_addr: VmAddr) -> Result<(), StackChunkError> {
        let size = mem.read_usize(chunk_addr.offset(abi.chunk_size))?;
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(StackChunkError::Malformed);
        }

        self.origin = chunk_addr;
        self.size = size;
        self.data.resize(size.max(self.data.len()), 0);
        mem.read_into(chunk_addr, &mut self.data[..size])?;

        let previous_addr = mem.read_addr(chunk_addr.offset(abi.chunk_previous))?;
        if previous_addr.is_null() {
            self.previous = None;
        } else {
            let mut previous = self.previous.take().unwrap_or_default();
            match previous.update(mem, abi, previous_addr) {
                Ok(()) => self.previous = Some(previous),
                Err(_) => self.previous = None,
            }
        }

        Ok(())
    }

    /// Translate a frame address into this mirror when it falls inside one
    /// of the copied chunks; addresses outside come back unchanged.
    #[must_use]
    pub fn resolve(&self, address: VmAddr) -> VmAddr {
        if !self.is_valid() {
            return address;
        }
        if address.0 >= self.origin.0 && address.0 < self.origin.0 + self.size {
            return VmAddr(self.data.as_ptr() as usize + (address.0 - self.origin.0));
        }
        if let Some(previous) = &self.previous {
            return previous.resolve(address);
        }
        address
    }

    fn is_valid(&self) -> bool {
        !self.origin.is_null() && self.size > 0 && self.data.len() >= self.size
    }
}
