//! Allocation tracking: the allocator shim and its aggregation tables.
//!
//! The host swaps the runtime's allocator vtables for the shims below.
//! Each successful allocation is attributed to the calling thread's managed
//! stack via the in-thread unwinder (the calling thread owns the structures
//! being read, so no fault guard is needed on that path); frees consume the
//! record and reduce the per-stack total. The runtime's execution lock is
//! held around allocations, which serialises this path with itself.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::Mutex;

use crate::domain::{InterpreterId, Pid, StackKey};
use crate::render::Renderer;
use crate::stacks::StackTable;
use crate::strings::StringTable;

/// The runtime installs allocators across this many memory domains.
pub const ALLOC_DOMAIN_COUNT: usize = 3;

/// C-ABI allocator vtable, matching the runtime's hook structure.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AllocatorVTable {
    pub ctx: *mut c_void,
    pub malloc: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
    pub calloc: Option<unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void>,
    pub realloc: Option<unsafe extern "C" fn(*mut c_void, *mut c_void, usize) -> *mut c_void>,
    pub free: Option<unsafe extern "C" fn(*mut c_void, *mut c_void)>,
}

impl AllocatorVTable {
    const EMPTY: AllocatorVTable =
        AllocatorVTable { ctx: std::ptr::null_mut(), malloc: None, calloc: None, realloc: None, free: None };
}

struct Originals(UnsafeCell<[AllocatorVTable; ALLOC_DOMAIN_COUNT]>);

// SAFETY: written only by install/restore, which the host calls with the
// runtime's execution lock held; the shims read the slots afterwards.
unsafe impl Sync for Originals {}

static ORIGINALS: Originals = Originals(UnsafeCell::new([AllocatorVTable::EMPTY; ALLOC_DOMAIN_COUNT]));

/// Swap the given allocator domains for the tracking shims, saving the
/// originals for pass-through and for [`restore_allocators`].
pub fn install_allocators(domains: &mut [AllocatorVTable]) {
    // SAFETY: see Originals; slot i is only aliased by shims that run
    // after this write completes.
    let originals = unsafe { &mut *ORIGINALS.0.get() };
    for (i, domain) in domains.iter_mut().enumerate().take(ALLOC_DOMAIN_COUNT) {
        originals[i] = *domain;
        *domain = AllocatorVTable {
            ctx: std::ptr::addr_of_mut!(originals[i]).cast(),
            malloc: Some(shim_malloc),
            calloc: Some(shim_calloc),
            realloc: Some(shim_realloc),
            free: Some(shim_free),
        };
    }
}

/// Put the saved allocators back.
pub fn restore_allocators(domains: &mut [AllocatorVTable]) {
    // SAFETY: see Originals.
    let originals = unsafe { &*ORIGINALS.0.get() };
    for (i, domain) in domains.iter_mut().enumerate().take(ALLOC_DOMAIN_COUNT) {
        *domain = originals[i];
    }
}

unsafe extern "C" fn shim_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let original = &*ctx.cast::<AllocatorVTable>();
    let Some(malloc) = original.malloc else { return std::ptr::null_mut() };
    let address = malloc(original.ctx, size);
    if !address.is_null() {
        on_alloc(address as usize, size);
    }
    address
}

unsafe extern "C" fn shim_calloc(ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    let original = &*ctx.cast::<AllocatorVTable>();
    let Some(calloc) = original.calloc else { return std::ptr::null_mut() };
    let address = calloc(original.ctx, nelem, elsize);
    if !address.is_null() {
        on_alloc(address as usize, nelem.saturating_mul(elsize));
    }
    address
}

unsafe extern "C" fn shim_realloc(ctx: *mut c_void, ptr: *mut c_void, size: usize) -> *mut c_void {
    let original = &*ctx.cast::<AllocatorVTable>();
    let Some(realloc) = original.realloc else { return std::ptr::null_mut() };
    // Model as a free of the old address followed by a fresh allocation.
    if !ptr.is_null() {
        on_free(ptr as usize);
    }
    let address = realloc(original.ctx, ptr, size);
    if !address.is_null() {
        on_alloc(address as usize, size);
    }
    address
}

unsafe extern "C" fn shim_free(ctx: *mut c_void, ptr: *mut c_void) {
    let original = &*ctx.cast::<AllocatorVTable>();
    if !ptr.is_null() {
        on_free(ptr as usize);
    }
    if let Some(free) = original.free {
        free(original.ctx, ptr);
    }
}

fn on_alloc(address: usize, size: usize) {
    if let Some(profiler) = crate::sampler::try_profiler() {
        profiler.record_allocation(address, size);
    }
}

fn on_free(address: usize) {
    if let Some(profiler) = crate::sampler::try_profiler() {
        profiler.record_free(address);
    }
}

/// Live allocation records: address → (stack, size).
#[derive(Default)]
pub struct AllocationTable {
    map: Mutex<HashMap<usize, AllocationRecord>>,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    pub stack: StackKey,
    pub size: usize,
}

impl AllocationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, address: usize, stack: StackKey, size: usize) {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(address, AllocationRecord { stack, size });
    }

    pub fn unlink(&self, address: usize) -> Option<AllocationRecord> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&address)
    }

    pub fn clear(&self) {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregated allocation counters for one stack.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub iid: InterpreterId,
    pub thread_name: String,
    pub stack: StackKey,
    pub count: u64,
    pub size: i64,
}

/// Per-stack allocation totals for the current reporting window.
#[derive(Default)]
pub struct StackStats {
    map: Mutex<HashMap<u64, MemoryStats>>,
}

impl StackStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_alloc(&self, iid: InterpreterId, thread_name: &str, stack: StackKey, size: usize) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match map.get_mut(&stack.0) {
            Some(stats) => {
                stats.count += 1;
                stats.size += i64::try_from(size).unwrap_or(i64::MAX);
            }
            None => {
                map.insert(
                    stack.0,
                    MemoryStats {
                        iid,
                        thread_name: thread_name.to_owned(),
                        stack,
                        count: 1,
                        size: i64::try_from(size).unwrap_or(i64::MAX),
                    },
                );
            }
        }
    }

    pub fn update_free(&self, record: &AllocationRecord) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(stats) = map.get_mut(&record.stack.0) {
            stats.size -= i64::try_from(record.size).unwrap_or(0);
        }
    }

    /// Emit every non-trivial entry and reset the window counters.
    ///
    /// # Errors
    /// I/O failure on the renderer.
    pub fn flush(
        &self,
        renderer: &mut Renderer,
        stacks: &StackTable,
        strings: &StringTable,
        pid: Pid,
    ) -> std::io::Result<()> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for stats in map.values_mut() {
            if stats.size != 0 {
                if let Some(frames) = stacks.retrieve(stats.stack) {
                    renderer.stack_begin(i64::from(pid.0), stats.iid.0, &stats.thread_name)?;
                    renderer.render_frames(&frames, strings)?;
                    renderer.metric_memory(stats.size)?;
                }
            }
            stats.size = 0;
            stats.count = 0;
        }
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<MemoryStats> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }
}

/// Detects growth of the process's resident set between ticks.
pub struct RssTracker {
    size: i64,
}

impl RssTracker {
    #[must_use]
    pub fn new() -> Self {
        let mut tracker = Self { size: 0 };
        tracker.update();
        tracker
    }

    /// Refresh the reading; true when it moved since the last check.
    pub fn check(&mut self) -> bool {
        let old = self.size;
        self.update();
        self.size != old
    }

    fn update(&mut self) {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: usage is a valid out-pointer.
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } == 0 {
            self.size = usage.ru_maxrss;
        }
    }
}

impl Default for RssTracker {
    fn default() -> Self {
        Self::new()
    }
}
