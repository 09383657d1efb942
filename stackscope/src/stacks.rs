//! Stack assembly: the managed-frame walk, the native/managed interleaver
//! and the whole-stack interning table.
//!
//! All frame sequences are leaf-first. The walk tolerates a thread mutating
//! its own stack mid-read: every access goes through the safe reader, a
//! failed read terminates the walk with the INVALID sentinel, and a seen-
//! set halts pointer cycles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cfunc;
use crate::domain::{FrameError, StackKey, VmAddr};
use crate::frame::{self, Frame, FrameCache};
use crate::runtime::abi::{Abi, EntryRule};
use crate::runtime;
use crate::stack_chunk::StackChunk;
use crate::strings::StringTable;
use crate::vm::{self, Mem};

/// A call stack, leaf first.
pub type FrameStack = Vec<Arc<Frame>>;

// Bound on consecutive non-code executables skipped in one hop.
const MAX_SHIM_HOPS: usize = 32;

/// Shared lookup context for the unwinders.
#[derive(Clone, Copy)]
pub struct UnwindContext<'a> {
    pub mem: Mem,
    pub abi: &'static Abi,
    pub strings: &'a StringTable,
    pub frames: &'a FrameCache,
    pub max_frames: usize,
}

/// Rolling rotate-xor hash over the member frame keys.
#[must_use]
pub fn stack_key(frames: &[Arc<Frame>]) -> StackKey {
    let mut hash: u64 = 0;
    for frame in frames {
        hash = hash.rotate_left(1) ^ frame.key.0;
    }
    StackKey(hash)
}

/// Interns whole frame sequences by their rolling hash.
///
/// Two distinct sequences can hash alike; `store` detects that by comparing
/// the member keys against the resident entry, keeps the first writer, and
/// counts the casualty.
pub struct StackTable {
    map: Mutex<HashMap<u64, FrameStack>>,
    collisions: AtomicU64,
}

impl StackTable {
    #[must_use]
    pub fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()), collisions: AtomicU64::new(0) }
    }

    pub fn store(&self, frames: &[Arc<Frame>]) -> StackKey {
        let key = stack_key(frames);
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match map.get(&key.0) {
            None => {
                map.insert(key.0, frames.to_vec());
            }
            Some(resident) => {
                let same = resident.len() == frames.len()
                    && resident.iter().zip(frames).all(|(a, b)| a.key == b.key);
                if !same {
                    let seen = self.collisions.fetch_add(1, Ordering::Relaxed) + 1;
                    log::debug!("stack key collision ({seen} so far), keeping first writer");
                }
            }
        }
        key
    }

    #[must_use]
    pub fn retrieve(&self, key: StackKey) -> Option<FrameStack> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key.0)
            .cloned()
    }

    pub fn clear(&self) {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }

    #[must_use]
    pub fn collision_count(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
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

impl Default for StackTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwind a thread's managed stack from its current frame pointer.
///
/// `chunk` is the thread's value-stack mirror; when present, frame
/// addresses are resolved against it before reading.
pub fn unwind_thread(
    ctx: UnwindContext<'_>,
    tstate: VmAddr,
    chunk: Option<&StackChunk>,
    out: &mut FrameStack,
) {
    match runtime::current_frame_addr(ctx.mem, ctx.abi, tstate) {
        Ok(first) => {
            unwind_frames(ctx, first, chunk, out);
        }
        Err(_) => out.push(frame::invalid_frame()),
    }
}

/// Walk a frame chain, appending resolved frames leaf-first.
///
/// Returns the number of frames appended. Stops at a null link, a repeated
/// frame address (cycle), `max_frames`, or the first unreadable frame; the
/// last two conditions append the INVALID sentinel.
pub fn unwind_frames(
    ctx: UnwindContext<'_>,
    first: VmAddr,
    chunk: Option<&StackChunk>,
    out: &mut FrameStack,
) -> usize {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut addr = first;
    let mut added = 0usize;
    let mut at_leaf = true;

    while !addr.is_null() && out.len() < ctx.max_frames {
        if !seen.insert(addr.0) {
            out.push(frame::invalid_frame());
            added += 1;
            break;
        }

        let readable = chunk.map_or(addr, |c| c.resolve(addr));
        match read_one_frame(ctx, readable, at_leaf, out) {
            Ok((pushed, previous)) => {
                added += pushed;
                addr = previous;
            }
            Err(_) => {
                out.push(frame::invalid_frame());
                added += 1;
                break;
            }
        }
        at_leaf = false;
    }

    added
}

/// Read one frame record, pushing the frames it contributes (usually one;
/// a leaf trampoline can also contribute an inferred callable frame).
/// Returns the count pushed and the previous-frame link.
fn read_one_frame(
    ctx: UnwindContext<'_>,
    addr: VmAddr,
    at_leaf: bool,
    out: &mut FrameStack,
) -> Result<(usize, VmAddr), FrameError> {
    let abi = ctx.abi;
    let mut frame_addr = addr;
    let mut executable = ctx.mem.read_addr(frame_addr.offset(abi.frame_executable))?;
    let mut pushed = 0usize;

    if abi.non_code_executables {
        // Newer runtimes park non-code callables in the executable slot of
        // internal frames; skip to the next genuine code frame. At the
        // leaf, try to name the callable first.
        let mut hops = 0;
        while !runtime::has_type_name(ctx.mem, abi, executable, abi.code_type_name) {
            if at_leaf && pushed == 0 {
                if let Ok(f) =
                    cfunc::cfunction_descriptor_frame(ctx.mem, abi, ctx.strings, ctx.frames, executable)
                {
                    out.push(f);
                    pushed += 1;
                }
            }
            frame_addr = ctx.mem.read_addr(frame_addr.offset(abi.frame_previous))?;
            if frame_addr.is_null() {
                return Err(FrameError::NotCode);
            }
            executable = ctx.mem.read_addr(frame_addr.offset(abi.frame_executable))?;
            hops += 1;
            if hops > MAX_SHIM_HOPS {
                return Err(FrameError::NotCode);
            }
        }

        // A leaf trampoline with an anonymous callable: reconstruct the
        // call target from the bytecode window of the caller.
        if at_leaf && pushed == 0 && frame_addr != addr {
            if let Ok(f) =
                cfunc::infer_cfunction_frame(ctx.mem, abi, ctx.strings, ctx.frames, frame_addr, executable)
            {
                out.push(f);
                pushed += 1;
            }
        }
    }

    let previous = ctx.mem.read_addr(frame_addr.offset(abi.frame_previous))?;
    let lasti = frame::frame_lasti(ctx.mem, abi, frame_addr, executable)?;
    let mut resolved =
        frame::resolve_code_frame(ctx.mem, abi, ctx.strings, ctx.frames, executable, lasti);

    let shim = entry_flag(ctx.mem, abi, frame_addr);
    if !resolved.key.is_invalid() && resolved.is_shim != shim {
        let mut adjusted = (*resolved).clone();
        adjusted.is_shim = shim;
        resolved = Arc::new(adjusted);
        ctx.frames.store(resolved.clone());
    }

    out.push(resolved);
    pushed += 1;
    Ok((pushed, previous))
}

fn entry_flag(mem: Mem, abi: &Abi, frame_addr: VmAddr) -> bool {
    match abi.frame_entry {
        EntryRule::None => false,
        EntryRule::Flag(offset) => mem.read_u8(frame_addr.offset(offset)).unwrap_or(0) != 0,
        EntryRule::OwnerTag { offset, shim } => {
            mem.read_u8(frame_addr.offset(offset)).map_or(false, |tag| tag == shim)
        }
    }
}

/// A frame reference captured inside the profile-signal handler, before
/// any resolution. `code == 0` marks the INVALID placeholder.
#[derive(Debug, Clone, Copy)]
pub struct RawFrameRef {
    pub frame: usize,
    pub code: usize,
    pub lasti: u32,
    pub shim: bool,
}

impl RawFrameRef {
    pub const EMPTY: RawFrameRef = RawFrameRef { frame: 0, code: 0, lasti: 0, shim: false };

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.code == 0
    }
}

/// Allocation-free managed walk for signal context.
///
/// Only raw (uncached) safe reads, fixed output storage, and a linear-scan
/// cycle check. Resolution happens later on the sampler thread.
pub fn capture_raw_frames(abi: &Abi, tstate: VmAddr, out: &mut [RawFrameRef]) -> usize {
    let mem_read_addr = |a: VmAddr| -> Result<VmAddr, crate::domain::VmError> {
        let mut buf = [0u8; 8];
        vm::read_into_raw(a, &mut buf)?;
        Ok(VmAddr(usize::from_ne_bytes(buf)))
    };

    let Ok(mut addr) = raw_current_frame(abi, tstate) else {
        if out.is_empty() {
            return 0;
        }
        out[0] = RawFrameRef::EMPTY;
        return 1;
    };

    let mut n = 0usize;
    while !addr.is_null() && n < out.len() {
        // Cycle check without a heap set: scan what we already captured.
        if out[..n].iter().any(|r| r.frame == addr.0) {
            out[n] = RawFrameRef::EMPTY;
            n += 1;
            break;
        }

        let Ok(executable) = mem_read_addr(addr.offset(abi.frame_executable)) else {
            out[n] = RawFrameRef::EMPTY;
            n += 1;
            break;
        };
        if abi.non_code_executables && !raw_type_name_is(abi, executable, abi.code_type_name) {
            // Skip trampolines in place; inference needs allocation and is
            // deferred to the direct unwind paths.
            let Ok(previous) = mem_read_addr(addr.offset(abi.frame_previous)) else {
                out[n] = RawFrameRef::EMPTY;
                n += 1;
                break;
            };
            addr = previous;
            continue;
        }

        let Ok(lasti) = raw_frame_lasti(abi, addr, executable) else {
            out[n] = RawFrameRef::EMPTY;
            n += 1;
            break;
        };
        let shim = raw_entry_flag(abi, addr);
        out[n] = RawFrameRef { frame: addr.0, code: executable.0, lasti, shim };
        n += 1;

        match mem_read_addr(addr.offset(abi.frame_previous)) {
            Ok(previous) => addr = previous,
            Err(_) => {
                if n < out.len() {
                    out[n] = RawFrameRef::EMPTY;
                    n += 1;
                }
                break;
            }
        }
    }
    n
}

/// Resolve a raw capture into frames, on the sampler thread.
pub fn resolve_raw_frames(ctx: UnwindContext<'_>, raw: &[RawFrameRef], out: &mut FrameStack) {
    for r in raw {
        if out.len() >= ctx.max_frames {
            break;
        }
        if r.is_invalid() {
            out.push(frame::invalid_frame());
            continue;
        }
        let mut resolved = frame::resolve_code_frame(
            ctx.mem,
            ctx.abi,
            ctx.strings,
            ctx.frames,
            VmAddr(r.code),
            r.lasti,
        );
        if !resolved.key.is_invalid() && resolved.is_shim != r.shim {
            let mut adjusted = (*resolved).clone();
            adjusted.is_shim = r.shim;
            resolved = Arc::new(adjusted);
            ctx.frames.store(resolved.clone());
        }
        out.push(resolved);
    }
}

fn raw_current_frame(abi: &Abi, tstate: VmAddr) -> Result<VmAddr, crate::domain::VmError> {
    use crate::runtime::abi::FrameRoot;
    let read = |a: VmAddr| -> Result<VmAddr, crate::domain::VmError> {
        let mut buf = [0u8; 8];
        vm::read_into_raw(a, &mut buf)?;
        Ok(VmAddr(usize::from_ne_bytes(buf)))
    };
    match abi.tstate_frame {
        FrameRoot::Direct(offset) => read(tstate.offset(offset)),
        FrameRoot::ViaControlFrame { cframe, current } => {
            let control = read(tstate.offset(cframe))?;
            if control.is_null() {
                return Ok(VmAddr::NULL);
            }
            read(control.offset(current))
        }
    }
}

fn raw_frame_lasti(abi: &Abi, frame_addr: VmAddr, code: VmAddr) -> Result<u32, crate::domain::VmError> {
    use crate::runtime::abi::{CodeBody, LastiRule};
    match abi.frame_lasti {
        LastiRule::Direct(offset) => {
            let mut buf = [0u8; 4];
            vm::read_into_raw(frame_addr.offset(offset), &mut buf)?;
            Ok(u32::try_from(i32::from_ne_bytes(buf)).unwrap_or(0))
        }
        LastiRule::FromInstrPtr { offset, adjust } => {
            let mut buf = [0u8; 8];
            vm::read_into_raw(frame_addr.offset(offset), &mut buf)?;
            let instr = usize::from_ne_bytes(buf);
            let base = match abi.code_body {
                CodeBody::Inline(body) => code.offset(body),
                CodeBody::Bytes(body) => {
                    vm::read_into_raw(code.offset(body), &mut buf)?;
                    VmAddr(usize::from_ne_bytes(buf)).offset(abi.bytes_data)
                }
            };
            if instr <= base.0 {
                return Ok(0);
            }
            Ok((((instr - base.0) / 2) as u32).saturating_sub(adjust))
        }
    }
}

fn raw_entry_flag(abi: &Abi, frame_addr: VmAddr) -> bool {
    let read_u8 = |a: VmAddr| -> Option<u8> {
        let mut buf = [0u8; 1];
        vm::read_into_raw(a, &mut buf).ok()?;
        Some(buf[0])
    };
    match abi.frame_entry {
        EntryRule::None => false,
        EntryRule::Flag(offset) => read_u8(frame_addr.offset(offset)).unwrap_or(0) != 0,
        EntryRule::OwnerTag { offset, shim } => read_u8(frame_addr.offset(offset)) == Some(shim),
    }
}

/// Allocation-free type-name comparison for signal context.
fn raw_type_name_is(abi: &Abi, obj: VmAddr, expected: &str) -> bool {
    let read_ptr = |a: VmAddr| -> Option<VmAddr> {
        let mut buf = [0u8; 8];
        vm::read_into_raw(a, &mut buf).ok()?;
        Some(VmAddr(usize::from_ne_bytes(buf)))
    };
    let Some(type_addr) = read_ptr(obj.offset(abi.ob_type)) else { return false };
    let Some(name_ptr) = read_ptr(type_addr.offset(abi.type_name)) else { return false };

    let mut buf = [0u8; 64];
    let to_page = crate::vm::PAGE_SIZE - crate::vm::page_cache::page_offset(name_ptr.0);
    let len = buf.len().min(to_page);
    if vm::read_into_raw(name_ptr, &mut buf[..len]).is_err() {
        return false;
    }
    let name = &buf[..len];
    let nul = name.iter().position(|&b| b == 0).unwrap_or(len);
    &name[..nul] == expected.as_bytes()
}

/// Merge a native and a managed stack into one chronological chain.
///
/// Both inputs and the result are leaf-first. Walking the native stack from
/// the root, every frame whose scope contains the evaluation-loop symbol is
/// replaced by one managed sub-chain (bounded by entry markers on runtimes
/// that have them, exactly one frame otherwise).
pub fn interleave(
    strings: &StringTable,
    abi: &Abi,
    managed: &[Arc<Frame>],
    native: &[Arc<Frame>],
) -> FrameStack {
    let has_entry_markers = !matches!(abi.frame_entry, EntryRule::None);
    let mut out: FrameStack = Vec::with_capacity(managed.len() + native.len());
    let mut m = managed.iter().rev().peekable(); // root-first

    for n in native.iter().rev() {
        let scope = strings.get(n.name).unwrap_or_default();
        if scope.contains(abi.eval_loop_symbol) {
            if m.peek().is_none() {
                // An evaluation-loop frame with no managed frames left is a
                // reportable anomaly; keep the native frame instead.
                log::warn!("expected managed frame(s), found none");
                out.push(n.clone());
            } else if has_entry_markers {
                // Pop one managed segment: an entry frame seen after the
                // first popped frame starts the next segment and stays.
                let mut popped = 0usize;
                while let Some(f) = m.peek() {
                    if f.is_shim && popped > 0 {
                        break;
                    }
                    out.push((*m.next().expect("peeked")).clone());
                    popped += 1;
                }
            } else {
                out.push(m.next().expect("peeked").clone());
            }
        } else {
            out.push(n.clone());
        }
    }

    if m.peek().is_some() {
        log::warn!("managed stack not empty after interleaving");
        for f in m {
            out.push(f.clone());
        }
    }

    out.reverse();
    out
}
