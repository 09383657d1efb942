//! The runtime boundary: version selection and traversal of the runtime's
//! interpreter and thread lists.
//!
//! The host supplies the runtime's version and the address of its root
//! state structure at `init`; everything else is reached from there through
//! fault-tolerant reads. List walks carry their own seen-sets and caps so a
//! torn pointer cannot send the sampler into a loop.

pub mod abi;

use std::collections::HashSet;

use crate::domain::{InterpreterId, Pid, VmAddr, VmError};
use crate::vm::Mem;

use abi::{Abi, FrameRoot};

// A runtime hosting more simultaneous interpreters or threads than this is
// assumed to be garbage from a torn read.
const MAX_INTERPRETERS: usize = 256;
const MAX_THREADS: usize = 4096;

/// Version of the managed runtime, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub major: u16,
    pub minor: u16,
}

/// Resolver the host may register so in-thread unwinds (the allocation
/// path) can locate the calling thread's state without a registry walk.
pub type ThreadStateFn = unsafe extern "C" fn() -> usize;

/// Everything the host hands over at `init`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSpec {
    pub version: RuntimeVersion,
    /// Address of the runtime's root state structure.
    pub runtime_root: usize,
    /// Optional fast-path resolver for the current thread's state address.
    pub thread_state: Option<ThreadStateFn>,
}

/// Resolved view of the runtime, fixed after `init`.
#[derive(Clone, Copy)]
pub struct RuntimeView {
    pub abi: &'static Abi,
    pub root: VmAddr,
    pub pid: Pid,
    pub thread_state: Option<ThreadStateFn>,
}

/// One interpreter from the runtime's interpreter list.
#[derive(Debug, Clone, Copy)]
pub struct InterpreterInfo {
    pub id: InterpreterId,
    pub addr: VmAddr,
    pub threads_head: VmAddr,
}

/// One entry of an interpreter's thread-state list.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStateRef {
    pub addr: VmAddr,
    pub thread_id: usize,
}

/// Walk the runtime's interpreter list. Interpreters whose header cannot be
/// read are skipped; the walk continues with whatever `next` was captured.
pub fn for_each_interpreter<F>(mem: Mem, view: &RuntimeView, mut f: F)
where
    F: FnMut(&InterpreterInfo),
{
    let abi = view.abi;
    let mut seen: HashSet<usize> = HashSet::new();
    let Ok(mut addr) = mem.read_addr(view.root.offset(abi.runtime_interp_head)) else {
        return;
    };

    while !addr.is_null() && seen.len() < MAX_INTERPRETERS {
        if !seen.insert(addr.0) {
            break;
        }
        let next = mem.read_addr(addr.offset(abi.interp_next)).unwrap_or(VmAddr::NULL);

        let id = mem.read_i64(addr.offset(abi.interp_id));
        let threads_head = mem.read_addr(addr.offset(abi.interp_threads_head));
        if let (Ok(id), Ok(threads_head)) = (id, threads_head) {
            f(&InterpreterInfo { id: InterpreterId(id), addr, threads_head });
        }

        addr = next;
    }
}

/// Walk one interpreter's thread-state list.
pub fn for_each_thread_state<F>(mem: Mem, abi: &Abi, interp: &InterpreterInfo, mut f: F)
where
    F: FnMut(&ThreadStateRef),
{
    let mut seen: HashSet<usize> = HashSet::new();
    let mut addr = interp.threads_head;

    while !addr.is_null() && seen.len() < MAX_THREADS {
        if !seen.insert(addr.0) {
            break;
        }
        let next = mem.read_addr(addr.offset(abi.tstate_next)).unwrap_or(VmAddr::NULL);

        if let Ok(thread_id) = mem.read_usize(addr.offset(abi.tstate_thread_id)) {
            f(&ThreadStateRef { addr, thread_id });
        }

        addr = next;
    }
}

/// Address of a thread's innermost frame, per the version's frame root.
///
/// # Errors
/// Read faults while chasing the control-frame indirection.
pub fn current_frame_addr(mem: Mem, abi: &Abi, tstate: VmAddr) -> Result<VmAddr, VmError> {
    match abi.tstate_frame {
        FrameRoot::Direct(offset) => mem.read_addr(tstate.offset(offset)),
        FrameRoot::ViaControlFrame { cframe, current } => {
            let control = mem.read_addr(tstate.offset(cframe))?;
            if control.is_null() {
                return Ok(VmAddr::NULL);
            }
            mem.read_addr(control.offset(current))
        }
    }
}

/// Read an object's type name (bounded), e.g. `"code"` or `"coroutine"`.
///
/// # Errors
/// Read faults on the object header, type object, or name string.
pub fn type_name_of(mem: Mem, abi: &Abi, obj: VmAddr) -> Result<String, VmError> {
    let type_addr = mem.read_addr(obj.offset(abi.ob_type))?;
    let name_ptr = mem.read_addr(type_addr.offset(abi.type_name))?;
    mem.read_c_str(name_ptr, 64)
}

/// Whether an object's type name matches `expected` exactly.
#[must_use]
pub fn has_type_name(mem: Mem, abi: &Abi, obj: VmAddr, expected: &str) -> bool {
    type_name_of(mem, abi, obj).is_ok_and(|name| name == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{self, VmReadMode};

    // A miniature in-process "runtime image": buffers laid out with the
    // same offset table the walks consume.
    struct Image {
        chunks: Vec<Box<[u8]>>,
    }

    impl Image {
        fn new() -> Self {
            Self { chunks: Vec::new() }
        }

        fn alloc(&mut self, len: usize) -> VmAddr {
            self.chunks.push(vec![0u8; len].into_boxed_slice());
            VmAddr(self.chunks.last().unwrap().as_ptr() as usize)
        }

        fn put_usize(&mut self, at: VmAddr, value: usize) {
            let chunk = self
                .chunks
                .iter_mut()
                .find(|c| {
                    let base = c.as_ptr() as usize;
                    at.0 >= base && at.0 + 8 <= base + c.len()
                })
                .expect("address inside an allocated chunk");
            let base = chunk.as_ptr() as usize;
            chunk[at.0 - base..at.0 - base + 8].copy_from_slice(&value.to_ne_bytes());
        }
    }

    fn test_view(root: VmAddr) -> RuntimeView {
        RuntimeView {
            abi: abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap(),
            root,
            pid: Pid(1),
            thread_state: None,
        }
    }

    #[test]
    fn test_interpreter_and_thread_walk() {
        vm::init(VmReadMode::Kernel).unwrap();
        let mut img = Image::new();
        let abi = abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap();

        let root = img.alloc(256);
        let interp = img.alloc(256);
        let tstate_a = img.alloc(512);
        let tstate_b = img.alloc(512);

        img.put_usize(root.offset(abi.runtime_interp_head), interp.0);
        img.put_usize(interp.offset(abi.interp_id), 7);
        img.put_usize(interp.offset(abi.interp_threads_head), tstate_a.0);
        img.put_usize(tstate_a.offset(abi.tstate_next), tstate_b.0);
        img.put_usize(tstate_a.offset(abi.tstate_thread_id), 0xaaa);
        img.put_usize(tstate_b.offset(abi.tstate_thread_id), 0xbbb);

        let view = test_view(root);
        let mut interps = Vec::new();
        for_each_interpreter(Mem::Safe, &view, |i| interps.push(*i));
        assert_eq!(interps.len(), 1);
        assert_eq!(interps[0].id, InterpreterId(7));

        let mut threads = Vec::new();
        for_each_thread_state(Mem::Safe, abi, &interps[0], |t| threads.push(*t));
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].thread_id, 0xaaa);
        assert_eq!(threads[1].thread_id, 0xbbb);
    }

    #[test]
    fn test_thread_walk_cycle_guard() {
        vm::init(VmReadMode::Kernel).unwrap();
        let mut img = Image::new();
        let abi = abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap();

        let interp_addr = img.alloc(256);
        let tstate = img.alloc(512);
        // The thread state points back at itself.
        img.put_usize(tstate.offset(abi.tstate_next), tstate.0);
        img.put_usize(tstate.offset(abi.tstate_thread_id), 0x1);

        let interp = InterpreterInfo {
            id: InterpreterId(0),
            addr: interp_addr,
            threads_head: tstate,
        };
        let mut count = 0;
        for_each_thread_state(Mem::Safe, abi, &interp, |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_current_frame_addr_via_control_frame() {
        vm::init(VmReadMode::Kernel).unwrap();
        let mut img = Image::new();
        let abi = abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap();
        let FrameRoot::ViaControlFrame { cframe, current } = abi.tstate_frame else {
            panic!("v12 uses a control frame");
        };

        let tstate = img.alloc(512);
        let control = img.alloc(64);
        img.put_usize(tstate.offset(cframe), control.0);
        img.put_usize(control.offset(current), 0x1234_5678);

        let got = current_frame_addr(Mem::Safe, abi, tstate).unwrap();
        assert_eq!(got, VmAddr(0x1234_5678));
    }
}
