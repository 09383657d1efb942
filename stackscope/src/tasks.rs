//! Reconstruction of logical await chains.
//!
//! A task owns a chain of suspended coroutines; following each coroutine's
//! awaited-inner link reaches the frame where the task is actually parked.
//! Tasks can also wait on other tasks, and both links can be cyclic in a
//! corrupted or adversarial heap, so traversal depth is capped by an
//! absolute constant and self-links are skipped.

use crate::domain::{GeneratorError, StringKey, TaskError, VmAddr};
use crate::mirrors::{MirrorDict, MirrorSet};
use crate::runtime::abi::{Abi, GenFrame, LastiRule, YieldCheck};
use crate::runtime;
use crate::stacks::{unwind_frames, FrameStack, UnwindContext};
use crate::strings::StringTable;
use crate::vm::Mem;

/// Bound on traversal of both the awaited-inner and the waiter links.
pub const MAX_RECURSION_DEPTH: usize = 250;

/// One suspended (or running) coroutine in an await chain.
#[derive(Debug)]
pub struct CoroutineInfo {
    pub origin: VmAddr,
    /// Frame of this coroutine; `None` once the coroutine has finished.
    pub frame: Option<VmAddr>,
    pub awaited: Option<Box<CoroutineInfo>>,
    pub is_running: bool,
}

impl CoroutineInfo {
    /// Materialise the coroutine node at `addr` and its awaited chain.
    ///
    /// Async-send trampolines are followed through to the generator they
    /// wrap. A failure below the first node truncates the chain rather
    /// than failing it.
    ///
    /// # Errors
    /// Read faults, non-coroutine objects, and chain depth past the cap.
    pub fn read(mem: Mem, abi: &Abi, addr: VmAddr, depth: usize) -> Result<Box<Self>, GeneratorError> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(GeneratorError::DepthExceeded);
        }

        let type_name = runtime::type_name_of(mem, abi, addr)?;
        if type_name == abi.asend_type_name {
            let inner = mem.read_addr(addr.offset(abi.asend_gen))?;
            return Self::read(mem, abi, inner, depth + 1);
        }
        if !abi.coroutine_type_names.contains(&type_name.as_str()) {
            return Err(GeneratorError::NotCoroutine);
        }

        let (frame, is_running) = match abi.gen_frame {
            GenFrame::Embedded { state, iframe } => {
                let state = mem.read_i8(addr.offset(state))?;
                let frame = (state < abi.frame_state_cleared).then(|| addr.offset(iframe));
                (frame, state == abi.frame_state_executing)
            }
            GenFrame::Pointer { frame, running } => {
                let ptr = mem.read_addr(addr.offset(frame))?;
                let is_running = mem.read_u8(addr.offset(running)).unwrap_or(0) != 0;
                ((!ptr.is_null()).then_some(ptr), is_running)
            }
        };

        let awaited = frame
            .and_then(|f| yield_from(mem, abi, f))
            .filter(|inner| *inner != addr && !inner.is_null())
            .and_then(|inner| Self::read(mem, abi, inner, depth + 1).ok());

        Ok(Box::new(Self { origin: addr, frame, awaited, is_running }))
    }
}

/// The object a coroutine frame is currently yielding from, if the frame
/// is parked on an await.
fn yield_from(mem: Mem, abi: &Abi, frame: VmAddr) -> Option<VmAddr> {
    match abi.gen_yield_check {
        YieldCheck::NextUnitResume => {
            let LastiRule::FromInstrPtr { offset, .. } = abi.frame_lasti else {
                return None;
            };
            let instr = mem.read_usize(frame.offset(offset)).ok()?;
            if instr < crate::vm::PAGE_SIZE {
                return None;
            }
            let mut unit = [0u8; 2];
            mem.read_into(VmAddr(instr).offset(2), &mut unit).ok()?;
            let (op, arg) = (unit[0], unit[1]);
            if (op != abi.op_resume && op != abi.op_resume_instrumented) || arg < 2 {
                return None;
            }
            read_value_stack_top(mem, abi, frame, true)
        }
        YieldCheck::CodeByte { opcode } => {
            let code = mem.read_addr(frame.offset(abi.frame_executable)).ok()?;
            let lasti = crate::frame::frame_lasti(mem, abi, frame, code).ok()?;
            let (op, _) = crate::frame::read_code_unit(mem, abi, code, lasti + 1).ok()?;
            if op != opcode {
                return None;
            }
            read_value_stack_top(mem, abi, frame, false)
        }
    }
}

/// Top of a frame's value stack. On the inline-frame generations the
/// locals-plus array is embedded in the frame; on the legacy generation
/// the frame stores a pointer to a separate value stack.
fn read_value_stack_top(mem: Mem, abi: &Abi, frame: VmAddr, inline: bool) -> Option<VmAddr> {
    let depth = mem.read_i32(frame.offset(abi.frame_stacktop)).ok()?;
    let depth = usize::try_from(depth).ok()?;
    if depth == 0 || depth > (1 << 16) {
        return None;
    }
    let slot = (depth - 1) * 8;
    let top = if inline {
        mem.read_addr(frame.offset(abi.frame_localsplus + slot)).ok()?
    } else {
        let base = mem.read_addr(frame.offset(abi.frame_localsplus)).ok()?;
        mem.read_addr(base.offset(slot)).ok()?
    };
    (!top.is_null()).then_some(top)
}

/// One logical unit of asynchronous work.
#[derive(Debug)]
pub struct TaskInfo {
    pub origin: VmAddr,
    pub loop_addr: VmAddr,
    pub coro: Box<CoroutineInfo>,
    pub name: StringKey,
    /// Task this one is blocked on, if any.
    pub waiter: Option<Box<TaskInfo>>,
}

impl TaskInfo {
    /// Materialise the task at `addr` and its waiter chain.
    ///
    /// # Errors
    /// Read faults, an unreadable coroutine, an unresolvable name, or a
    /// waiter chain past the depth cap. Callers skip the task and keep
    /// enumerating.
    pub fn read(
        mem: Mem,
        abi: &Abi,
        strings: &StringTable,
        addr: VmAddr,
        depth: usize,
    ) -> Result<Box<Self>, TaskError> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(TaskError::DepthExceeded);
        }

        let name_obj = mem.read_addr(addr.offset(abi.task_name))?;
        let name = strings.key_for_object(mem, abi, name_obj)?;

        let coro_addr = mem.read_addr(addr.offset(abi.task_coro))?;
        let coro = CoroutineInfo::read(mem, abi, coro_addr, 0)?;

        let loop_addr = mem.read_addr(addr.offset(abi.task_loop))?;

        let fut_waiter = mem.read_addr(addr.offset(abi.task_fut_waiter))?;
        let waiter = (!fut_waiter.is_null() && fut_waiter != addr)
            .then(|| Self::read(mem, abi, strings, fut_waiter, depth + 1).ok())
            .flatten();

        Ok(Box::new(Self { origin: addr, loop_addr, coro, name, waiter }))
    }

    /// Whether any coroutine in the chain is currently executing.
    #[must_use]
    pub fn is_on_cpu(&self) -> bool {
        let mut node = Some(&self.coro);
        while let Some(coro) = node {
            if coro.is_running {
                return true;
            }
            node = coro.awaited.as_ref();
        }
        false
    }

    /// Unwind the task's coroutine chain into `out`, innermost frames
    /// first. Returns the number of frames contributed by the innermost
    /// coroutine, which the caller trims off the owning thread's stack
    /// when the task is on CPU.
    pub fn unwind(&self, ctx: UnwindContext<'_>, out: &mut FrameStack) -> usize {
        let mut frames: Vec<VmAddr> = Vec::new();
        let mut node = Some(&self.coro);
        while let Some(coro) = node {
            if let Some(frame) = coro.frame {
                frames.push(frame);
            }
            node = coro.awaited.as_ref();
        }

        let mut leaf_count = 0;
        for (i, frame) in frames.iter().rev().enumerate() {
            let added = unwind_frames(ctx, *frame, None, out);
            if i == 0 {
                leaf_count = added;
            }
        }
        leaf_count
    }
}

/// The runtime containers that track live tasks, supplied by the host.
#[derive(Debug, Clone, Copy)]
pub struct AsyncContainers {
    /// Mapping from event loop to the task it is currently running.
    pub current: VmAddr,
    /// Weak-reference set of all scheduled tasks.
    pub scheduled: VmAddr,
    /// Optional set of eagerly-started tasks.
    pub eager: Option<VmAddr>,
}

/// The task currently running on `loop_addr`, if any.
#[must_use]
pub fn current_task(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    containers: &AsyncContainers,
    loop_addr: VmAddr,
) -> Option<Box<TaskInfo>> {
    let dict = MirrorDict::create(mem, abi, containers.current).ok()?;
    let task = dict.get(loop_addr)?;
    TaskInfo::read(mem, abi, strings, task, 0).ok()
}

/// Enumerate every task bound to `loop_addr`.
///
/// Scheduled tasks are reached through weak references; eager tasks, when
/// the runtime exposes them, are held directly. Tasks that fail to read
/// are skipped.
///
/// # Errors
/// [`TaskError::Mirror`] when a container cannot be mirrored; the caller
/// emits zero tasks this tick.
pub fn all_tasks(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    containers: &AsyncContainers,
    loop_addr: VmAddr,
) -> Result<Vec<Box<TaskInfo>>, TaskError> {
    let mut tasks = Vec::new();
    if loop_addr.is_null() {
        return Ok(tasks);
    }

    let scheduled = MirrorSet::create(mem, abi, containers.scheduled)?;
    for weakref in scheduled.iter() {
        let Ok(task_addr) = mem.read_addr(weakref.offset(abi.weakref_object)) else {
            continue;
        };
        if let Ok(task) = TaskInfo::read(mem, abi, strings, task_addr, 0) {
            if task.loop_addr == loop_addr {
                tasks.push(task);
            }
        }
    }

    if let Some(eager) = containers.eager {
        let eager_set = MirrorSet::create(mem, abi, eager)?;
        for task_addr in eager_set.iter() {
            if let Ok(task) = TaskInfo::read(mem, abi, strings, task_addr, 0) {
                if task.loop_addr == loop_addr {
                    tasks.push(task);
                }
            }
        }
    }

    Ok(tasks)
}
