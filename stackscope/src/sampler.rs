//! The profiler root and the sampling driver.
//!
//! All process-wide state hangs off one [`Profiler`] created by [`init`]
//! and published through a `OnceLock`. The instance is never torn down:
//! host threads and allocator shims may race any teardown, so state is
//! reset in place on re-initialisation (after a fork, for instance)
//! instead of being dropped.
//!
//! The sampler itself is a plain loop: every `interval` microseconds it
//! walks the runtime's thread list, captures each registered thread's
//! stack, and hands the frames to the renderer. Between ticks it yields
//! the CPU in a short-interval busy-wait to keep latency tight.

use std::collections::{HashMap, HashSet};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;

use crate::config::Config;
use crate::domain::{ConfigError, InterpreterId, Microseconds, Pid, VmAddr};
use crate::frame::FrameCache;
use crate::memory::{AllocationTable, RssTracker, StackStats};
use crate::render::Renderer;
use crate::runtime::{self, abi, RuntimeSpec, RuntimeView};
use crate::signals;
use crate::stack_chunk::StackChunk;
use crate::stacks::{self, FrameStack, StackTable, UnwindContext};
use crate::strings::StringTable;
use crate::tasks::{self, AsyncContainers};
use crate::threads::{ThreadInfo, ThreadRegistry};
use crate::timing;
use crate::vm::{self, Mem};
use crate::{frame, native};

// How long the sampler waits for a signalled thread to report back before
// skipping it for the tick.
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);

// Idle poll period of the snapshot listener.
const WHERE_POLL: Duration = Duration::from_millis(200);

/// Process-wide profiler state.
pub struct Profiler {
    pub(crate) config: Mutex<Config>,
    pub(crate) runtime: Mutex<Option<RuntimeView>>,
    pub(crate) threads: Mutex<ThreadRegistry>,
    pub(crate) strings: StringTable,
    pub(crate) stacks: StackTable,
    pub(crate) frames: Mutex<Option<Arc<FrameCache>>>,
    pub(crate) renderer: Mutex<Option<Renderer>>,
    pub(crate) allocations: AllocationTable,
    pub(crate) stats: StackStats,
    pub(crate) rss: Mutex<RssTracker>,
    // Child task origin → parent task origin.
    pub(crate) task_links: Mutex<HashMap<usize, usize>>,
    pub(crate) async_containers: Mutex<Option<AsyncContainers>>,
    running: AtomicBool,
    sampler_thread: Mutex<Option<JoinHandle<()>>>,
    where_thread: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: OnceLock<Profiler> = OnceLock::new();

impl Profiler {
    fn new() -> Self {
        Self {
            config: Mutex::new(Config::default()),
            runtime: Mutex::new(None),
            threads: Mutex::new(ThreadRegistry::new()),
            strings: StringTable::new(),
            stacks: StackTable::new(),
            frames: Mutex::new(None),
            renderer: Mutex::new(None),
            allocations: AllocationTable::new(),
            stats: StackStats::new(),
            rss: Mutex::new(RssTracker::new()),
            task_links: Mutex::new(HashMap::new()),
            async_containers: Mutex::new(None),
            running: AtomicBool::new(false),
            sampler_thread: Mutex::new(None),
            where_thread: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn runtime_view(&self) -> Option<RuntimeView> {
        *self.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn frame_cache(&self) -> Option<Arc<FrameCache>> {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Attribute one allocation to the calling thread's managed stack.
    /// Runs inline in the allocating thread; uses the direct (in-thread)
    /// unwinder.
    pub(crate) fn record_allocation(&self, address: usize, size: usize) {
        let Some(rt) = self.runtime_view() else { return };
        let Some(frames) = self.frame_cache() else { return };
        let Some(tstate) = self.current_thread_state(&rt) else { return };

        let max_frames = self.lock_config().max_frames;
        let ctx = UnwindContext {
            mem: Mem::Direct,
            abi: rt.abi,
            strings: &self.strings,
            frames: &frames,
            max_frames,
        };

        let mut stack: FrameStack = Vec::new();
        stacks::unwind_thread(ctx, tstate, None, &mut stack);
        let key = self.stacks.store(&stack);
        self.allocations.link(address, key, size);

        let (iid, thread_name) = self.current_thread_identity(&rt, tstate);
        self.stats.update_alloc(iid, &thread_name, key, size);
    }

    pub(crate) fn record_free(&self, address: usize) {
        if let Some(record) = self.allocations.unlink(address) {
            self.stats.update_free(&record);
        }
    }

    /// Thread state of the calling thread: the host's resolver when it
    /// registered one, else the registry entry the sampler primed.
    fn current_thread_state(&self, rt: &RuntimeView) -> Option<VmAddr> {
        if let Some(hook) = rt.thread_state {
            // SAFETY: the host supplied this resolver for exactly this use.
            #[allow(unsafe_code)]
            let addr = unsafe { hook() };
            if addr != 0 {
                return Some(VmAddr(addr));
            }
        }
        // SAFETY: pthread_self has no preconditions.
        #[allow(unsafe_code)]
        let thread_id = unsafe { libc::pthread_self() } as usize;
        self.threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(thread_id)
            .map(|info| info.state_addr)
            .filter(|addr| !addr.is_null())
    }

    fn current_thread_identity(&self, rt: &RuntimeView, tstate: VmAddr) -> (InterpreterId, String) {
        let iid = Mem::Direct
            .read_addr(tstate.offset(rt.abi.tstate_interp))
            .and_then(|interp| Mem::Direct.read_i64(interp.offset(rt.abi.interp_id)))
            .map_or(InterpreterId(0), InterpreterId);

        // SAFETY: pthread_self has no preconditions.
        #[allow(unsafe_code)]
        let thread_id = unsafe { libc::pthread_self() } as usize;
        let name = self
            .threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(thread_id)
            .map_or_else(|| "<unnamed>".to_owned(), |info| info.name.clone());
        (iid, name)
    }
}

/// The profiler instance, if `init` has run.
pub fn try_profiler() -> Option<&'static Profiler> {
    INSTANCE.get()
}

/// The profiler instance, created on first use. Configuration calls may
/// precede `init`; starting the sampler still requires it.
pub fn profiler() -> &'static Profiler {
    INSTANCE.get_or_init(Profiler::new)
}

// ---------------------------------------------------------------------------
// Control surface

/// One-time (or post-fork) initialisation: resolve the runtime ABI, set up
/// the safe reader, and reset any state inherited across a fork.
///
/// # Errors
/// Unsupported runtime versions and safe-reader initialisation failure;
/// the profiler cannot start after the latter.
pub fn init(spec: RuntimeSpec) -> Result<(), ConfigError> {
    let abi = abi::lookup(spec.version)?;
    let p = INSTANCE.get_or_init(Profiler::new);

    let mode = p.lock_config().vm_read_mode;
    let effective = vm::init(mode)?;
    if effective != mode {
        p.lock_config().vm_read_mode = effective;
    }

    *p.runtime.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(RuntimeView {
        abi,
        root: VmAddr(spec.runtime_root),
        pid: Pid(i32::try_from(std::process::id()).unwrap_or(0)),
        thread_state: spec.thread_state,
    });

    // A fork inherits registries describing threads that no longer exist.
    p.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    p.stacks.clear();
    p.allocations.clear();
    p.stats.clear();
    vm::clear_page_cache();
    Ok(())
}

/// Run the sampler on the calling thread until `stop` is called from
/// elsewhere (or immediately after one snapshot in where mode).
///
/// # Errors
/// Configuration problems detected at startup; the output channel, the
/// runtime view, or a concurrent sampler already running.
pub fn start() -> anyhow::Result<()> {
    let p = profiler();
    prepare_start(p)?;
    sampler_entry(p);
    Ok(())
}

/// Start the sampler on a dedicated background thread.
///
/// # Errors
/// See [`start`].
pub fn start_async() -> anyhow::Result<()> {
    let p = profiler();
    prepare_start(p)?;
    let handle = std::thread::Builder::new()
        .name("stackscope-sampler".into())
        .spawn(move || sampler_entry(p))
        .context("failed to spawn the sampler thread")?;
    *p.sampler_thread.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    Ok(())
}

/// Cooperative shutdown: the sampler observes the flag at the next tick
/// boundary; joins the background thread when one was started.
///
/// # Errors
/// Propagates a panicked sampler thread.
pub fn stop() -> anyhow::Result<()> {
    let p = profiler();
    p.running.store(false, Ordering::Release);
    let handle = p
        .sampler_thread
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(handle) = handle {
        handle.join().map_err(|_| anyhow::anyhow!("sampler thread panicked"))?;
    }
    Ok(())
}

/// Register a thread for sampling. Called by the runtime's thread-start
/// callback, on the thread itself.
pub fn track_thread(thread_id: usize, name: &str, native_id: u32) {
    let p = profiler();
    p.threads
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .track(thread_id, name, native_id);
}

/// Deregister a thread on its stop callback.
pub fn untrack_thread(thread_id: usize) {
    let p = profiler();
    p.threads
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .untrack(thread_id);
}

/// Associate an event loop with a thread (zero clears the association).
pub fn track_event_loop(thread_id: usize, loop_addr: usize) {
    let p = profiler();
    let event_loop = (loop_addr != 0).then_some(VmAddr(loop_addr));
    p.threads
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .set_event_loop(thread_id, event_loop);
}

/// Supply the runtime's task containers (current-task mapping, scheduled
/// set, optional eager set; zero for none).
pub fn init_async(current: usize, scheduled: usize, eager: usize) {
    let p = profiler();
    *p.async_containers.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        Some(AsyncContainers {
            current: VmAddr(current),
            scheduled: VmAddr(scheduled),
            eager: (eager != 0).then_some(VmAddr(eager)),
        });
}

/// Record a parent/child relation between two tasks.
pub fn link_tasks(parent: usize, child: usize) {
    let p = profiler();
    p.task_links
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(child, parent);
}

// ---------------------------------------------------------------------------
// Configuration setters

/// # Errors
/// Zero intervals are rejected.
pub fn set_interval(interval_us: u64) -> Result<(), ConfigError> {
    if interval_us == 0 {
        return Err(ConfigError::ZeroInterval);
    }
    profiler().lock_config().interval_us = interval_us;
    Ok(())
}

pub fn set_cpu(cpu: bool) {
    profiler().lock_config().cpu = cpu;
}

pub fn set_memory(memory: bool) {
    profiler().lock_config().memory = memory;
}

pub fn set_native(native: bool) {
    profiler().lock_config().native = native;
}

pub fn set_where(where_mode: bool) {
    profiler().lock_config().where_mode = where_mode;
}

pub fn set_pipe_name(path: &str) {
    profiler().lock_config().pipe_name = Some(PathBuf::from(path));
}

pub fn set_ignore_non_running_threads(ignore: bool) {
    profiler().lock_config().ignore_non_running_threads = ignore;
}

/// # Errors
/// Zero is rejected.
pub fn set_max_frames(max_frames: usize) -> Result<(), ConfigError> {
    if max_frames == 0 {
        return Err(ConfigError::ZeroMaxFrames);
    }
    profiler().lock_config().max_frames = max_frames;
    Ok(())
}

/// Switch the memory-read strategy. Returns the mode actually in effect,
/// which is the mirror fallback when the requested one is unavailable.
///
/// # Errors
/// Unknown mode numbers; initialisation failure of every strategy.
pub fn set_vm_read_mode(mode: i32) -> Result<vm::VmReadMode, ConfigError> {
    let requested = vm::VmReadMode::try_from(mode)?;
    let effective = vm::init(requested)?;
    profiler().lock_config().vm_read_mode = effective;
    Ok(effective)
}

// ---------------------------------------------------------------------------
// The sampler

fn prepare_start(p: &'static Profiler) -> Result<(), ConfigError> {
    if p.runtime_view().is_none() {
        return Err(ConfigError::NotInitialised);
    }
    if p.running.swap(true, Ordering::AcqRel) {
        return Err(ConfigError::AlreadyRunning);
    }
    Ok(())
}

fn sampler_entry(p: &'static Profiler) {
    if let Err(e) = sampler_main(p) {
        log::error!("sampler terminated: {e:#}");
    }
    teardown(p);
}

fn sampler_main(p: &'static Profiler) -> anyhow::Result<()> {
    let cfg = p.lock_config().clone();
    let rt = p.runtime_view().context("profiler not initialised")?;

    let capacity = cfg.max_frames * (1 + usize::from(cfg.native));
    *p.frames.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
        Some(Arc::new(FrameCache::new(capacity)));

    vm::enable_page_cache(true);
    signals::install(rt.abi, cfg.native);

    if cfg.where_mode {
        return run_where_once(p, &cfg, &rt);
    }

    let mut renderer = Renderer::open_mojo()?;
    renderer.begin(cfg.mode_name(), cfg.interval_us)?;
    *p.renderer.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(renderer);

    let listener = std::thread::Builder::new()
        .name("stackscope-where".into())
        .spawn(move || where_listener(p))
        .context("failed to spawn the where listener")?;
    *p.where_thread.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);

    let mut last: Microseconds = timing::monotonic_us();
    while p.running.load(Ordering::Acquire) {
        let now = timing::monotonic_us();
        let tick_end = now + cfg.interval_us;
        let wall_delta = now.saturating_sub(last);

        if cfg.memory {
            flush_memory_stats(p, &rt, false);
        } else {
            sample_all_threads(p, &cfg, &rt, wall_delta);
        }

        while timing::monotonic_us() < tick_end && p.running.load(Ordering::Acquire) {
            timing::yield_now();
        }
        last = now;
    }

    Ok(())
}

fn teardown(p: &'static Profiler) {
    p.running.store(false, Ordering::Release);

    if let Some(handle) = p
        .where_thread
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take()
    {
        signals::where_notify();
        let _ = handle.join();
    }

    signals::restore();

    let memory_mode = p.lock_config().memory;
    if memory_mode {
        if let Some(rt) = p.runtime_view() {
            flush_memory_stats(p, &rt, true);
        }
        p.stats.clear();
        p.stacks.clear();
        p.allocations.clear();
    }

    if let Some(mut renderer) = p
        .renderer
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take()
    {
        let _ = renderer.finish();
    }

    p.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    *p.frames.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    vm::enable_page_cache(false);
}

/// Flush accumulated allocation stats; unless `force`, only when the
/// resident set moved since the previous tick.
fn flush_memory_stats(p: &Profiler, rt: &RuntimeView, force: bool) {
    let changed = p
        .rss
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .check();
    if !changed && !force {
        return;
    }
    let mut renderer = p.renderer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(renderer) = renderer.as_mut() {
        if let Err(e) = p.stats.flush(renderer, &p.stacks, &p.strings, rt.pid) {
            log::warn!("memory stats flush failed: {e}");
        }
    }
}

fn sample_all_threads(p: &'static Profiler, cfg: &Config, rt: &RuntimeView, wall_delta: u64) {
    runtime::for_each_interpreter(Mem::Safe, rt, |interp| {
        runtime::for_each_thread_state(Mem::Safe, rt.abi, interp, |ts| {
            let mut threads = p.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(info) = threads.get_mut(ts.thread_id) {
                info.state_addr = ts.addr;
                sample_thread(p, cfg, rt, interp.id, ts.addr, info, wall_delta);
            }
        });
    });
}

fn sample_thread(
    p: &Profiler,
    cfg: &Config,
    rt: &RuntimeView,
    iid: InterpreterId,
    tstate: VmAddr,
    info: &mut ThreadInfo,
    wall_delta: u64,
) {
    let mut metric = i64::try_from(wall_delta).unwrap_or(i64::MAX);
    let mut idle = false;

    if cfg.cpu {
        let cpu_delta = info.update_cpu_time();
        if info.is_running() {
            metric = i64::try_from(cpu_delta).unwrap_or(i64::MAX);
        } else {
            if cfg.ignore_non_running_threads {
                return;
            }
            idle = true;
            metric = 0;
        }
    }

    let Some(frames_cache) = p.frame_cache() else { return };
    let ctx = UnwindContext {
        mem: Mem::Safe,
        abi: rt.abi,
        strings: &p.strings,
        frames: &frames_cache,
        max_frames: cfg.max_frames,
    };

    let mut managed: FrameStack = Vec::new();
    let mut native_stack: FrameStack = Vec::new();

    if cfg.native {
        let Some(capture) =
            signals::capture_thread(info.thread_id as libc::pthread_t, tstate, CAPTURE_TIMEOUT)
        else {
            return;
        };
        stacks::resolve_raw_frames(ctx, &capture.managed[..capture.managed_len], &mut managed);
        // The two leaf-most native frames belong to the signal trampoline
        // and the handler.
        let pcs = &capture.native[..capture.native_len];
        let pcs = if pcs.len() > 2 { &pcs[2..] } else { &[][..] };
        for &pc in pcs.iter().take(cfg.max_frames) {
            native_stack.push(native::resolve_pc(&p.strings, &frames_cache, pc));
        }
    } else {
        let chunk = mirror_stack_chunk(ctx, rt, tstate);
        stacks::unwind_thread(ctx, tstate, chunk.as_ref(), &mut managed);
    }

    // Async tasks on this thread's event loop.
    let mut task_stacks: Vec<FrameStack> = Vec::new();
    let mut leaf_trim = 0usize;
    if let Some(loop_addr) = info.event_loop {
        let containers =
            *p.async_containers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(containers) = containers {
            (leaf_trim, task_stacks) = collect_task_stacks(p, ctx, &containers, loop_addr);
        }
    }

    // Frames owned by the running task would be double-counted: they sit
    // at the leaf of the thread stack and in that task's own sample.
    if leaf_trim > 0 && leaf_trim < managed.len() {
        managed.drain(..leaf_trim);
    }

    let final_stack = if cfg.native {
        stacks::interleave(&p.strings, rt.abi, &managed, &native_stack)
    } else {
        managed
    };

    let mut renderer = p.renderer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let Some(renderer) = renderer.as_mut() else { return };
    let emit = |renderer: &mut Renderer, frames: &[Arc<frame::Frame>]| -> std::io::Result<()> {
        renderer.stack_begin(i64::from(rt.pid.0), iid.0, &info.name)?;
        renderer.render_frames(frames, &p.strings)?;
        if idle {
            renderer.idle()
        } else {
            renderer.metric_time(metric)
        }
    };

    for task_stack in &task_stacks {
        if let Err(e) = emit(renderer, task_stack) {
            log::warn!("sample emit failed: {e}");
            return;
        }
    }
    if let Err(e) = emit(renderer, &final_stack) {
        log::warn!("sample emit failed: {e}");
    }
}

fn mirror_stack_chunk(ctx: UnwindContext<'_>, rt: &RuntimeView, tstate: VmAddr) -> Option<StackChunk> {
    let offset = rt.abi.tstate_datastack_chunk?;
    let chunk_addr = ctx.mem.read_addr(tstate.offset(offset)).ok()?;
    if chunk_addr.is_null() {
        return None;
    }
    let mut chunk = StackChunk::new();
    chunk.update(ctx.mem, rt.abi, chunk_addr).ok()?;
    Some(chunk)
}

/// Build one stack per task on the given loop. Returns the number of leaf
/// frames owned by the running task (to trim from the thread stack) and
/// the task stacks themselves.
fn collect_task_stacks(
    p: &Profiler,
    ctx: UnwindContext<'_>,
    containers: &AsyncContainers,
    loop_addr: VmAddr,
) -> (usize, Vec<FrameStack>) {
    let all = match tasks::all_tasks(ctx.mem, ctx.abi, &p.strings, containers, loop_addr) {
        Ok(all) => all,
        Err(e) => {
            log::debug!("task enumeration failed: {e}");
            return (0, Vec::new());
        }
    };

    let running_origin = tasks::current_task(ctx.mem, ctx.abi, &p.strings, containers, loop_addr)
        .map(|task| task.origin);

    let mut leaf_trim = 0usize;
    let mut out = Vec::with_capacity(all.len());

    for task in &all {
        let mut stack: FrameStack = Vec::new();

        // The awaited task, when known, is the logical leaf.
        if let Some(waiter) = &task.waiter {
            stack.push(frame::resolve_synthetic_key(&p.strings, ctx.frames, waiter.name));
        }

        let leaf_count = task.unwind(ctx, &mut stack);
        stack.push(frame::resolve_synthetic_key(&p.strings, ctx.frames, task.name));

        // Logical ancestry recorded through the link map.
        append_parent_links(p, ctx, &all, task.origin, &mut stack);

        if task.is_on_cpu() || running_origin == Some(task.origin) {
            leaf_trim = leaf_count;
        }

        out.push(stack);
    }

    (leaf_trim, out)
}

fn append_parent_links(
    p: &Profiler,
    ctx: UnwindContext<'_>,
    all: &[Box<tasks::TaskInfo>],
    origin: VmAddr,
    stack: &mut FrameStack,
) {
    let links = p.task_links.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut seen: HashSet<usize> = HashSet::new();
    let mut child = origin.0;
    while let Some(&parent) = links.get(&child) {
        if !seen.insert(parent) || seen.len() > tasks::MAX_RECURSION_DEPTH {
            break;
        }
        if let Some(parent_task) = all.iter().find(|t| t.origin.0 == parent) {
            stack.push(frame::resolve_synthetic_key(&p.strings, ctx.frames, parent_task.name));
        }
        child = parent;
    }
}

// ---------------------------------------------------------------------------
// Where mode

fn run_where_once(p: &'static Profiler, cfg: &Config, rt: &RuntimeView) -> anyhow::Result<()> {
    let path = cfg.pipe_name.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("stackscope-{}", std::process::id()))
    });
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("cannot open snapshot pipe {}", path.display()))?;

    let mut renderer = Renderer::new_where(Box::new(BufWriter::new(file)));
    renderer.begin(cfg.mode_name(), cfg.interval_us)?;
    render_snapshot(p, cfg, rt, &mut renderer);
    renderer.finish()?;

    p.running.store(false, Ordering::Release);
    Ok(())
}

fn where_listener(p: &'static Profiler) {
    loop {
        let fired = signals::where_wait(WHERE_POLL);
        if !p.running.load(Ordering::Acquire) {
            break;
        }
        if !fired {
            continue;
        }
        let cfg = p.lock_config().clone();
        let Some(rt) = p.runtime_view() else { continue };
        let mut renderer = Renderer::new_where(Box::new(std::io::stderr()));
        let _ = renderer.begin(cfg.mode_name(), cfg.interval_us);
        render_snapshot(p, &cfg, &rt, &mut renderer);
        let _ = renderer.finish();
    }
}

/// Render every registered thread's managed stack.
fn render_snapshot(p: &Profiler, cfg: &Config, rt: &RuntimeView, renderer: &mut Renderer) {
    let Some(frames_cache) = p.frame_cache() else { return };
    let ctx = UnwindContext {
        mem: Mem::Safe,
        abi: rt.abi,
        strings: &p.strings,
        frames: &frames_cache,
        max_frames: cfg.max_frames,
    };

    runtime::for_each_interpreter(Mem::Safe, rt, |interp| {
        runtime::for_each_thread_state(Mem::Safe, rt.abi, interp, |ts| {
            let threads = p.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(info) = threads.get(ts.thread_id) else { return };

            let chunk = mirror_stack_chunk(ctx, rt, ts.addr);
            let mut stack: FrameStack = Vec::new();
            stacks::unwind_thread(ctx, ts.addr, chunk.as_ref(), &mut stack);

            let _ = renderer.stack_begin(i64::from(rt.pid.0), interp.id.0, &info.name);
            let _ = renderer.render_frames(&stack, &p.strings);
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeVersion;

    fn test_spec(root: usize) -> RuntimeSpec {
        RuntimeSpec {
            version: RuntimeVersion { major: 3, minor: 12 },
            runtime_root: root,
            thread_state: None,
        }
    }

    #[test]
    fn test_init_and_config_surface() {
        // A root buffer with an empty interpreter list.
        let root = vec![0u8; 256];
        init(test_spec(root.as_ptr() as usize)).unwrap();

        set_interval(10_000).unwrap();
        assert!(matches!(set_interval(0), Err(ConfigError::ZeroInterval)));
        set_cpu(true);
        set_cpu(false);
        set_max_frames(64).unwrap();
        assert!(matches!(set_max_frames(0), Err(ConfigError::ZeroMaxFrames)));
        assert!(matches!(set_vm_read_mode(7), Err(ConfigError::InvalidVmReadMode(7))));

        let cfg = profiler().lock_config().clone();
        assert_eq!(cfg.interval_us, 10_000);
        assert_eq!(cfg.max_frames, 64);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let err = init(RuntimeSpec {
            version: RuntimeVersion { major: 3, minor: 6 },
            runtime_root: 0x1000,
            thread_state: None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_track_untrack_thread_surface() {
        let root = vec![0u8; 256];
        init(test_spec(root.as_ptr() as usize)).unwrap();

        // SAFETY: pthread_self/gettid have no preconditions.
        #[allow(unsafe_code)]
        let (tid, native_id) = unsafe { (libc::pthread_self() as usize, libc::gettid() as u32) };
        track_thread(tid, "MainThread", native_id);
        track_event_loop(tid, 0xab00);
        {
            let threads = profiler().threads.lock().unwrap();
            let info = threads.get(tid).unwrap();
            assert_eq!(info.name, "MainThread");
            assert_eq!(info.event_loop, Some(VmAddr(0xab00)));
        }
        untrack_thread(tid);
        assert!(profiler().threads.lock().unwrap().get(tid).is_none());
    }

    #[test]
    fn test_link_tasks_records_edges() {
        let root = vec![0u8; 256];
        init(test_spec(root.as_ptr() as usize)).unwrap();
        link_tasks(0x10, 0x20);
        link_tasks(0x20, 0x30);
        let links = profiler().task_links.lock().unwrap();
        assert_eq!(links.get(&0x20), Some(&0x10));
        assert_eq!(links.get(&0x30), Some(&0x20));
    }
}
