//! Task and coroutine reconstruction against fabricated runtime images.

mod common;

use common::Image;
use stackscope::domain::VmAddr;
use stackscope::frame::FrameCache;
use stackscope::runtime::abi::{Abi, LastiRule};
use stackscope::runtime::{abi, RuntimeVersion};
use stackscope::stacks::{FrameStack, UnwindContext};
use stackscope::strings::StringTable;
use stackscope::tasks::{all_tasks, AsyncContainers, CoroutineInfo, TaskInfo};
use stackscope::vm::{self, Mem, VmReadMode};

fn v12() -> &'static Abi {
    abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap()
}

struct Fixture {
    strings: StringTable,
    frames: FrameCache,
}

impl Fixture {
    fn new() -> Self {
        vm::init(VmReadMode::Kernel).expect("vm init");
        Self { strings: StringTable::new(), frames: FrameCache::new(256) }
    }

    fn ctx<'a>(&'a self, abi: &'static Abi) -> UnwindContext<'a> {
        UnwindContext {
            mem: Mem::Safe,
            abi,
            strings: &self.strings,
            frames: &self.frames,
            max_frames: 64,
        }
    }
}

/// Wire `outer`'s frame so its value stack tops out at `inner` and the
/// next bytecode unit is a RESUME marking an await resumption.
fn link_await(img: &mut Image, abi: &Abi, code: VmAddr, frame: VmAddr, lasti: u32, inner: VmAddr) {
    let LastiRule::FromInstrPtr { adjust, .. } = abi.frame_lasti else {
        panic!("embedded generation expected");
    };
    // Unit after the current instruction: RESUME with an await argument.
    let resume_at = img.code_unit_addr(abi, code, lasti + adjust + 1);
    img.put_u8(resume_at, abi.op_resume);
    img.put_u8(resume_at.offset(1), 3);

    img.put_i32(frame.offset(abi.frame_stacktop), 1);
    img.put_usize(frame.offset(abi.frame_localsplus), inner.0);
}

/// Build a task whose coroutine awaits one inner coroutine.
struct TaskParts {
    task: VmAddr,
    outer_gen: VmAddr,
}

fn build_task(
    img: &mut Image,
    abi: &Abi,
    coro_type: VmAddr,
    name: &str,
    loop_addr: VmAddr,
    waiter: VmAddr,
) -> TaskParts {
    let inner_code = img.code_object(abi, "app.py", &format!("{name}_inner"), 10, &[(0, 0); 8]);
    let outer_code = img.code_object(abi, "app.py", &format!("{name}_outer"), 20, &[(0, 0); 8]);

    let (inner_gen, _inner_frame) = img.coroutine(abi, coro_type, inner_code, 1, false);
    let (outer_gen, outer_frame) = img.coroutine(abi, coro_type, outer_code, 2, false);
    link_await(img, abi, outer_code, outer_frame, 2, inner_gen);

    let name_obj = img.string_object(abi, name);
    let task = img.alloc(256);
    img.put_usize(task.offset(abi.task_name), name_obj.0);
    img.put_usize(task.offset(abi.task_coro), outer_gen.0);
    img.put_usize(task.offset(abi.task_loop), loop_addr.0);
    img.put_usize(task.offset(abi.task_fut_waiter), waiter.0);
    TaskParts { task, outer_gen }
}

#[test]
fn test_coroutine_chain_follows_awaits() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");

    let parts = build_task(&mut img, abi, coro_type, "worker", VmAddr(0x10), VmAddr::NULL);
    let coro = CoroutineInfo::read(Mem::Safe, abi, parts.outer_gen, 0).unwrap();

    assert_eq!(coro.origin, parts.outer_gen);
    assert!(coro.frame.is_some());
    let inner = coro.awaited.as_ref().expect("await link followed");
    assert!(inner.awaited.is_none());
    assert!(!inner.is_running);
}

#[test]
fn test_self_awaiting_coroutine_stops() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");

    let code = img.code_object(abi, "app.py", "ouroboros", 1, &[(0, 0); 8]);
    let (gen, frame) = img.coroutine(abi, coro_type, code, 2, false);
    // The coroutine "awaits" itself.
    link_await(&mut img, abi, code, frame, 2, gen);

    let coro = CoroutineInfo::read(Mem::Safe, abi, gen, 0).unwrap();
    assert!(coro.awaited.is_none(), "self link must not recurse");
    let _ = &fixture;
}

#[test]
fn test_non_coroutine_rejected() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let other_type = img.type_object(abi, "list");

    let obj = img.alloc(256);
    img.set_type(abi, obj, other_type);
    assert!(CoroutineInfo::read(Mem::Safe, abi, obj, 0).is_err());
    let _ = &fixture;
}

#[test]
fn test_async_send_trampoline_followed() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");
    let asend_type = img.type_object(abi, abi.asend_type_name);

    let code = img.code_object(abi, "app.py", "agen_step", 4, &[(0, 0); 8]);
    let (gen, _frame) = img.coroutine(abi, coro_type, code, 1, true);

    let asend = img.alloc(64);
    img.set_type(abi, asend, asend_type);
    img.put_usize(asend.offset(abi.asend_gen), gen.0);

    let coro = CoroutineInfo::read(Mem::Safe, abi, asend, 0).unwrap();
    assert_eq!(coro.origin, gen, "trampoline resolves to the wrapped generator");
    assert!(coro.is_running);
    let _ = &fixture;
}

#[test]
fn test_task_read_with_waiter() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");
    let loop_addr = VmAddr(0x6000);

    let inner = build_task(&mut img, abi, coro_type, "inner", loop_addr, VmAddr::NULL);
    let outer = build_task(&mut img, abi, coro_type, "outer", loop_addr, inner.task);

    let task = TaskInfo::read(Mem::Safe, abi, &fixture.strings, outer.task, 0).unwrap();
    assert_eq!(fixture.strings.get(task.name).unwrap(), "outer");
    assert_eq!(task.loop_addr, loop_addr);
    let waiter = task.waiter.as_ref().expect("waiter task materialised");
    assert_eq!(fixture.strings.get(waiter.name).unwrap(), "inner");
    assert!(!task.is_on_cpu());
}

#[test]
fn test_cyclic_waiter_chain_capped() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");
    let loop_addr = VmAddr(0x6000);

    let a = build_task(&mut img, abi, coro_type, "a", loop_addr, VmAddr::NULL);
    let b = build_task(&mut img, abi, coro_type, "b", loop_addr, a.task);
    // Close the cycle: a waits on b, b waits on a.
    img.put_usize(a.task.offset(abi.task_fut_waiter), b.task.0);

    // Termination (via the depth cap) is the property under test.
    let task = TaskInfo::read(Mem::Safe, abi, &fixture.strings, a.task, 0).unwrap();
    let mut depth = 0;
    let mut node: Option<&TaskInfo> = Some(&task);
    while let Some(t) = node {
        depth += 1;
        node = t.waiter.as_deref();
    }
    assert!(depth <= stackscope::tasks::MAX_RECURSION_DEPTH + 2);
}

#[test]
fn test_task_unwind_order_and_leaf_count() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");

    let parts = build_task(&mut img, abi, coro_type, "worker", VmAddr(0x10), VmAddr::NULL);
    let task = TaskInfo::read(Mem::Safe, abi, &fixture.strings, parts.task, 0).unwrap();

    let mut stack: FrameStack = Vec::new();
    let leaf_count = task.unwind(fixture.ctx(abi), &mut stack);

    // Innermost coroutine frames come first.
    let names: Vec<String> = stack.iter().map(|f| fixture.strings.get(f.name).unwrap()).collect();
    assert_eq!(names, ["worker_inner", "worker_outer"]);
    assert_eq!(leaf_count, 1);
}

#[test]
fn test_all_tasks_enumeration() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();
    let coro_type = img.type_object(abi, "coroutine");
    let loop_a = VmAddr(0xa000);
    let loop_b = VmAddr(0xb000);

    let t1 = build_task(&mut img, abi, coro_type, "on_a", loop_a, VmAddr::NULL);
    let t2 = build_task(&mut img, abi, coro_type, "also_on_a", loop_a, VmAddr::NULL);
    let t3 = build_task(&mut img, abi, coro_type, "on_b", loop_b, VmAddr::NULL);

    // Scheduled set holds weak references to the tasks.
    let mut weakrefs = Vec::new();
    for task in [t1.task, t2.task, t3.task] {
        let wr = img.alloc(64);
        img.put_usize(wr.offset(abi.weakref_object), task.0);
        weakrefs.push(wr);
    }

    let slots = 8usize;
    let table = img.alloc(slots * abi.set_entry_size);
    for (i, wr) in weakrefs.iter().enumerate() {
        img.put_usize(table.offset(i * 2 * abi.set_entry_size + abi.set_entry_key), wr.0);
    }
    let sched = img.alloc(64);
    img.put_i64(sched.offset(abi.set_mask), (slots - 1) as i64);
    img.put_usize(sched.offset(abi.set_table), table.0);

    let containers =
        AsyncContainers { current: VmAddr::NULL, scheduled: sched, eager: None };
    let tasks = all_tasks(Mem::Safe, abi, &fixture.strings, &containers, loop_a).unwrap();

    let mut names: Vec<String> =
        tasks.iter().map(|t| fixture.strings.get(t.name).unwrap()).collect();
    names.sort();
    assert_eq!(names, ["also_on_a", "on_a"]);
}
