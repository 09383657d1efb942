//! Managed-frame unwinding against fabricated runtime images.

mod common;

use common::Image;
use stackscope::domain::VmAddr;
use stackscope::frame::FrameCache;
use stackscope::runtime::{abi, RuntimeVersion};
use stackscope::stacks::{unwind_frames, unwind_thread, FrameStack, UnwindContext};
use stackscope::strings::StringTable;
use stackscope::vm::{self, Mem, VmReadMode};

fn v12() -> &'static abi::Abi {
    abi::lookup(RuntimeVersion { major: 3, minor: 12 }).unwrap()
}

fn v13() -> &'static abi::Abi {
    abi::lookup(RuntimeVersion { major: 3, minor: 13 }).unwrap()
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

    fn ctx<'a>(&'a self, abi: &'static abi::Abi) -> UnwindContext<'a> {
        UnwindContext {
            mem: Mem::Safe,
            abi,
            strings: &self.strings,
            frames: &self.frames,
            max_frames: 64,
        }
    }

    fn names(&self, stack: &FrameStack) -> Vec<String> {
        stack.iter().map(|f| self.strings.get(f.name).unwrap()).collect()
    }
}

#[test]
fn test_unwind_linear_chain() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();

    // a calls b calls c; c is the leaf.
    let code_a = img.code_object(abi, "app.py", "a", 10, &[(0, 0); 8]);
    let code_b = img.code_object(abi, "app.py", "b", 20, &[(0, 0); 8]);
    let code_c = img.code_object(abi, "app.py", "c", 30, &[(0, 0); 8]);
    let frame_a = img.frame(abi, code_a, 1, VmAddr::NULL, false);
    let frame_b = img.frame(abi, code_b, 2, frame_a, false);
    let frame_c = img.frame(abi, code_c, 3, frame_b, false);

    let mut stack: FrameStack = Vec::new();
    let added = unwind_frames(fixture.ctx(abi), frame_c, None, &mut stack);

    assert_eq!(added, 3);
    assert_eq!(fixture.names(&stack), ["c", "b", "a"]);
    // Locations fall back to the first line with an empty location table.
    assert_eq!(stack[0].location.line, 30);
    assert!(stack.iter().all(|f| !f.key.is_invalid()));
}

#[test]
fn test_unwind_from_thread_state() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();

    let code = img.code_object(abi, "app.py", "loop_body", 5, &[(0, 0); 4]);
    let frame = img.frame(abi, code, 0, VmAddr::NULL, false);
    let tstate = img.tstate(abi, 0x77, frame);

    let mut stack: FrameStack = Vec::new();
    unwind_thread(fixture.ctx(abi), tstate, None, &mut stack);
    assert_eq!(fixture.names(&stack), ["loop_body"]);
}

#[test]
fn test_cycle_terminates_with_invalid() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();

    let code = img.code_object(abi, "app.py", "looper", 1, &[(0, 0); 4]);
    let frame = img.frame(abi, code, 0, VmAddr::NULL, false);
    // The frame's previous link points back at itself.
    img.put_usize(frame.offset(abi.frame_previous), frame.0);

    let mut stack: FrameStack = Vec::new();
    unwind_frames(fixture.ctx(abi), frame, None, &mut stack);

    assert_eq!(stack.len(), 2);
    assert!(!stack[0].key.is_invalid());
    assert!(stack[1].key.is_invalid());
    // No two real frames share a frame address by construction.
}

#[test]
fn test_invalid_pointer_yields_single_invalid_frame() {
    let fixture = Fixture::new();
    let abi = v12();

    let mut stack: FrameStack = Vec::new();
    unwind_frames(fixture.ctx(abi), VmAddr(0x8), None, &mut stack);
    assert_eq!(stack.len(), 1);
    assert!(stack[0].key.is_invalid());
}

#[test]
fn test_depth_bound() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();

    let code = img.code_object(abi, "deep.py", "recurse", 1, &[(0, 0); 4]);
    let mut previous = VmAddr::NULL;
    let mut leaf = VmAddr::NULL;
    for _ in 0..200 {
        leaf = img.frame(abi, code, 0, previous, false);
        previous = leaf;
    }

    let mut stack: FrameStack = Vec::new();
    let mut ctx = fixture.ctx(abi);
    ctx.max_frames = 50;
    unwind_frames(ctx, leaf, None, &mut stack);
    assert_eq!(stack.len(), 50);
}

#[test]
fn test_shim_frames_marked_and_kept() {
    let fixture = Fixture::new();
    let abi = v12();
    let mut img = Image::new();

    let code_entry = img.code_object(abi, "rt.py", "entry", 1, &[(0, 0); 4]);
    let code_user = img.code_object(abi, "app.py", "user", 2, &[(0, 0); 4]);
    let frame_entry = img.frame(abi, code_entry, 0, VmAddr::NULL, true);
    let frame_user = img.frame(abi, code_user, 0, frame_entry, false);

    let mut stack: FrameStack = Vec::new();
    unwind_frames(fixture.ctx(abi), frame_user, None, &mut stack);

    assert_eq!(stack.len(), 2);
    assert!(!stack[0].is_shim);
    assert!(stack[1].is_shim, "trampoline frames stay in the sequence, marked");
}

#[test]
fn test_non_code_executable_skipped() {
    let fixture = Fixture::new();
    let abi = v13();
    let mut img = Image::new();

    let code_type = img.type_object(abi, abi.code_type_name);
    let other_type = img.type_object(abi, "builtin_function_or_method");

    let code = img.code_object(abi, "app.py", "caller", 7, &[(0, 0); 8]);
    img.set_type(abi, code, code_type);

    // A callable with no recoverable descriptor fields (null method def).
    let callable = img.alloc(64);
    img.set_type(abi, callable, other_type);

    let genuine = img.frame(abi, code, 1, VmAddr::NULL, false);
    let trampoline = img.frame(abi, callable, 0, genuine, false);
    // The trampoline's executable slot holds the callable, not code.
    img.put_usize(trampoline.offset(abi.frame_executable), callable.0);

    let mut stack: FrameStack = Vec::new();
    unwind_frames(fixture.ctx(abi), trampoline, None, &mut stack);

    let names = fixture.names(&stack);
    assert!(names.contains(&"caller".to_owned()), "{names:?}");
    assert!(!stack.is_empty());
}

#[test]
fn test_leaf_callable_named_from_descriptor() {
    let fixture = Fixture::new();
    let abi = v13();
    let mut img = Image::new();

    let code_type = img.type_object(abi, abi.code_type_name);
    let builtin_type = img.type_object(abi, abi.builtin_type_name);

    let code = img.code_object(abi, "app.py", "caller", 7, &[(0, 0); 8]);
    img.set_type(abi, code, code_type);

    // Callable with a method descriptor: name "sin", module "math".
    let method_name = img.alloc(8);
    img.put_bytes(method_name, b"sin");
    let methoddef = img.alloc(32);
    img.put_usize(methoddef.offset(abi.methoddef_name), method_name.0);
    let module_obj = img.string_object(abi, "math");

    let callable = img.alloc(64);
    img.set_type(abi, callable, builtin_type);
    img.put_usize(callable.offset(abi.cfunc_ml), methoddef.0);
    img.put_usize(callable.offset(abi.cfunc_module), module_obj.0);

    let genuine = img.frame(abi, code, 1, VmAddr::NULL, false);
    let trampoline = img.frame(abi, callable, 0, genuine, false);
    img.put_usize(trampoline.offset(abi.frame_executable), callable.0);

    let mut stack: FrameStack = Vec::new();
    unwind_frames(fixture.ctx(abi), trampoline, None, &mut stack);

    let names = fixture.names(&stack);
    assert_eq!(names[0], "math.sin", "synthetic frame for the builtin call: {names:?}");
    assert_eq!(names[1], "caller");
    // Synthetic frames carry no file or line.
    assert_eq!(fixture.strings.get(stack[0].filename).unwrap(), "");
    assert_eq!(stack[0].location.line, 0);
}
