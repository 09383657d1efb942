//! Naming builtin callables at the leaf of a managed stack.
//!
//! When the runtime parks a non-code callable in an internal trampoline
//! frame, the sample would otherwise end at the caller. Two recovery
//! paths:
//!
//! - the callable carries a method descriptor: read its name and qualify
//!   it with the module or the bound type (`module.method`, `Type.method`);
//! - otherwise, parse a window of the caller's bytecode backwards from the
//!   call site to find what was loaded onto the value stack before the
//!   call, and reassemble the dotted name from the attribute/global loads.
//!
//! Either way the result is a synthetic frame: empty filename, line zero.

use std::sync::Arc;

use crate::domain::{FrameError, VmAddr};
use crate::frame::{self, Frame, FrameCache};
use crate::runtime::{self, abi::Abi};
use crate::strings::{self, StringTable};
use crate::vm::Mem;

// Bytecode units inspected behind the call site.
const BYTECODE_WINDOW: u32 = 20;

// Name tuples larger than this are assumed torn.
const MAX_NAMES: i64 = 10_000;

const MAX_NAME_LEN: usize = 256;

/// Name a callable through its method descriptor.
///
/// # Errors
/// [`FrameError::NoName`] when the callable is not a recognised builtin or
/// carries no usable descriptor; read faults pass through.
pub fn cfunction_descriptor_frame(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    cache: &FrameCache,
    callable: VmAddr,
) -> Result<Arc<Frame>, FrameError> {
    let type_name = runtime::type_name_of(mem, abi, callable)?;
    if type_name != abi.builtin_type_name {
        return Err(FrameError::NoName);
    }

    let methoddef = mem.read_addr(callable.offset(abi.cfunc_ml))?;
    let name_ptr = mem.read_addr(methoddef.offset(abi.methoddef_name))?;
    let method = mem.read_c_str(name_ptr, MAX_NAME_LEN)?;
    if method.is_empty() {
        return Err(FrameError::NoName);
    }

    let module_obj = mem.read_addr(callable.offset(abi.cfunc_module))?;
    let qualified = if !module_obj.is_null() {
        match strings::read_runtime_string(mem, abi, module_obj) {
            Ok(module) if !module.is_empty() => format!("{module}.{method}"),
            _ => method,
        }
    } else {
        let self_obj = mem.read_addr(callable.offset(abi.cfunc_self))?;
        if self_obj.is_null() {
            method
        } else {
            match runtime::type_name_of(mem, abi, self_obj) {
                Ok(bound) if !bound.is_empty() => format!("{bound}.{method}"),
                _ => method,
            }
        }
    };

    Ok(frame::resolve_synthetic(strings, cache, &qualified))
}

/// Reconstruct the call target from the caller's bytecode.
///
/// Walks backwards from the current instruction, skipping inline-cache
/// slots, null pushes and local loads; collects at most one attribute name
/// and one global name; stops at an earlier call instruction or once the
/// global load anchors the expression.
///
/// # Errors
/// [`FrameError::NoName`] when no load sequence is recognisable.
pub fn infer_cfunction_frame(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    cache: &FrameCache,
    frame_addr: VmAddr,
    code: VmAddr,
) -> Result<Arc<Frame>, FrameError> {
    let lasti = frame::frame_lasti(mem, abi, frame_addr, code)?;

    let start = lasti.saturating_sub(BYTECODE_WINDOW);
    let mut units: Vec<(u8, u8)> = Vec::with_capacity((lasti - start + 1) as usize);
    for index in start..=lasti {
        units.push(frame::read_code_unit(mem, abi, code, index)?);
    }

    // Find the call instruction at or just before the current position.
    let Some(call_idx) = units
        .iter()
        .rposition(|(op, _)| abi.op_calls.contains(op))
    else {
        return Err(FrameError::NoName);
    };

    let mut attr_name: Option<String> = None;
    let mut global_name: Option<String> = None;

    for &(op, arg) in units[..call_idx].iter().rev() {
        if op == abi.op_cache || op == abi.op_push_null || op == abi.op_load_fast {
            continue;
        }
        if abi.op_calls.contains(&op) {
            // A nested call ends the load sequence we care about.
            break;
        }
        if op == abi.op_load_attr {
            if attr_name.is_none() {
                attr_name = read_name(mem, abi, code, arg);
            }
        } else if op == abi.op_load_global {
            global_name = read_name(mem, abi, code, arg);
            break;
        }
    }

    let qualified = match (global_name, attr_name) {
        (Some(g), Some(a)) => format!("{g}.{a}"),
        (Some(g), None) => g,
        (None, Some(a)) => a,
        (None, None) => return Err(FrameError::NoName),
    };

    Ok(frame::resolve_synthetic(strings, cache, &qualified))
}

/// Fetch entry `arg` of the code object's name tuple. Load arguments carry
/// a flag in the low bit on the newer encodings, so retry unshifted when
/// the shifted index is out of range.
fn read_name(mem: Mem, abi: &Abi, code: VmAddr, arg: u8) -> Option<String> {
    let names = mem.read_addr(code.offset(abi.code_names)).ok()?;
    let count = mem.read_i64(names.offset(abi.tuple_size)).ok()?;
    if count <= 0 || count > MAX_NAMES {
        return None;
    }

    let mut index = i64::from(arg >> 1);
    if index >= count {
        index = i64::from(arg);
        if index >= count {
            return None;
        }
    }

    #[allow(clippy::cast_sign_loss)]
    let item = mem
        .read_addr(names.offset(abi.tuple_items + (index as usize) * 8))
        .ok()?;
    strings::read_runtime_string(mem, abi, item).ok().filter(|s| !s.is_empty())
}
