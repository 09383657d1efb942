//! Native stack capture and symbolisation.
//!
//! Capture and resolution are split: program counters are collected with
//! the unsynchronised walker (safe inside a signal handler, no allocation),
//! and turned into frames later on the sampler thread, where symbolisation
//! and interning may allocate freely.

#![allow(unsafe_code)]

use std::sync::Arc;

use rustc_demangle::demangle;

use crate::domain::FrameKey;
use crate::frame::{Frame, FrameCache, Location};
use crate::strings::StringTable;

/// Collect program counters of the current thread, leaf first. Returns the
/// number captured; stops when `out` is full.
pub fn capture_pcs(out: &mut [usize]) -> usize {
    let mut n = 0;
    // SAFETY: trace_unsynchronized is safe here because the closure does
    // not allocate or lock, and concurrent unwinds from other threads are
    // prevented by the capture handshake.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if n >= out.len() {
                return false;
            }
            out[n] = frame.ip() as usize;
            n += 1;
            true
        });
    }
    n
}

/// Resolve one program counter into a frame.
///
/// The scope name is interned under the PC itself; unsymbolisable entries
/// keep an empty scope and are recognisable by their `native@` filename.
/// The line number carries the offset from the symbol start.
pub fn resolve_pc(strings: &StringTable, cache: &FrameCache, pc: usize) -> Arc<Frame> {
    let key = FrameKey(pc as u64);
    if let Some(hit) = cache.get(key) {
        return hit;
    }

    let mut symbol_name: Option<String> = None;
    let mut symbol_base: Option<usize> = None;
    // SAFETY: resolution runs on the sampler thread only, serialised with
    // any in-signal unwinding by the capture handshake.
    unsafe {
        backtrace::resolve_unsynchronized(pc as *mut std::ffi::c_void, |symbol| {
            if symbol_name.is_none() {
                symbol_name = symbol.name().map(|n| demangle_symbol(&n.to_string()));
                symbol_base = symbol.addr().map(|a| a as usize);
            }
        });
    }

    let name_key = match &symbol_name {
        Some(name) => strings.key_for_pc(pc, || name.clone()),
        None => strings.key_for_content(""),
    };
    let filename_key = strings.key_for_content(&format!("native@{pc:#x}"));
    let offset = symbol_base.map_or(0, |base| pc.saturating_sub(base));

    let frame = Arc::new(Frame {
        key,
        filename: filename_key,
        name: name_key,
        location: Location {
            line: u32::try_from(offset).unwrap_or(0),
            line_end: 0,
            column: 0,
            column_end: 0,
        },
        is_shim: false,
    });
    cache.store(frame.clone());
    frame
}

/// Demangle a native symbol name.
#[must_use]
pub fn demangle_symbol(symbol: &str) -> String {
    format!("{:#}", demangle(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_walks_own_stack() {
        let mut pcs = [0usize; 64];
        let n = capture_pcs(&mut pcs);
        assert!(n > 2, "expected a non-trivial stack, got {n}");
        assert!(pcs[..n].iter().all(|&pc| pc != 0));
    }

    #[test]
    fn test_capture_respects_buffer_bound() {
        let mut pcs = [0usize; 2];
        let n = capture_pcs(&mut pcs);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_resolve_pc_shapes_frame() {
        let strings = StringTable::new();
        let cache = FrameCache::new(16);

        let mut pcs = [0usize; 8];
        let n = capture_pcs(&mut pcs);
        assert!(n > 0);

        let frame = resolve_pc(&strings, &cache, pcs[0]);
        assert_eq!(frame.key, FrameKey(pcs[0] as u64));
        let filename = strings.get(frame.filename).unwrap();
        assert!(filename.starts_with("native@0x"), "{filename}");

        // Resolution is cached.
        let again = resolve_pc(&strings, &cache, pcs[0]);
        assert!(Arc::ptr_eq(&frame, &again));
    }

    #[test]
    fn test_demangle_rust_symbol() {
        let plain = demangle_symbol("_ZN4core3ptr13drop_in_place17h1234567890abcdefE");
        assert!(plain.contains("core::ptr::drop_in_place"), "{plain}");
        // Unmangled names pass through.
        assert_eq!(demangle_symbol("main"), "main");
    }
}
