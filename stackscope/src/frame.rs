//! Resolved frames and the bounded frame cache.
//!
//! A [`Frame`] is immutable once constructed: two string keys, a source
//! location, and a shim flag. Resolution is cached by frame identity so a
//! hot call site is decoded once and referenced by key afterwards.

use std::sync::{Arc, Mutex, OnceLock};

use crate::cache::LruCache;
use crate::domain::{FrameError, FrameKey, StringKey, VmAddr, VmError};
use crate::runtime::abi::{Abi, CodeBody, LineTable};
use crate::strings::{self, StringTable};
use crate::vm::Mem;

// Location tables beyond this are assumed corrupt.
const MAX_LINETABLE: usize = 1 << 16;

/// Source span of one frame. Zero means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub line_end: u32,
    pub column: u32,
    pub column_end: u32,
}

/// One resolved activation record.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Cache identity; stable for the life of the process. Zero marks the
    /// invalid-frame sentinel.
    pub key: FrameKey,
    pub filename: StringKey,
    pub name: StringKey,
    pub location: Location,
    /// Internal trampoline inserted by the runtime: hidden from rendered
    /// output but kept in sequences so native interleaving lines up.
    pub is_shim: bool,
}

/// The sentinel appended when a walk hits unreadable memory.
pub fn invalid_frame() -> Arc<Frame> {
    static INVALID: OnceLock<Arc<Frame>> = OnceLock::new();
    INVALID
        .get_or_init(|| {
            Arc::new(Frame {
                key: FrameKey::INVALID,
                filename: strings::INVALID,
                name: strings::INVALID,
                location: Location::default(),
                is_shim: false,
            })
        })
        .clone()
}

/// Identity of a managed frame: code identity and instruction index.
#[must_use]
pub fn managed_key(code: VmAddr, lasti: u32) -> FrameKey {
    FrameKey(((code.0 as u64) << 16) | u64::from(lasti & 0xffff))
}

/// Bounded LRU of resolved frames.
///
/// Single logical writer (the sampler); the allocation path also resolves
/// frames, serialised by the runtime's execution lock around allocations.
pub struct FrameCache {
    inner: Mutex<LruCache<FrameKey, Arc<Frame>>>,
}

impl FrameCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    #[must_use]
    pub fn get(&self, key: FrameKey) -> Option<Arc<Frame>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn store(&self, frame: Arc<Frame>) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(frame.key, frame);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .capacity()
    }
}

/// Resolve a managed frame from its code object and instruction index,
/// yielding the invalid sentinel when the code object cannot be read.
pub fn resolve_code_frame(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    cache: &FrameCache,
    code: VmAddr,
    lasti: u32,
) -> Arc<Frame> {
    let key = managed_key(code, lasti);
    if let Some(hit) = cache.get(key) {
        return hit;
    }
    match build_code_frame(mem, abi, strings, code, lasti) {
        Ok(mut frame) => {
            frame.key = key;
            let frame = Arc::new(frame);
            cache.store(frame.clone());
            frame
        }
        Err(e) => {
            log::debug!("frame resolution failed for code {code}: {e}");
            invalid_frame()
        }
    }
}

/// Resolve a synthetic frame (task names, inferred callables). The frame
/// key is the name key itself; the filename is empty and the line zero.
pub fn resolve_synthetic(strings: &StringTable, cache: &FrameCache, name: &str) -> Arc<Frame> {
    let name_key = strings.key_for_content(name);
    let key = FrameKey(name_key.0);
    if let Some(hit) = cache.get(key) {
        return hit;
    }
    let frame = Arc::new(Frame {
        key,
        filename: strings.key_for_content(""),
        name: name_key,
        location: Location::default(),
        is_shim: false,
    });
    cache.store(frame.clone());
    frame
}

/// Variant of [`resolve_synthetic`] for a name that is already interned
/// (task names resolved from runtime string objects).
pub fn resolve_synthetic_key(
    strings: &StringTable,
    cache: &FrameCache,
    name_key: StringKey,
) -> Arc<Frame> {
    let key = FrameKey(name_key.0);
    if let Some(hit) = cache.get(key) {
        return hit;
    }
    let frame = Arc::new(Frame {
        key,
        filename: strings.key_for_content(""),
        name: name_key,
        location: Location::default(),
        is_shim: false,
    });
    cache.store(frame.clone());
    frame
}

fn build_code_frame(
    mem: Mem,
    abi: &Abi,
    strings: &StringTable,
    code: VmAddr,
    lasti: u32,
) -> Result<Frame, FrameError> {
    let filename_obj = mem.read_addr(code.offset(abi.code_filename))?;
    let qualname_obj = mem.read_addr(code.offset(abi.code_qualname))?;

    let filename = strings
        .key_for_object(mem, abi, filename_obj)
        .unwrap_or(strings::UNKNOWN);
    let name = strings
        .key_for_object(mem, abi, qualname_obj)
        .unwrap_or(strings::UNKNOWN);

    let location = infer_location(mem, abi, code, lasti).unwrap_or_default();

    Ok(Frame { key: FrameKey::INVALID, filename, name, location, is_shim: false })
}

/// Instruction index of a frame, per the version's rule.
///
/// # Errors
/// Read faults on the frame or the code body pointer.
pub fn frame_lasti(mem: Mem, abi: &Abi, frame: VmAddr, code: VmAddr) -> Result<u32, VmError> {
    use crate::runtime::abi::LastiRule;
    match abi.frame_lasti {
        LastiRule::Direct(offset) => {
            let v = mem.read_i32(frame.offset(offset))?;
            Ok(u32::try_from(v).unwrap_or(0))
        }
        LastiRule::FromInstrPtr { offset, adjust } => {
            let instr = mem.read_usize(frame.offset(offset))?;
            let base = code_body_base(mem, abi, code)?;
            if instr <= base.0 {
                return Ok(0);
            }
            let units = ((instr - base.0) / 2) as u32;
            Ok(units.saturating_sub(adjust))
        }
    }
}

/// Start address of a code object's bytecode.
///
/// # Errors
/// Read faults on the indirect bytes object.
pub fn code_body_base(mem: Mem, abi: &Abi, code: VmAddr) -> Result<VmAddr, VmError> {
    match abi.code_body {
        CodeBody::Inline(offset) => Ok(code.offset(offset)),
        CodeBody::Bytes(offset) => {
            let bytes_obj = mem.read_addr(code.offset(offset))?;
            Ok(bytes_obj.offset(abi.bytes_data))
        }
    }
}

/// Read one bytecode unit `(opcode, arg)` at a unit index.
///
/// # Errors
/// Read faults on the code body.
pub fn read_code_unit(mem: Mem, abi: &Abi, code: VmAddr, index: u32) -> Result<(u8, u8), VmError> {
    let base = code_body_base(mem, abi, code)?;
    let mut unit = [0u8; 2];
    mem.read_into(base.offset(index as usize * 2), &mut unit)?;
    Ok((unit[0], unit[1]))
}

fn infer_location(mem: Mem, abi: &Abi, code: VmAddr, lasti: u32) -> Result<Location, FrameError> {
    let firstlineno = mem.read_i32(code.offset(abi.code_firstlineno))?;
    let table_obj = mem.read_addr(code.offset(abi.code_linetable))?;
    let len = mem.read_i64(table_obj.offset(abi.bytes_size))?;
    let len = usize::try_from(len).unwrap_or(0);
    if len == 0 || len > MAX_LINETABLE {
        return Ok(Location {
            line: u32::try_from(firstlineno).unwrap_or(0),
            line_end: u32::try_from(firstlineno).unwrap_or(0),
            ..Location::default()
        });
    }
    let table = mem.read_bytes(table_obj.offset(abi.bytes_data), len)?;

    let location = match abi.lines {
        LineTable::Packed => decode_packed(&table, firstlineno, lasti),
        LineTable::Legacy => decode_legacy(&table, firstlineno, lasti),
    };
    Ok(location)
}

/// Decode the packed location table up to the entry covering `lasti`.
///
/// Each entry starts with a byte carrying a 3-bit code-unit count and a
/// 4-bit form code; forms 13 and 14 continue with the 6-bit varints read
/// by [`loc_varint`].
fn decode_packed(table: &[u8], firstlineno: i32, lasti: u32) -> Location {
    let mut location = Location::default();
    let mut lineno = firstlineno;
    let mut bc: u32 = 0;
    let mut i = 0usize;

    while i < table.len() {
        bc += u32::from(table[i] & 7) + 1;
        let code = (table[i] >> 3) & 15;
        match code {
            15 => {
                // No location for this range.
            }
            14 => {
                lineno += loc_signed_varint(table, &mut i);
                location.line = u32::try_from(lineno).unwrap_or(0);
                location.line_end = location.line + loc_varint(table, &mut i);
                location.column = loc_varint(table, &mut i);
                location.column_end = loc_varint(table, &mut i);
            }
            13 => {
                lineno += loc_signed_varint(table, &mut i);
                location.line = u32::try_from(lineno).unwrap_or(0);
                location.line_end = location.line;
                location.column = 0;
                location.column_end = 0;
            }
            10..=12 => {
                lineno += i32::from(code) - 10;
                location.line = u32::try_from(lineno).unwrap_or(0);
                location.line_end = location.line;
                location.column = 1 + u32::from(next_byte(table, &mut i));
                location.column_end = 1 + u32::from(next_byte(table, &mut i));
            }
            _ => {
                let second = next_byte(table, &mut i);
                location.line = u32::try_from(lineno).unwrap_or(0);
                location.line_end = location.line;
                location.column = 1 + (u32::from(code) << 3) + (u32::from(second >> 4) & 7);
                location.column_end = location.column + u32::from(second & 15);
            }
        }
        if bc > lasti {
            break;
        }
        i += 1;
    }

    location
}

/// Decode the legacy (address delta, line delta) pair table.
fn decode_legacy(table: &[u8], firstlineno: i32, lasti: u32) -> Location {
    let mut lineno = firstlineno;
    let mut bc: u32 = 0;
    let mut i = 0usize;

    while i + 1 < table.len() {
        bc += u32::from(table[i]);
        if bc > lasti {
            break;
        }
        let delta = table[i + 1];
        if delta >= 0x80 {
            lineno -= 0x100;
        }
        lineno += i32::from(delta);
        i += 2;
    }

    let line = u32::try_from(lineno).unwrap_or(0);
    Location { line, line_end: line, column: 0, column_end: 0 }
}

/// Read the next 6-bit varint from a packed location table, advancing past
/// the current byte first.
fn loc_varint(table: &[u8], i: &mut usize) -> u32 {
    if *i + 1 >= table.len() {
        return 0;
    }
    *i += 1;
    let mut value = u32::from(table[*i] & 63);
    let mut shift = 0;
    while table[*i] & 64 != 0 {
        if *i + 1 >= table.len() {
            break;
        }
        *i += 1;
        shift += 6;
        value |= u32::from(table[*i] & 63) << shift;
    }
    value
}

fn loc_signed_varint(table: &[u8], i: &mut usize) -> i32 {
    let value = loc_varint(table, i);
    #[allow(clippy::cast_possible_wrap)]
    if value & 1 != 0 {
        -((value >> 1) as i32)
    } else {
        (value >> 1) as i32
    }
}

fn next_byte(table: &[u8], i: &mut usize) -> u8 {
    if *i + 1 >= table.len() {
        return 0;
    }
    *i += 1;
    table[*i]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_key_packs_identity_and_index() {
        let key = managed_key(VmAddr(0xabcd), 0x12);
        assert_eq!(key.0, (0xabcd << 16) | 0x12);
        // Indices are truncated to 16 bits rather than bleeding into the
        // code identity.
        let key = managed_key(VmAddr(0x1), 0x1_0002);
        assert_eq!(key.0, (0x1 << 16) | 0x2);
    }

    #[test]
    fn test_invalid_frame_sentinel() {
        let f = invalid_frame();
        assert!(f.key.is_invalid());
        assert_eq!(f.name, crate::strings::INVALID);
    }

    #[test]
    fn test_loc_varint_single_byte() {
        // Values 0..=63 fit in one byte after the lead byte.
        let table = [0xff, 0x00, 0xff];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 0);
        assert_eq!(i, 1);

        let table = [0xff, 63, 0xff];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 63);
        assert_eq!(i, 1);
    }

    #[test]
    fn test_loc_varint_multi_byte() {
        // Continuation bit is 0x40; later bytes carry 6 bits each.
        let table = [0xff, 0x40, 1];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 64);
        assert_eq!(i, 2);

        let table = [0xff, 0x40 | 63, 1];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 63 + 64);

        let table = [0xff, 0x40 | 63, 0x40 | 63, 1];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 63 + (63 << 6) + (1 << 12));
        assert_eq!(i, 3);
    }

    #[test]
    fn test_loc_varint_truncated_table() {
        let table = [0xff];
        let mut i = 0;
        assert_eq!(loc_varint(&table, &mut i), 0);
        assert_eq!(i, 0);
    }

    #[test]
    fn test_loc_signed_varint() {
        // Zigzag: even is positive, odd is negative.
        for (encoded, expected) in [(0u8, 0i32), (2, 1), (20, 10), (1, -0), (3, -1), (19, -9)] {
            let table = [0xff, encoded];
            let mut i = 0;
            assert_eq!(loc_signed_varint(&table, &mut i), expected, "encoded {encoded}");
        }
    }

    #[test]
    fn test_decode_legacy_walks_pairs() {
        // Pairs of (bytecode delta, line delta).
        let table = [2u8, 1, 2, 1, 2, 1];
        assert_eq!(decode_legacy(&table, 10, 0).line, 11);
        assert_eq!(decode_legacy(&table, 10, 2).line, 12);
        assert_eq!(decode_legacy(&table, 10, 100).line, 13);
    }

    #[test]
    fn test_decode_packed_no_location_form() {
        // Form 15 yields no location at all.
        let table = [(15 << 3) | 7, 0];
        let loc = decode_packed(&table, 5, 0);
        assert_eq!(loc.line, 0);
    }

    #[test]
    fn test_decode_packed_short_form_columns() {
        // Form code < 10: columns derive from the code and the next byte.
        let code: u8 = 4;
        let second: u8 = 0x25; // column low bits 2, span 5
        let table = [(code << 3) | 1, second];
        let loc = decode_packed(&table, 7, 0);
        assert_eq!(loc.line, 7);
        assert_eq!(loc.column, 1 + (u32::from(code) << 3) + 2);
        assert_eq!(loc.column_end, loc.column + 5);
    }

    #[test]
    fn test_frame_cache_bounds() {
        let cache = FrameCache::new(2);
        for i in 1..=5u64 {
            cache.store(Arc::new(Frame {
                key: FrameKey(i),
                filename: crate::strings::UNKNOWN,
                name: crate::strings::UNKNOWN,
                location: Location::default(),
                is_shim: false,
            }));
            assert!(cache.len() <= 2);
        }
        assert!(cache.get(FrameKey(5)).is_some());
        assert!(cache.get(FrameKey(1)).is_none());
    }
}
