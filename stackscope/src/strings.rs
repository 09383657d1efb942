//! Process-wide string interning.
//!
//! Every filename, scope name and task name flows through here once and is
//! referenced by key afterwards. Keys are stable for the life of the
//! process and derive from one of three sources:
//!
//! - a runtime string object's identity (its address),
//! - a native program counter,
//! - the content hash of an arbitrary string.
//!
//! Two reserved keys distinguish the INVALID and UNKNOWN sentinels.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{StringError, StringKey, VmAddr};
use crate::runtime::abi::Abi;
use crate::vm::Mem;

/// Sentinel for strings that could not be materialised at all.
pub const INVALID: StringKey = StringKey(1);
/// Sentinel substituted when a key cannot be resolved.
pub const UNKNOWN: StringKey = StringKey(2);

const RESERVED_MAX: u64 = 2;

// Runtime string payloads beyond this are refused rather than copied.
const MAX_STRING_LEN: usize = 1024;

pub struct StringTable {
    map: Mutex<HashMap<StringKey, String>>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(INVALID, "<invalid>".to_owned());
        map.insert(UNKNOWN, "<unknown>".to_owned());
        Self { map: Mutex::new(map) }
    }

    /// Register `value` under `key`. Idempotent: re-registration with a
    /// different value is ignored and logged.
    pub fn register(&self, key: StringKey, value: &str) -> StringKey {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match map.get(&key) {
            Some(existing) if existing != value => {
                log::debug!("string key {key:?} already bound to {existing:?}, ignoring {value:?}");
            }
            Some(_) => {}
            None => {
                map.insert(key, value.to_owned());
            }
        }
        key
    }

    /// Key for an arbitrary string, derived from its content.
    pub fn key_for_content(&self, value: &str) -> StringKey {
        let key = content_key(value);
        self.register(key, value)
    }

    /// Key for a runtime string object, derived from its identity. On the
    /// first sighting the payload is copied out of the runtime and
    /// registered.
    ///
    /// # Errors
    /// Read faults and oversized payloads; the caller substitutes
    /// [`UNKNOWN`].
    pub fn key_for_object(
        &self,
        mem: Mem,
        abi: &Abi,
        addr: VmAddr,
    ) -> Result<StringKey, StringError> {
        let key = StringKey(addr.0 as u64);
        if self.contains(key) {
            return Ok(key);
        }
        let value = read_runtime_string(mem, abi, addr)?;
        Ok(self.register(key, &value))
    }

    /// Key for a native program counter. The resolver runs once per PC.
    pub fn key_for_pc<F>(&self, pc: usize, resolve: F) -> StringKey
    where
        F: FnOnce() -> String,
    {
        let key = StringKey(pc as u64);
        if self.contains(key) {
            return key;
        }
        self.register(key, &resolve())
    }

    #[must_use]
    pub fn contains(&self, key: StringKey) -> bool {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&key)
    }

    #[must_use]
    pub fn get(&self, key: StringKey) -> Option<String> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// # Errors
    /// [`StringError::Unregistered`] when the key was never registered.
    pub fn lookup(&self, key: StringKey) -> Result<String, StringError> {
        self.get(key).ok_or(StringError::Unregistered(key))
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

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a runtime string object's payload.
///
/// The runtime stores short strings inline after a fixed header; the length
/// field counts code points, which for the compact ASCII form this targets
/// equals the byte count.
///
/// # Errors
/// Read faults, oversized and non-UTF-8 payloads.
pub fn read_runtime_string(mem: Mem, abi: &Abi, addr: VmAddr) -> Result<String, StringError> {
    let len = mem.read_i64(addr.offset(abi.str_len))?;
    let len = usize::try_from(len).map_err(|_| StringError::Oversized(0))?;
    if len > MAX_STRING_LEN {
        return Err(StringError::Oversized(len));
    }
    if len == 0 {
        return Ok(String::new());
    }
    let bytes = mem.read_bytes(addr.offset(abi.str_data), len)?;
    String::from_utf8(bytes).map_err(|_| StringError::Utf8)
}

/// FNV-1a over the content, nudged out of the reserved key range.
fn content_key(value: &str) -> StringKey {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in value.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    if hash <= RESERVED_MAX {
        hash += RESERVED_MAX + 1;
    }
    StringKey(hash)
}
