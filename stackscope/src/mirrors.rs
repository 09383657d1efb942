//! Bounded mirrored copies of runtime containers.
//!
//! The task enumerators need to iterate a dictionary and a couple of sets
//! owned by the runtime. Rather than chase entry pointers one by one while
//! the owner mutates them, the backing storage is copied wholesale (capped
//! at 1 MiB) and iterated locally. The copy can still be internally
//! inconsistent if it races a resize; the callers tolerate a missed or
//! garbage entry, which the per-task reads then reject.

use crate::domain::{MirrorError, VmAddr};
use crate::runtime::abi::{Abi, DictIndex};
use crate::vm::Mem;

const MIRROR_BOUND: usize = 1 << 20;

/// Snapshot of a runtime dictionary's entries, keyed by object identity.
pub struct MirrorDict {
    entries: Vec<(VmAddr, VmAddr)>,
}

impl MirrorDict {
    /// # Errors
    /// Read faults on the headers or storage, or storage past the bound.
    pub fn create(mem: Mem, abi: &Abi, dict: VmAddr) -> Result<Self, MirrorError> {
        let keys_ptr = mem.read_addr(dict.offset(abi.dict_keys))?;
        let values_ptr = mem.read_addr(dict.offset(abi.dict_values))?;

        let nentries = mem.read_i64(keys_ptr.offset(abi.dictkeys_nentries))?;
        let nentries = usize::try_from(nentries).map_err(|_| MirrorError::Oversized(0))?;

        let index_bytes = match abi.dict_index {
            DictIndex::Log2 { offset } => {
                let log2 = mem.read_u8(keys_ptr.offset(offset))?;
                if log2 > 32 {
                    return Err(MirrorError::Oversized(1usize.checked_shl(log2.into()).unwrap_or(usize::MAX)));
                }
                1usize << log2
            }
            DictIndex::Flat { size_offset } => {
                let size = mem.read_i64(keys_ptr.offset(size_offset))?;
                usize::try_from(size).map_err(|_| MirrorError::Oversized(0))? * 8
            }
        };

        let entries_base = abi.dictkeys_header + index_bytes;
        let total = entries_base + nentries * abi.dict_entry_size;
        if total > MIRROR_BOUND {
            return Err(MirrorError::Oversized(total));
        }
        let storage = mem.read_bytes(keys_ptr, total)?;

        // Split-layout dictionaries keep the values in a separate array.
        let split_values = if values_ptr.is_null() {
            None
        } else {
            let len = nentries * 8;
            if len > MIRROR_BOUND {
                return Err(MirrorError::Oversized(len));
            }
            Some(mem.read_bytes(values_ptr, len)?)
        };

        let mut entries = Vec::with_capacity(nentries);
        for i in 0..nentries {
            let at = entries_base + i * abi.dict_entry_size;
            let key = read_word(&storage, at + abi.dict_entry_key);
            if key == 0 {
                continue;
            }
            let value = match &split_values {
                Some(values) => read_word(values, i * 8),
                None => read_word(&storage, at + abi.dict_entry_value),
            };
            entries.push((VmAddr(key), VmAddr(value)));
        }

        Ok(Self { entries })
    }

    /// Value for a key, compared by object identity.
    #[must_use]
    pub fn get(&self, key: VmAddr) -> Option<VmAddr> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot of a runtime set's live slots.
#[derive(Debug)]
pub struct MirrorSet {
    items: Vec<VmAddr>,
}

impl MirrorSet {
    /// # Errors
    /// Read faults on the header or table, or a table past the bound.
    pub fn create(mem: Mem, abi: &Abi, set: VmAddr) -> Result<Self, MirrorError> {
        let mask = mem.read_i64(set.offset(abi.set_mask))?;
        let slots = usize::try_from(mask).map_err(|_| MirrorError::Oversized(0))? + 1;
        let table_ptr = mem.read_addr(set.offset(abi.set_table))?;

        let total = slots * abi.set_entry_size;
        if total > MIRROR_BOUND {
            return Err(MirrorError::Oversized(total));
        }
        let storage = mem.read_bytes(table_ptr, total)?;

        let mut items = Vec::new();
        for i in 0..slots {
            let key = read_word(&storage, i * abi.set_entry_size + abi.set_entry_key);
            if key != 0 {
                items.push(VmAddr(key));
            }
        }
        Ok(Self { items })
    }

    pub fn iter(&self) -> impl Iterator<Item = VmAddr> + '_ {
        self.items.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn read_word(storage: &[u8], at: usize) -> usize {
    let Some(slice) = storage.get(at..at + 8) else { return 0 };
    usize::from_ne_bytes(slice.try_into().expect("8-byte slice"))
}
