//! Per-thread sampling metadata.
//!
//! The host registers threads through the control surface as they start and
//! stop; the registry maps the runtime's thread identity to the name, the
//! native id, the CPU clock and the associated event loop. The sampler is
//! the only reader; mutation happens on the tracked threads themselves.

use std::collections::HashMap;

use crate::domain::{Microseconds, VmAddr};
use crate::timing;

/// Sampling metadata for one runtime thread.
pub struct ThreadInfo {
    /// Runtime thread identity (doubles as the pthread handle).
    pub thread_id: usize,
    /// Operating-system thread id.
    pub native_id: u32,
    pub name: String,
    /// CPU clock of the thread, when the kernel exposes one.
    pub cpu_clock: Option<libc::clockid_t>,
    /// Event loop running on this thread, when the host registered one.
    pub event_loop: Option<VmAddr>,
    /// Runtime thread-state address, refreshed by the sampler every tick.
    pub state_addr: VmAddr,
    cpu_time: Microseconds,
}

impl ThreadInfo {
    #[must_use]
    pub fn new(thread_id: usize, native_id: u32, name: &str) -> Self {
        let cpu_clock = timing::thread_cpu_clock(thread_id as libc::pthread_t);
        let mut info = Self {
            thread_id,
            native_id,
            name: name.to_owned(),
            cpu_clock,
            event_loop: None,
            state_addr: VmAddr::NULL,
            cpu_time: 0,
        };
        info.update_cpu_time();
        info
    }

    /// Refresh the CPU time reading; returns the delta since the previous
    /// refresh.
    pub fn update_cpu_time(&mut self) -> Microseconds {
        let Some(clock) = self.cpu_clock else { return 0 };
        let Some(now) = timing::clock_us(clock) else { return 0 };
        let delta = now.saturating_sub(self.cpu_time);
        self.cpu_time = now;
        delta
    }

    /// Whether the kernel currently reports the thread as running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let path = format!("/proc/self/task/{}/stat", self.native_id);
        let Ok(stat) = std::fs::read_to_string(path) else {
            return false;
        };
        // The state letter follows the parenthesised command name.
        let Some(after) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
            return false;
        };
        after.trim_start().starts_with('R')
    }
}

/// Thread identity → sampling metadata.
#[derive(Default)]
pub struct ThreadRegistry {
    map: HashMap<usize, ThreadInfo>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a thread. Re-tracking an existing thread
    /// updates its name and native id in place.
    pub fn track(&mut self, thread_id: usize, name: &str, native_id: u32) {
        match self.map.get_mut(&thread_id) {
            Some(info) => {
                info.name = name.to_owned();
                info.native_id = native_id;
                info.update_cpu_time();
            }
            None => {
                self.map.insert(thread_id, ThreadInfo::new(thread_id, native_id, name));
            }
        }
    }

    pub fn untrack(&mut self, thread_id: usize) {
        self.map.remove(&thread_id);
    }

    pub fn set_event_loop(&mut self, thread_id: usize, event_loop: Option<VmAddr>) {
        if let Some(info) = self.map.get_mut(&thread_id) {
            info.event_loop = event_loop;
        }
    }

    #[must_use]
    pub fn get(&self, thread_id: usize) -> Option<&ThreadInfo> {
        self.map.get(&thread_id)
    }

    pub fn get_mut(&mut self, thread_id: usize) -> Option<&mut ThreadInfo> {
        self.map.get_mut(&thread_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadInfo> {
        self.map.values_mut()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
