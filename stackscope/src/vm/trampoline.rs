//! Trampoline reads: probe memory with a guarded copy.
//!
//! A process-wide `SIGSEGV`/`SIGBUS` handler is installed once. A copy arms
//! a per-thread landing site, then copies in page-bounded chunks; if a chunk
//! faults, the handler long-jumps back to the landing site and the copy
//! reports failure. When the fault is not ours (flag unarmed), the handler
//! chains to whatever the host application had installed so its crash
//! handling still works.
//!
//! Each thread that performs guarded copies gets a dedicated signal stack,
//! installed lazily, so the handler can run even if the fault happened on an
//! exhausted stack.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::atomic::{compiler_fence, AtomicBool, Ordering};

use crate::domain::{VmAddr, VmError};

use super::PAGE_SIZE;

// Generously sized for glibc's sigjmp_buf on the supported targets.
#[repr(C, align(16))]
struct SigJmpBuf([u64; 64]);

extern "C" {
    // glibc spells sigsetjmp(env, savemask) as __sigsetjmp under the hood.
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
}

const ALT_STACK_SIZE: usize = 1 << 20;

thread_local! {
    static JMP_ENV: UnsafeCell<SigJmpBuf> = const { UnsafeCell::new(SigJmpBuf([0; 64])) };
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static ALT_STACK: Cell<*mut libc::c_void> = const { Cell::new(std::ptr::null_mut()) };
}

struct SavedAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

// SAFETY: written once while INSTALLED transitions false -> true, read only
// by the signal handler afterwards.
unsafe impl Sync for SavedAction {}

static OLD_SEGV: SavedAction = SavedAction(UnsafeCell::new(MaybeUninit::uninit()));
static OLD_BUS: SavedAction = SavedAction(UnsafeCell::new(MaybeUninit::uninit()));
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Handle to the installed fault catcher.
pub struct SegvCatcher {
    _priv: (),
}

impl SegvCatcher {
    /// Install the fault handlers, preserving the previous ones for
    /// chaining.
    ///
    /// # Errors
    /// [`VmError::Unavailable`] when either `sigaction` fails; any handler
    /// installed by the first call is rolled back.
    pub fn install() -> Result<Self, VmError> {
        if INSTALLED.load(Ordering::Acquire) {
            return Ok(SegvCatcher { _priv: () });
        }

        // SAFETY: zeroed sigaction is a valid starting point; the slots for
        // the previous actions are valid for writes.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = fault_handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            if libc::sigaction(libc::SIGSEGV, &action, (*OLD_SEGV.0.get()).as_mut_ptr()) != 0 {
                return Err(VmError::Unavailable);
            }
            if libc::sigaction(libc::SIGBUS, &action, (*OLD_BUS.0.get()).as_mut_ptr()) != 0 {
                libc::sigaction(libc::SIGSEGV, (*OLD_SEGV.0.get()).as_ptr(), std::ptr::null_mut());
                return Err(VmError::Unavailable);
            }
        }

        INSTALLED.store(true, Ordering::Release);
        Ok(SegvCatcher { _priv: () })
    }

    /// Guarded copy of `dst.len()` bytes from `src`.
    ///
    /// # Errors
    /// [`VmError::ReadFault`] when any chunk faults.
    pub fn copy(&self, src: VmAddr, dst: &mut [u8]) -> Result<(), VmError> {
        ensure_alt_stack();

        let env = JMP_ENV.with(UnsafeCell::get);
        ARMED.with(|armed| armed.set(true));
        compiler_fence(Ordering::SeqCst);

        // SAFETY: env points at this thread's jump buffer, which outlives
        // the copy. The chunked copy below runs between setjmp and a
        // possible longjmp; it lives in a separate non-inlined function so
        // no local of this frame is modified across the jump.
        let faulted = unsafe {
            if sigsetjmp(env, 1) == 0 {
                chunked_copy(src.0 as *const u8, dst.as_mut_ptr(), dst.len());
                false
            } else {
                true
            }
        };

        compiler_fence(Ordering::SeqCst);
        ARMED.with(|armed| armed.set(false));

        if faulted {
            Err(VmError::ReadFault { addr: src, len: dst.len() })
        } else {
            Ok(())
        }
    }
}

/// Copy in chunks that never span a source page boundary, so a bad page
/// costs exactly one fault.
#[inline(never)]
unsafe fn chunked_copy(mut src: *const u8, mut dst: *mut u8, mut remaining: usize) {
    while remaining > 0 {
        let to_page = PAGE_SIZE - (src as usize & (PAGE_SIZE - 1));
        let chunk = remaining.min(to_page);
        // Probe first so a fault happens before the bulk copy starts.
        std::ptr::read_volatile(src);
        std::ptr::copy_nonoverlapping(src, dst, chunk);
        src = src.add(chunk);
        dst = dst.add(chunk);
        remaining -= chunk;
    }
}

extern "C" fn fault_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let armed = ARMED.with(Cell::get);
    if armed {
        ARMED.with(|a| a.set(false));
        let env = JMP_ENV.with(UnsafeCell::get);
        // SAFETY: the armed flag proves this thread called sigsetjmp on env
        // and has not yet returned from the guarded region.
        unsafe { siglongjmp(env, 1) }
    }

    // Not our fault: hand over to the previous handler so the host keeps
    // its crash behaviour.
    let previous = if signo == libc::SIGSEGV { &OLD_SEGV } else { &OLD_BUS };
    // SAFETY: previous was initialised before INSTALLED was published, and
    // this handler only runs after installation.
    unsafe {
        let previous = (*previous.0.get()).assume_init();
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(previous.sa_sigaction);
            handler(signo, info, context);
        } else if previous.sa_sigaction == libc::SIG_DFL
            || previous.sa_sigaction == libc::SIG_IGN
        {
            // Restore and return; the faulting instruction re-executes and
            // the default disposition takes effect.
            libc::sigaction(signo, &previous, std::ptr::null_mut());
        } else {
            let handler: extern "C" fn(libc::c_int) = std::mem::transmute(previous.sa_sigaction);
            handler(signo);
        }
    }
}

/// Install this thread's alternate signal stack if it has none.
fn ensure_alt_stack() {
    ALT_STACK.with(|slot| {
        if !slot.get().is_null() {
            return;
        }

        // SAFETY: querying the current stack with a null ss is allowed.
        unsafe {
            let mut current: libc::stack_t = std::mem::zeroed();
            if libc::sigaltstack(std::ptr::null(), &mut current) == 0
                && current.ss_flags & libc::SS_DISABLE == 0
            {
                // A stack is already installed; keep it.
                slot.set(current.ss_sp);
                return;
            }

            let mem = libc::mmap(
                std::ptr::null_mut(),
                ALT_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mem == libc::MAP_FAILED {
                return;
            }

            let stack = libc::stack_t { ss_sp: mem, ss_flags: 0, ss_size: ALT_STACK_SIZE };
            if libc::sigaltstack(&stack, std::ptr::null_mut()) != 0 {
                libc::munmap(mem, ALT_STACK_SIZE);
                return;
            }
            slot.set(mem);
        }
    });
}
