//! Asynchronous capture: the profile-signal handshake and the on-demand
//! snapshot wakeup.
//!
//! To sample a thread's native stack, the sampler must run code on that
//! thread. It posts `SIGPROF` to the target and blocks on a semaphore; the
//! handler walks the native and managed stacks into a static capture
//! buffer and posts the semaphore (`sem_post` is async-signal-safe, which
//! is what lets the handler hand control back without taking any lock).
//! The handshake guarantees at most one handler writes the buffer at a
//! time, and the sampler reads it only after the post.
//!
//! The handler allocates nothing: program counters and raw frame
//! references go into fixed arrays, and all resolution happens on the
//! sampler thread afterwards.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::domain::VmAddr;
use crate::native;
use crate::runtime::abi::Abi;
use crate::stacks::{capture_raw_frames, RawFrameRef};

/// Capacity of the static capture buffers.
pub const CAPTURE_FRAMES: usize = 2048;

/// What one profile signal captured.
pub struct SigCapture {
    pub native: [usize; CAPTURE_FRAMES],
    pub native_len: usize,
    pub managed: [RawFrameRef; CAPTURE_FRAMES],
    pub managed_len: usize,
}

impl SigCapture {
    const fn empty() -> Self {
        Self {
            native: [0; CAPTURE_FRAMES],
            native_len: 0,
            managed: [RawFrameRef::EMPTY; CAPTURE_FRAMES],
            managed_len: 0,
        }
    }
}

struct CaptureCell(UnsafeCell<SigCapture>);

// SAFETY: exclusive access is enforced by the handshake; exactly one
// handler writes between arm and post, and the sampler reads after.
unsafe impl Sync for CaptureCell {}

static CAPTURE: CaptureCell = CaptureCell(UnsafeCell::new(SigCapture::empty()));
static CAPTURE_TARGET: AtomicUsize = AtomicUsize::new(0);
static CAPTURE_ABI: AtomicPtr<Abi> = AtomicPtr::new(std::ptr::null_mut());
static CAPTURE_NATIVE: AtomicBool = AtomicBool::new(false);
static ARMED: AtomicBool = AtomicBool::new(false);
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

struct SemCell(UnsafeCell<std::mem::MaybeUninit<libc::sem_t>>);

// SAFETY: sem_t is designed for cross-thread use through its C API.
unsafe impl Sync for SemCell {}

impl SemCell {
    fn get(&self) -> *mut libc::sem_t {
        // SAFETY: callers only use the pointer through the sem_* API, after
        // sem_init has run.
        unsafe { (*self.0.get()).as_mut_ptr() }
    }
}

static SEM: SemCell = SemCell(UnsafeCell::new(std::mem::MaybeUninit::uninit()));
static SEM_READY: AtomicBool = AtomicBool::new(false);

/// Install the profile and quit handlers. Called at sampler start.
pub fn install(abi: &'static Abi, native: bool) {
    SHUTTING_DOWN.store(false, Ordering::Release);
    CAPTURE_ABI.store(std::ptr::from_ref(abi).cast_mut(), Ordering::Release);
    CAPTURE_NATIVE.store(native, Ordering::Release);

    if !SEM_READY.swap(true, Ordering::AcqRel) {
        // SAFETY: the cell is zeroed storage for a process-local semaphore.
        unsafe {
            libc::sem_init(SEM.get(), 0, 0);
        }
    }

    // SAFETY: installing handlers with valid sigaction values.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = sigquit_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGQUIT, &action, std::ptr::null_mut());

        if native {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = sigprof_handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut());
        }
    }
}

/// Restore default dispositions. Called at sampler stop.
pub fn restore() {
    SHUTTING_DOWN.store(true, Ordering::Release);
    // SAFETY: resetting dispositions to the default.
    unsafe {
        libc::signal(libc::SIGQUIT, libc::SIG_DFL);
        libc::signal(libc::SIGPROF, libc::SIG_DFL);
    }
}

/// Deliver a profile signal to `thread` and wait for its capture.
///
/// Returns the capture buffer, valid until the next call. `None` when the
/// signal cannot be delivered or the handler does not report back within
/// `timeout` (thread exited mid-tick, for instance).
pub fn capture_thread(
    thread: libc::pthread_t,
    tstate: VmAddr,
    timeout: Duration,
) -> Option<&'static SigCapture> {
    if !SEM_READY.load(Ordering::Acquire) {
        return None;
    }

    CAPTURE_TARGET.store(tstate.0, Ordering::Release);
    ARMED.store(true, Ordering::Release);

    // SAFETY: pthread_kill rejects dead handles with ESRCH.
    let rc = unsafe { libc::pthread_kill(thread, libc::SIGPROF) };
    if rc != 0 {
        ARMED.store(false, Ordering::Release);
        return None;
    }

    let deadline = Instant::now() + timeout;
    loop {
        // SAFETY: the semaphore was initialised at install.
        let rc = unsafe { libc::sem_trywait(SEM.get()) };
        if rc == 0 {
            // SAFETY: the post happened, so the handler is done writing.
            return Some(unsafe { &*CAPTURE.0.get() });
        }
        if Instant::now() >= deadline {
            ARMED.store(false, Ordering::Release);
            return None;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

extern "C" fn sigprof_handler(_signo: libc::c_int) {
    if SHUTTING_DOWN.load(Ordering::Acquire) || !ARMED.swap(false, Ordering::AcqRel) {
        return;
    }

    // SAFETY: the armed flag was ours, so no other handler holds the
    // buffer, and the sampler is parked in sem_trywait.
    let capture = unsafe { &mut *CAPTURE.0.get() };
    capture.native_len = 0;
    capture.managed_len = 0;

    if CAPTURE_NATIVE.load(Ordering::Acquire) {
        capture.native_len = native::capture_pcs(&mut capture.native);
    }

    let abi = CAPTURE_ABI.load(Ordering::Acquire);
    let target = CAPTURE_TARGET.load(Ordering::Acquire);
    if !abi.is_null() && target != 0 {
        // SAFETY: the abi pointer refers to a static table.
        let abi = unsafe { &*abi };
        capture.managed_len = capture_raw_frames(abi, VmAddr(target), &mut capture.managed);
    }

    // SAFETY: sem_post is async-signal-safe and releases the sampler.
    unsafe {
        libc::sem_post(SEM.get());
    }
}

/// Wakeup channel for the snapshot listener. The handler sets the pending
/// flag and notifies without touching the mutex, so it cannot deadlock
/// against a thread interrupted while holding it.
struct WhereSignal {
    pending: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

static WHERE_SIGNAL: WhereSignal =
    WhereSignal { pending: AtomicBool::new(false), lock: Mutex::new(()), cv: Condvar::new() };

/// Block until a snapshot is requested or `timeout` passes. Consumes the
/// request; returns whether one fired.
pub fn where_wait(timeout: Duration) -> bool {
    let guard = WHERE_SIGNAL.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let (_guard, _result) = WHERE_SIGNAL
        .cv
        .wait_timeout_while(guard, timeout, |_| !WHERE_SIGNAL.pending.load(Ordering::Acquire))
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    WHERE_SIGNAL.pending.swap(false, Ordering::AcqRel)
}

/// Request a snapshot. Callable from signal context.
pub fn where_notify() {
    WHERE_SIGNAL.pending.store(true, Ordering::Release);
    WHERE_SIGNAL.cv.notify_one();
}

extern "C" fn sigquit_handler(_signo: libc::c_int) {
    if SHUTTING_DOWN.load(Ordering::Acquire) {
        return;
    }
    where_notify();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_wait_times_out() {
        assert!(!where_wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_where_notify_wakes_waiter() {
        let waiter = std::thread::spawn(|| where_wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        where_notify();
        assert!(waiter.join().unwrap());
        // The request was consumed.
        assert!(!where_wait(Duration::from_millis(10)));
    }
}
