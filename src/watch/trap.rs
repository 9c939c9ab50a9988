// # Trap Handler
//
// Installs a `SIGSEGV` handler (SPEC_FULL.md §4.5) that recognizes
// faults on pages this crate has write-protected, captures a `RawFault`
// into the event ring, restores write access to the faulting page so
// the original store retries, and chains to whatever handler was
// previously installed for any address it doesn't recognize.
//
// Everything this module's signal-path functions touch is async-signal-
// safe: atomic loads/stores, `mprotect`, `clock_gettime`, and the
// registry's lock-free `shadow_lookup`/ring `push`. No allocation, no
// `std::sync::Mutex`, no `tracing`, no panicking path between entry and
// return -- see the module doc on `watch::registry` for why the
// lookup table specifically is built to allow this.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::RearmPolicy;
use crate::error::{EngineError, Result};
use crate::watch::region::{page_floor, PAGE_SIZE};
use crate::watch::registry::WatchRegistry;
use crate::watch::ring::{EventRing, RawFault};

struct TrapContext {
    registry: Arc<WatchRegistry>,
    ring: Arc<EventRing>,
    policy: RearmPolicy,
}

// Both are `AtomicPtr`, not `OnceCell`, because the engine's `init`/
// `shutdown` cycle can install and uninstall this handler many times
// over a process lifetime, unlike a one-shot singleton that can only
// ever be set once. Replacing a context is a plain pointer swap the
// signal handler reads with a single `Acquire` load; the retired
// pointer is deliberately leaked rather than freed, since a trap
// already past the null check on
// another thread may still be dereferencing it. Re-init/re-shutdown
// cycles are expected to be rare (test and embedder lifecycle events,
// not a hot path), so the leaked memory is bounded in practice.
static TRAP_CTX: AtomicPtr<TrapContext> = AtomicPtr::new(std::ptr::null_mut());
static PREV_SIGSEGV: AtomicPtr<libc::sigaction> = AtomicPtr::new(std::ptr::null_mut());
static HANDLER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide `SIGSEGV` handler. Idempotent at the OS
/// level: a second call while already active only swaps in the new
/// registry/ring context, without touching `sigaction` again.
pub fn install(registry: Arc<WatchRegistry>, ring: Arc<EventRing>, policy: RearmPolicy) -> Result<()> {
    let new_ctx = Box::into_raw(Box::new(TrapContext { registry, ring, policy }));
    TRAP_CTX.swap(new_ctx, Ordering::AcqRel);

    if HANDLER_ACTIVE.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigsegv as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut prev: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut prev) != 0 {
            HANDLER_ACTIVE.store(false, Ordering::Release);
            return Err(EngineError::Mprotect {
                page_addr: 0,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            });
        }
        PREV_SIGSEGV.store(Box::into_raw(Box::new(prev)), Ordering::Release);
    }
    debug!("SIGSEGV trap handler installed");
    Ok(())
}

/// Restores whatever `SIGSEGV` handler preceded ours. Only safe to call
/// once every armed page has already been disarmed by
/// `WatchRegistry::shutdown`.
pub fn uninstall() {
    if !HANDLER_ACTIVE.swap(false, Ordering::AcqRel) {
        return;
    }
    let prev_ptr = PREV_SIGSEGV.load(Ordering::Acquire);
    if !prev_ptr.is_null() {
        // SAFETY: `prev_ptr` was published by a completed `install` and
        // is never freed (see module doc), so it is always valid to read.
        unsafe {
            libc::sigaction(libc::SIGSEGV, &*prev_ptr, std::ptr::null_mut());
        }
    }
    debug!("SIGSEGV trap handler uninstalled");
}

pub fn is_installed() -> bool {
    HANDLER_ACTIVE.load(Ordering::Acquire)
}

/// The signal handler itself. Must remain async-signal-safe end to end.
extern "C" fn handle_sigsegv(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let ctx_ptr = TRAP_CTX.load(Ordering::Acquire);
    if ctx_ptr.is_null() {
        chain_or_default(sig, info, ctx);
        return;
    }
    // SAFETY: non-null `TRAP_CTX` values are always fully-constructed
    // and never freed while any trap could still be in flight.
    let trap = unsafe { &*ctx_ptr };

    // SAFETY: `info` is non-null and valid for the duration of signal
    // delivery per the `sigaction(2)` contract.
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let page_addr = page_floor(fault_addr);

    let Some((_shadow_ptr, dirty)) = trap.registry.shadow_lookup(page_addr) else {
        chain_or_default(sig, info, ctx);
        return;
    };

    let already_dirty = dirty.swap(true, Ordering::AcqRel);
    let should_enqueue = match trap.policy {
        RearmPolicy::CoalesceUntilRearm => !already_dirty,
        RearmPolicy::EnqueueEveryFault => true,
    };

    if should_enqueue {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: `clock_gettime` is async-signal-safe.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        let timestamp_ns = ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64;
        let thread_id = current_thread_id();
        let fault_ip = extract_fault_ip(ctx);

        trap.ring.push(RawFault {
            seq: 0,
            timestamp_ns,
            thread_id,
            fault_ip,
            page_addr,
        });
    }

    // SAFETY: `page_addr` is page-aligned and was confirmed armed by
    // `shadow_lookup`; restoring write access lets the faulting store
    // retry and succeed.
    unsafe {
        libc::mprotect(page_addr as *mut c_void, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE);
    }
}

/// Chains to whatever handler preceded ours, or raises the default
/// disposition (process termination) if there was none -- this fault
/// was not on a page this crate protects, so it is a genuine violation.
fn chain_or_default(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let prev_ptr = PREV_SIGSEGV.load(Ordering::Acquire);
    // SAFETY: non-null `PREV_SIGSEGV` values are published by a completed
    // `install` and never freed, so dereferencing is always valid.
    let prev = if prev_ptr.is_null() { None } else { Some(unsafe { &*prev_ptr }) };
    match prev {
        Some(prev) if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN => {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
                    unsafe { std::mem::transmute(prev.sa_sigaction) };
                handler(sig, info, ctx);
            } else {
                let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(prev.sa_sigaction) };
                handler(sig);
            }
        }
        _ => unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        },
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    // SAFETY: `gettid` is async-signal-safe (a direct syscall, no libc
    // state touched).
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn extract_fault_ip(ctx: *mut c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    // SAFETY: on Linux/x86_64, `ctx` is a valid `ucontext_t*` for the
    // duration of signal delivery; `REG_RIP` indexes `gregs`.
    unsafe {
        let ucontext = ctx as *const libc::ucontext_t;
        (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn extract_fault_ip(_ctx: *mut c_void) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::registry::WatchRequest;
    use crate::common::{LanguageTag, ScopeTag};

    fn default_request(base: usize, size: usize) -> WatchRequest {
        WatchRequest {
            base,
            size,
            name: Some("x".into()),
            adapter_id: 0,
            scope: ScopeTag::Local,
            language: LanguageTag::Native,
            creator_thread: 1,
            thread_name: None,
            user_data: 0,
        }
    }

    #[test]
    fn install_then_real_write_fault_is_captured_and_retried() {
        let registry = Arc::new(WatchRegistry::new());
        let ring = Arc::new(EventRing::new(64));
        install(registry.clone(), ring.clone(), RearmPolicy::CoalesceUntilRearm).unwrap();

        let buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        let leaked: &'static mut [u8] = Box::leak(buf);

        let region_id = registry
            .watch(default_request(base, leaked.len()))
            .expect("watch");

        // SAFETY: the page was just armed read-only; this store is the
        // fault we're exercising, and the handler restores write access
        // so it completes normally.
        unsafe {
            std::ptr::write_volatile(leaked.as_mut_ptr(), 0xAB);
        }
        assert_eq!(leaked[0], 0xAB);

        let fault = ring.pop().expect("fault enqueued");
        assert_eq!(fault.page_addr, page_floor(base));

        registry.unwatch(region_id).unwrap();
    }
}
