//! Fatal-signal crash dumping.
//!
//! SIGSEGV, SIGABRT, SIGFPE, SIGILL, and SIGBUS are caught on an
//! alternate stack; the handler appends a short report to the
//! pre-configured dump file using only async-signal-safe primitives
//! (`open`/`write`/`close`), then restores the default disposition and
//! re-raises. No cleanup is attempted: the process state is unknown and
//! any lock may be held.

use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signals that trigger a crash dump.
const CRASH_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGBUS,
];

/// NUL-terminated dump path, written once at install time and only read
/// from the handler afterwards.
static DUMP_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

/// Installs the alternate signal stack and the crash handlers.
///
/// # Errors
///
/// Returns an error if the dump path contains interior NULs, the
/// alternate stack cannot be installed, or a handler registration
/// fails.
pub fn install(dump_path: &Path) -> anyhow::Result<()> {
    let path = CString::new(dump_path.as_os_str().as_encoded_bytes())
        .map_err(|_| anyhow::anyhow!("crash dump path contains NUL"))?;
    DUMP_PATH.store(path.into_raw(), Ordering::Release);

    // Alternate stack, so a stack-overflow SIGSEGV can still run the
    // handler.
    // SAFETY: freshly allocated stack memory handed to sigaltstack and
    // intentionally leaked for the process lifetime.
    unsafe {
        let size = libc::SIGSTKSZ.max(64 * 1024);
        let sp = libc::malloc(size);
        if sp.is_null() {
            anyhow::bail!("could not allocate alternate signal stack");
        }
        let stack = libc::stack_t {
            ss_sp: sp,
            ss_flags: 0,
            ss_size: size,
        };
        if libc::sigaltstack(&stack, std::ptr::null_mut()) != 0 {
            libc::free(sp);
            anyhow::bail!("sigaltstack failed: {}", std::io::Error::last_os_error());
        }
    }

    let mut mask = SigSet::empty();
    for signal in CRASH_SIGNALS {
        mask.add(signal);
    }
    let action = SigAction::new(
        SigHandler::Handler(handle_crash_signal),
        SaFlags::SA_ONSTACK,
        mask,
    );

    for signal in CRASH_SIGNALS {
        // SAFETY: the handler only uses async-signal-safe calls.
        unsafe {
            sigaction(signal, &action)
                .map_err(|err| anyhow::anyhow!("sigaction({signal}) failed: {err}"))?;
        }
    }
    Ok(())
}

extern "C" fn handle_crash_signal(sig: libc::c_int) {
    // Async-signal-safe only from here: open/write/close, then re-raise.
    let path = DUMP_PATH.load(Ordering::Acquire);
    if !path.is_null() {
        // SAFETY: path is a valid NUL-terminated string leaked at
        // install time.
        unsafe {
            let fd = libc::open(
                path,
                libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
                0o600,
            );
            if fd >= 0 {
                write_all(fd, b"vigil: received fatal signal ");
                write_signal_number(fd, sig);
                write_all(fd, b"\n");
                libc::close(fd);
            }
        }
    }

    // SAFETY: restoring the default disposition and re-raising are
    // async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Formats a small positive number without allocating.
fn write_signal_number(fd: libc::c_int, sig: libc::c_int) {
    let mut buf = [0u8; 8];
    let mut n = sig.unsigned_abs();
    let mut at = buf.len();
    loop {
        at -= 1;
        buf[at] = b'0' + u8::try_from(n % 10).expect("digit fits");
        n /= 10;
        if n == 0 || at == 0 {
            break;
        }
    }
    write_all(fd, &buf[at..]);
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: writing a valid buffer to an fd we just opened.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[usize::try_from(written).unwrap_or(bytes.len()).min(bytes.len())..];
    }
}
