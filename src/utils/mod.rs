//! Supporting utilities around the fabric core.

pub mod registered_mem;

pub use registered_mem::RegisteredMem;

/// Advise the platform to keep this process's memory resident.
///
/// Best-effort: pinned registrations do not depend on it for correctness,
/// so failure (insufficient privilege, quota) is logged and ignored.
pub fn lock_memory_hint() {
    // SAFETY: FFI; no memory is passed in.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret != 0 {
        log::warn!(
            "mlockall failed (non-fatal): {}",
            std::io::Error::last_os_error()
        );
    } else {
        log::debug!("process memory locked");
    }
}

/// The platform page size, the alignment registered buffers are carved at.
pub fn page_size() -> usize {
    // SAFETY: FFI; sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}
