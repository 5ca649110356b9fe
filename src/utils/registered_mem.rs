//! Owned, page-aligned, registered memory.

use std::ops::{Deref, DerefMut, Range};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::fabric::mr::{Mr, MrSlice, Permission, RemoteMem};
use crate::fabric::pd::Pd;
use crate::utils::page_size;

/// A page-aligned, zero-initialized heap allocation.
///
/// Page alignment is a precondition for registration; the platform
/// allocator supplies it here rather than the fabric enforcing it.
struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Registration("cannot allocate an empty buffer".into()));
        }
        let align = page_size();
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: FFI; out-pointer and arguments are valid.
        let ret = unsafe { libc::posix_memalign(&mut ptr, align, len) };
        if ret != 0 {
            return Err(Error::Registration(format!(
                "posix_memalign failed: {}",
                std::io::Error::from_raw_os_error(ret)
            )));
        }
        // SAFETY: freshly allocated, len bytes valid.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        Ok(Self {
            // posix_memalign returning 0 guarantees a non-null pointer.
            ptr: NonNull::new(ptr as *mut u8).ok_or_else(|| {
                Error::Registration("posix_memalign returned null".into())
            })?,
            len,
        })
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated by posix_memalign, freed exactly once.
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}

// SAFETY: the buffer is plain memory; access discipline is the registered
// region's concern.
unsafe impl Send for AlignedBuf {}

/// A wrapper around an owned memory area registered to a protection domain.
///
/// The memory is page-aligned, zero-filled, and deallocated when this
/// structure is dropped; the registration is detached first (field order).
/// This is the safe way to obtain registered memory: the buffer cannot
/// outlive its registration or vice versa.
pub struct RegisteredMem {
    // Field order is drop order: registration before backing memory.
    mr: Mr,
    buf: AlignedBuf,
}

impl RegisteredMem {
    /// Allocate page-aligned memory of the given length and register it
    /// with full local-write/remote-read/remote-write permissions.
    pub fn new(pd: &Pd, len: usize) -> Result<Self> {
        Self::with_permission(pd, len, Permission::default())
    }

    /// Allocate and register with the given permissions.
    pub fn with_permission(pd: &Pd, len: usize, perm: Permission) -> Result<Self> {
        let buf = AlignedBuf::alloc(len)?;
        // SAFETY: `buf` is valid page-aligned memory owned by this struct,
        // which keeps it alive for the registration's whole lifetime.
        let mr = unsafe { Mr::reg(pd, buf.ptr.as_ptr(), len, perm) }?;
        Ok(Self { mr, buf })
    }

    /// Allocate memory sized and filled from `content`, then register it.
    pub fn new_with_content(pd: &Pd, content: &[u8], perm: Permission) -> Result<Self> {
        let mut ret = Self::with_permission(pd, content.len(), perm)?;
        ret.copy_from_slice(content);
        Ok(ret)
    }

    /// Get the address of the allocated memory.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.mr.addr()
    }

    /// Get the length of the allocated memory.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.buf.len
    }

    /// Get the underlying memory region.
    #[inline]
    pub fn mr(&self) -> &Mr {
        &self.mr
    }

    /// Get a slice that represents the whole region.
    #[inline]
    pub fn as_mr_slice(&self) -> MrSlice {
        self.mr.as_slice()
    }

    /// Sub-slice the region. Return `None` if the range is out of bounds.
    #[inline]
    pub fn get_slice(&self, r: Range<usize>) -> Option<MrSlice> {
        self.mr.get_slice(r)
    }

    /// View the region as a remote memory descriptor, if it carries a
    /// remote capability.
    #[inline]
    pub fn as_remote(&self) -> Option<RemoteMem> {
        self.mr.as_remote()
    }
}

impl Deref for RegisteredMem {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: owned allocation, valid for len bytes.
        unsafe { std::slice::from_raw_parts(self.buf.ptr.as_ptr(), self.buf.len) }
    }
}

impl DerefMut for RegisteredMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: owned allocation, valid for len bytes.
        unsafe { std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr(), self.buf.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned_and_zeroed() {
        let pd = Pd::alloc().unwrap();
        let mem = RegisteredMem::new(&pd, 8192).unwrap();
        assert_eq!(mem.addr() as usize % page_size(), 0);
        assert!(mem.iter().all(|&b| b == 0));
        assert_eq!(mem.len(), 8192);
        assert!(mem.as_remote().is_some());
    }

    #[test]
    fn content_constructor_copies() {
        let pd = Pd::alloc().unwrap();
        let mem = RegisteredMem::new_with_content(&pd, b"hello fabric", Permission::default())
            .unwrap();
        assert_eq!(&mem[..], b"hello fabric");
    }

    #[test]
    fn zero_length_allocation_fails() {
        let pd = Pd::alloc().unwrap();
        assert!(matches!(
            RegisteredMem::new(&pd, 0),
            Err(Error::Registration(_))
        ));
    }
}
