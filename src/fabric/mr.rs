//! Memory region, access permissions, and the remote memory descriptor.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Range};

use crate::error::Result;
use crate::fabric::pd::Pd;

/// Memory region permissions.
///
/// Requested once at registration time and immutable for the region's
/// lifetime; there is no downgrade or upgrade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    /// The owning process may write through the registration locally
    /// (receives and one-sided read destinations land here).
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    /// The remote peer may read the region.
    pub const REMOTE_READ: Self = Self(1 << 1);
    /// The remote peer may write the region.
    pub const REMOTE_WRITE: Self = Self(1 << 2);

    /// Whether all permissions in `other` are present in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any permission in `other` is present in `self`.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for Permission {
    /// Allow local write and remote read/write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permission {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

/// A borrowed view of part of a registered memory region, as referenced by
/// work requests.
#[derive(Debug, Clone, Copy)]
pub struct MrSlice {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
}

/// Local memory region.
///
/// A pinned, capability-tagged span of memory registered to a protection
/// domain. The memory itself does not belong to this type; it must stay
/// valid and pinned for as long as the registration exists. Prefer
/// [`RegisteredMem`], which bundles an owned page-aligned buffer with its
/// registration and is safe by construction.
///
/// [`RegisteredMem`]: crate::utils::registered_mem::RegisteredMem
pub struct Mr {
    pd: Pd,
    addr: u64,
    len: usize,
    perm: Permission,
    lkey: u32,
    rkey: Option<u32>,
}

impl Mr {
    /// Register a memory region with the given protection domain.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `[addr, addr + len)` is valid,
    /// page-aligned memory that outlives the registration, and that no Rust
    /// reference aliases it while the fabric may access it.
    pub unsafe fn reg(pd: &Pd, addr: *mut u8, len: usize, perm: Permission) -> Result<Self> {
        let addr = addr as u64;
        let (lkey, rkey) = pd.register(addr, len, perm)?;
        Ok(Self {
            pd: pd.clone(),
            addr,
            len,
            perm,
            lkey,
            rkey,
        })
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Get the length of the registered memory area.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the permissions requested at registration.
    #[inline]
    pub fn permission(&self) -> Permission {
        self.perm
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Get the remote key of the memory region, if a remote capability was
    /// requested.
    #[inline]
    pub fn rkey(&self) -> Option<u32> {
        self.rkey
    }

    /// Get the protection domain this region is registered to.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get a slice over the whole region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice {
        MrSlice {
            addr: self.addr,
            len: self.len,
            lkey: self.lkey,
        }
    }

    /// Sub-slice the region. Return `None` if the range is out of bounds.
    #[inline]
    pub fn get_slice(&self, r: Range<usize>) -> Option<MrSlice> {
        if r.start <= r.end && r.end <= self.len {
            Some(MrSlice {
                addr: self.addr + r.start as u64,
                len: r.end - r.start,
                lkey: self.lkey,
            })
        } else {
            None
        }
    }

    /// View this region as a remote memory descriptor for one-sided access
    /// by the peer. `None` if no remote capability was requested.
    #[inline]
    pub fn as_remote(&self) -> Option<RemoteMem> {
        self.rkey.map(|rkey| RemoteMem {
            addr: self.addr,
            rkey,
        })
    }

    /// Explicitly deregister, failing with [`Error::RegionBusy`] while work
    /// requests referencing this region are outstanding.
    ///
    /// [`Error::RegionBusy`]: crate::Error::RegionBusy
    pub fn dereg(self) -> Result<()> {
        // Drop's detach of an already-removed key is a no-op.
        self.pd.deregister(self.lkey)
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        self.pd.detach(self.lkey);
    }
}

impl std::fmt::Debug for Mr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .finish()
    }
}

/// Remote registered memory descriptor.
///
/// The only state ever transmitted between peers that conveys read/write
/// capability: a bearer token whose possession suffices to access the
/// designated region for the lifetime of the registration. Only meaningful
/// within the protection domain that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteMem {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteMem {
    /// Exact wire size: 8-byte address + 4-byte remote key.
    pub const WIRE_LEN: usize = 12;

    /// Create a new remote memory descriptor.
    pub fn new(addr: u64, rkey: u32) -> Self {
        Self { addr, rkey }
    }

    /// Get the descriptor shifted by the given offset.
    #[inline]
    pub fn at(&self, offset: usize) -> Self {
        Self {
            addr: self.addr + offset as u64,
            rkey: self.rkey,
        }
    }

    /// Encode into the fixed 12-byte wire layout.
    ///
    /// Native byte order: both peers are assumed homogeneous and no
    /// endianness normalization is performed on this payload.
    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..8].copy_from_slice(&self.addr.to_ne_bytes());
        buf[8..].copy_from_slice(&self.rkey.to_ne_bytes());
        buf
    }

    /// Decode from the fixed 12-byte wire layout.
    pub fn from_wire(buf: &[u8; Self::WIRE_LEN]) -> Self {
        Self {
            addr: u64::from_ne_bytes(buf[..8].try_into().unwrap()),
            rkey: u32::from_ne_bytes(buf[8..].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_arithmetic() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_READ;
        assert!(p.contains(Permission::LOCAL_WRITE));
        assert!(p.contains(Permission::LOCAL_WRITE | Permission::REMOTE_READ));
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert!(p.intersects(Permission::REMOTE_READ | Permission::REMOTE_WRITE));
        assert!(!p.intersects(Permission::REMOTE_WRITE));
        assert!(Permission::EMPTY.contains(Permission::EMPTY));
    }

    #[test]
    fn descriptor_wire_roundtrip() {
        let desc = RemoteMem::new(0x7f00_dead_beef, 0x1234_5678);
        let wire = desc.to_wire();
        assert_eq!(wire.len(), RemoteMem::WIRE_LEN);
        assert_eq!(RemoteMem::from_wire(&wire), desc);
    }

    #[test]
    fn region_slicing() {
        let pd = Pd::alloc().unwrap();
        let mut buf = [0u8; 128];
        let mr = unsafe { Mr::reg(&pd, buf.as_mut_ptr(), buf.len(), Permission::default()) }
            .unwrap();

        let s = mr.get_slice(8..40).unwrap();
        assert_eq!(s.addr, mr.addr() + 8);
        assert_eq!(s.len, 32);
        assert_eq!(s.lkey, mr.lkey());

        assert!(mr.get_slice(100..129).is_none());
        assert_eq!(mr.as_slice().len, 128);
    }

    #[test]
    fn remote_view_requires_remote_capability() {
        let pd = Pd::alloc().unwrap();
        let mut buf = [0u8; 64];
        let local_only =
            unsafe { Mr::reg(&pd, buf.as_mut_ptr(), buf.len(), Permission::LOCAL_WRITE) }.unwrap();
        assert!(local_only.as_remote().is_none());
        drop(local_only);

        let shared = unsafe { Mr::reg(&pd, buf.as_mut_ptr(), buf.len(), Permission::default()) }
            .unwrap();
        let remote = shared.as_remote().unwrap();
        assert_eq!(remote.addr, shared.addr());
        assert_eq!(Some(remote.rkey), shared.rkey());
        assert_eq!(remote.at(16).addr, shared.addr() + 16);
    }
}
