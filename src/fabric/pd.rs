//! Protection domain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::fabric::mr::Permission;

/// One registered memory span in a protection domain's region table.
#[derive(Debug, Clone)]
pub(crate) struct RegionEntry {
    pub addr: u64,
    pub len: usize,
    pub perm: Permission,
    /// Present only when a remote capability was requested at registration.
    pub rkey: Option<u32>,
    /// Number of posted work requests currently referencing this region.
    pub outstanding: Arc<AtomicUsize>,
}

impl RegionEntry {
    /// Check that `[addr, addr + len)` lies within this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr.saturating_add(len as u64) <= self.addr + self.len as u64
    }
}

#[derive(Default)]
pub(crate) struct RegionTable {
    next_key: u32,
    by_lkey: HashMap<u32, RegionEntry>,
    rkey_to_lkey: HashMap<u32, u32>,
}

/// Ownership holder of a protection domain.
struct PdInner {
    table: Mutex<RegionTable>,
}

/// Protection domain.
///
/// An isolation boundary grouping one connection's queue pairs and memory
/// registrations. Keys handed out by one domain are meaningless in another:
/// every key lookup resolves against this domain's own region table and
/// nothing else.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Initial key value. Key zero is reserved as always-invalid.
    const FIRST_KEY: u32 = 0x100;

    /// Allocate a new protection domain.
    pub fn alloc() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(PdInner {
                table: Mutex::new(RegionTable {
                    next_key: Self::FIRST_KEY,
                    ..RegionTable::default()
                }),
            }),
        })
    }

    /// Pin a memory span into the region table, producing its keys.
    ///
    /// The local key always comes back; a remote key is minted only if
    /// `perm` carries a remote capability.
    pub(crate) fn register(
        &self,
        addr: u64,
        len: usize,
        perm: Permission,
    ) -> Result<(u32, Option<u32>)> {
        if len == 0 {
            return Err(Error::Registration("cannot register an empty range".into()));
        }

        let mut table = self.inner.table.lock().unwrap();
        let lkey = table.next_key;
        let rkey = if perm.intersects(Permission::REMOTE_READ | Permission::REMOTE_WRITE) {
            Some(table.next_key + 1)
        } else {
            None
        };
        table.next_key = table
            .next_key
            .checked_add(2)
            .ok_or_else(|| Error::Registration("key space exhausted".into()))?;

        let entry = RegionEntry {
            addr,
            len,
            perm,
            rkey,
            outstanding: Arc::new(AtomicUsize::new(0)),
        };
        if let Some(rkey) = rkey {
            table.rkey_to_lkey.insert(rkey, lkey);
        }
        table.by_lkey.insert(lkey, entry);

        log::debug!("registered region addr={addr:#x} len={len} lkey={lkey:#x} rkey={rkey:?}");
        Ok((lkey, rkey))
    }

    /// Remove a registration, failing while work requests still reference it.
    pub(crate) fn deregister(&self, lkey: u32) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        let entry = match table.by_lkey.get(&lkey) {
            Some(e) => e,
            None => return Ok(()),
        };
        let outstanding = entry.outstanding.load(Ordering::Acquire);
        if outstanding > 0 {
            return Err(Error::RegionBusy(outstanding));
        }
        let entry = table.by_lkey.remove(&lkey).unwrap();
        if let Some(rkey) = entry.rkey {
            table.rkey_to_lkey.remove(&rkey);
        }
        Ok(())
    }

    /// Detach a registration unconditionally. Used by `Drop`; any later
    /// access through its keys fails key validation.
    pub(crate) fn detach(&self, lkey: u32) {
        let mut table = self.inner.table.lock().unwrap();
        if let Some(entry) = table.by_lkey.remove(&lkey) {
            if let Some(rkey) = entry.rkey {
                table.rkey_to_lkey.remove(&rkey);
            }
        }
    }

    /// Resolve a local segment: the key must exist, the range must be
    /// contained, and `needed` permissions must all be present.
    pub(crate) fn resolve_local(
        &self,
        lkey: u32,
        addr: u64,
        len: usize,
        needed: Permission,
    ) -> Option<RegionEntry> {
        let table = self.inner.table.lock().unwrap();
        let entry = table.by_lkey.get(&lkey)?;
        if entry.contains(addr, len) && entry.perm.contains(needed) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Run `f` over a validated local range while the region table lock is
    /// held.
    ///
    /// Detach takes the same lock, so the registration (and the memory
    /// behind it) cannot go away while `f` runs. Everything that touches
    /// registered memory through raw pointers must go through this or
    /// [`with_remote_range`](Self::with_remote_range).
    pub(crate) fn with_local_range<R>(
        &self,
        lkey: u32,
        addr: u64,
        len: usize,
        needed: Permission,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Option<R> {
        let table = self.inner.table.lock().unwrap();
        let entry = table.by_lkey.get(&lkey)?;
        if entry.contains(addr, len) && entry.perm.contains(needed) {
            Some(f(addr as *mut u8))
        } else {
            None
        }
    }

    /// Run `f` over a validated remote-keyed range while the region table
    /// lock is held, as presented by the peer.
    pub(crate) fn with_remote_range<R>(
        &self,
        rkey: u32,
        addr: u64,
        len: usize,
        needed: Permission,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Option<R> {
        let table = self.inner.table.lock().unwrap();
        let lkey = table.rkey_to_lkey.get(&rkey)?;
        let entry = table.by_lkey.get(lkey)?;
        if entry.contains(addr, len) && entry.perm.contains(needed) {
            Some(f(addr as *mut u8))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Pd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Pd<{:p}>", Arc::as_ptr(&self.inner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_mints_remote_key_only_when_asked() {
        let pd = Pd::alloc().unwrap();
        let (lkey, rkey) = pd
            .register(0x1000, 64, Permission::LOCAL_WRITE)
            .unwrap();
        assert!(rkey.is_none());
        assert!(pd.resolve_local(lkey, 0x1000, 64, Permission::LOCAL_WRITE).is_some());

        let (_, rkey) = pd
            .register(0x2000, 64, Permission::LOCAL_WRITE | Permission::REMOTE_READ)
            .unwrap();
        let rkey = rkey.unwrap();
        assert!(pd
            .with_remote_range(rkey, 0x2000, 64, Permission::REMOTE_READ, |_| ())
            .is_some());
        assert!(pd
            .with_remote_range(rkey, 0x2000, 64, Permission::REMOTE_WRITE, |_| ())
            .is_none());
    }

    #[test]
    fn empty_range_is_rejected() {
        let pd = Pd::alloc().unwrap();
        assert!(matches!(
            pd.register(0x1000, 0, Permission::LOCAL_WRITE),
            Err(Error::Registration(_))
        ));
    }

    #[test]
    fn out_of_bounds_resolution_fails() {
        let pd = Pd::alloc().unwrap();
        let (lkey, _) = pd.register(0x1000, 64, Permission::LOCAL_WRITE).unwrap();
        assert!(pd.resolve_local(lkey, 0x1000, 65, Permission::LOCAL_WRITE).is_none());
        assert!(pd.resolve_local(lkey, 0x0fff, 2, Permission::LOCAL_WRITE).is_none());
        assert!(pd.resolve_local(lkey + 1, 0x1000, 64, Permission::LOCAL_WRITE).is_none());
    }

    #[test]
    fn busy_region_cannot_be_deregistered() {
        let pd = Pd::alloc().unwrap();
        let (lkey, _) = pd.register(0x1000, 64, Permission::LOCAL_WRITE).unwrap();
        let outstanding = pd
            .resolve_local(lkey, 0x1000, 64, Permission::EMPTY)
            .unwrap()
            .outstanding;
        outstanding.fetch_add(1, Ordering::Release);
        assert!(matches!(pd.deregister(lkey), Err(Error::RegionBusy(1))));
        outstanding.fetch_sub(1, Ordering::Release);
        assert!(pd.deregister(lkey).is_ok());
    }

    #[test]
    fn keys_do_not_cross_domains() {
        let pd_a = Pd::alloc().unwrap();
        let pd_b = Pd::alloc().unwrap();
        let (_, rkey) = pd_a
            .register(0x1000, 64, Permission::REMOTE_READ)
            .unwrap();
        // Same numeric key value, different domain: must not resolve.
        assert!(pd_b
            .with_remote_range(rkey.unwrap(), 0x1000, 64, Permission::REMOTE_READ, |_| ())
            .is_none());
    }

    #[test]
    fn detached_region_is_inaccessible() {
        let pd = Pd::alloc().unwrap();
        let (lkey, rkey) = pd.register(0x1000, 64, Permission::default()).unwrap();
        pd.detach(lkey);
        assert!(pd
            .with_local_range(lkey, 0x1000, 64, Permission::EMPTY, |_| ())
            .is_none());
        assert!(pd
            .with_remote_range(rkey.unwrap(), 0x1000, 64, Permission::REMOTE_READ, |_| ())
            .is_none());
    }
}
