use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_LOG_DIRTY_PAGES, KVM_MEM_READONLY};
use std::sync::Arc;
use vm_memory::{Bytes, MmapRegion, VolatileMemory};

use crate::error::{Result, VmmError};

/// Host page size, as reported by the kernel.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionFlags {
    pub read_only: bool,
    pub log_dirty: bool,
}

impl RegionFlags {
    fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.read_only {
            bits |= KVM_MEM_READONLY;
        }
        if self.log_dirty {
            bits |= KVM_MEM_LOG_DIRTY_PAGES;
        }
        bits
    }
}

/// One guest-physical mapping backed by an anonymous host buffer.
///
/// The buffer is reference counted so the VM can hold it for exactly as long
/// as the slot is registered; it never moves once allocated.
pub struct GuestMemoryRegion {
    slot: u32,
    guest_phys_addr: u64,
    flags: RegionFlags,
    host: Arc<MmapRegion>,
}

impl GuestMemoryRegion {
    /// Maps `size` bytes of zeroed host memory for `slot`.
    pub fn allocate(slot: u32, guest_phys_addr: u64, size: u64, flags: RegionFlags) -> Result<Self> {
        let len = usize::try_from(size)
            .map_err(|_| VmmError::MappingFailed(format!("slot {} size {:#x} too big", slot, size)))?;
        let host = MmapRegion::<()>::new(len)
            .map_err(|e| VmmError::MappingFailed(format!("slot {}: {}", slot, e)))?;
        Ok(Self { slot, guest_phys_addr, flags, host: Arc::new(host) })
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn guest_phys_addr(&self) -> u64 {
        self.guest_phys_addr
    }

    pub fn size(&self) -> u64 {
        self.host.size() as u64
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Exclusive end of the guest-physical range, `None` if it wraps the
    /// address space.
    pub fn checked_end(&self) -> Option<u64> {
        self.guest_phys_addr.checked_add(self.size())
    }

    /// Exclusive end of the guest-physical range, clamped to `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.guest_phys_addr.saturating_add(self.size())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_phys_addr && addr < self.end()
    }

    pub fn overlaps(&self, other: &GuestMemoryRegion) -> bool {
        self.guest_phys_addr < other.end() && other.guest_phys_addr < self.end()
    }

    /// Handle on the host buffer; used to observe its lifetime.
    pub fn host_buffer(&self) -> &Arc<MmapRegion> {
        &self.host
    }

    /// Copies `data` to guest-physical `addr`, which must lie in this region.
    pub fn write_guest(&self, addr: u64, data: &[u8]) -> Result<()> {
        let placement = || VmmError::PayloadPlacement { addr, len: data.len() };
        if !self.contains(addr) {
            return Err(placement());
        }
        let offset = (addr - self.guest_phys_addr) as usize;
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.host.size() => {}
            _ => return Err(placement()),
        }
        self.host
            .as_volatile_slice()
            .write_slice(data, offset)
            .map_err(|_| placement())
    }

    pub(crate) fn to_kvm_region(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot: self.slot,
            flags: self.flags.bits(),
            guest_phys_addr: self.guest_phys_addr,
            memory_size: self.size(),
            userspace_addr: self.host.as_ptr() as u64,
        }
    }

    /// The same slot with size zero, which tells KVM to drop it.
    pub(crate) fn to_kvm_removal(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            memory_size: 0,
            ..self.to_kvm_region()
        }
    }
}

impl std::fmt::Debug for GuestMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemoryRegion")
            .field("slot", &self.slot)
            .field("guest_phys_addr", &format_args!("{:#x}", self.guest_phys_addr))
            .field("size", &format_args!("{:#x}", self.size()))
            .field("flags", &self.flags)
            .finish()
    }
}

/// Attached regions in attachment order.
#[derive(Debug, Default)]
pub struct SlotTable {
    regions: Vec<GuestMemoryRegion>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `region` against the attached set without modifying it.
    pub fn check(&self, region: &GuestMemoryRegion, page_size: u64) -> Result<()> {
        if self.regions.iter().any(|r| r.slot == region.slot) {
            return Err(VmmError::SlotConflict { slot: region.slot });
        }
        if region.guest_phys_addr % page_size != 0 || region.size() % page_size != 0 {
            return Err(VmmError::AlignmentViolation {
                slot: region.slot,
                guest_phys_addr: region.guest_phys_addr,
                size: region.size(),
                page_size,
            });
        }
        if region.checked_end().is_none() {
            return Err(VmmError::RangeOverflow {
                slot: region.slot,
                guest_phys_addr: region.guest_phys_addr,
                size: region.size(),
            });
        }
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(region)) {
            return Err(VmmError::OverlapViolation {
                slot: region.slot,
                existing: existing.slot,
            });
        }
        Ok(())
    }

    /// Appends an already checked region.
    pub fn insert(&mut self, region: GuestMemoryRegion) {
        self.regions.push(region);
    }

    pub fn get(&self, slot: u32) -> Option<&GuestMemoryRegion> {
        self.regions.iter().find(|r| r.slot == slot)
    }

    pub fn remove(&mut self, slot: u32) -> Option<GuestMemoryRegion> {
        let idx = self.regions.iter().position(|r| r.slot == slot)?;
        Some(self.regions.remove(idx))
    }

    /// The most recently attached region.
    pub fn pop_last(&mut self) -> Option<GuestMemoryRegion> {
        self.regions.pop()
    }

    pub fn find_containing(&self, addr: u64) -> Option<&GuestMemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuestMemoryRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
