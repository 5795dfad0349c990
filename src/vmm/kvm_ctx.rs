use kvm_ioctls::{Kvm, VmFd};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vmm_sys_util::errno;

use super::memory::{host_page_size, GuestMemoryRegion, SlotTable};
use super::vcpu::VcpuContext;
use crate::error::{Result, VmmError};


/// `/dev/kvm`, opened but not yet version checked.
pub struct HostDevice {
    kvm: Kvm,
}


impl HostDevice {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(VmmError::UnavailableDevice)?;
        debug!("/dev/kvm opened");
        Ok(Self { kvm })
    }

    pub fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    /// Accepts the device only if it reports exactly `expected`.
    pub fn validate(self, expected: i32) -> Result<HostCapability> {
        let found = self.api_version();
        if found != expected {
            return Err(VmmError::IncompatibleVersion { expected, found });
        }
        info!("KVM API version {}", found);
        Ok(HostCapability { kvm: self.kvm, api_version: found })
    }
}


/// A version-checked KVM handle; the only way to create a VM.
pub struct HostCapability {
    kvm: Kvm,
    api_version: i32,
}


impl HostCapability {
    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    /// Size of each vCPU's shared exit page.
    pub fn vcpu_mmap_size(&self) -> Result<usize> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(|e| VmmError::MappingFailed(format!("KVM_GET_VCPU_MMAP_SIZE: {}", e)))
    }
}


/// One guest machine: the VM handle, its memory slots and the ids of the
/// vCPUs it has issued.
pub struct VmCapability {
    vm: VmFd,
    slots: SlotTable,
    vcpu_ids: HashSet<u64>,
    page_size: u64,
    alive: Arc<AtomicBool>,
}


impl VmCapability {
    pub fn create(host: &HostCapability) -> Result<Self> {
        let vm = host.kvm.create_vm().map_err(VmmError::VmCreationFailed)?;
        info!("VM created");
        Ok(Self {
            vm,
            slots: SlotTable::new(),
            vcpu_ids: HashSet::new(),
            page_size: host_page_size(),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(VmmError::VmDestroyed)
        }
    }

    /// Registers `region` with KVM. From here on the guest-physical range is
    /// backed by the region's host buffer, which the VM keeps until detach.
    pub fn attach_memory(&mut self, region: GuestMemoryRegion) -> Result<()> {
        self.ensure_alive()?;
        self.slots.check(&region, self.page_size)?;

        // SAFETY: the host buffer is owned by `region`, which moves into the
        // slot table below and is only dropped after KVM forgets the slot.
        unsafe { self.vm.set_user_memory_region(region.to_kvm_region()) }.map_err(|source| {
            VmmError::SetMemoryRegion { slot: region.slot(), source }
        })?;

        info!(
            "attached slot {} at {:#x} ({:#x} bytes, {:?})",
            region.slot(),
            region.guest_phys_addr(),
            region.size(),
            region.flags()
        );
        self.slots.insert(region);
        Ok(())
    }

    /// Unregisters `slot` and hands its region back to the caller.
    pub fn detach_memory(&mut self, slot: u32) -> Result<GuestMemoryRegion> {
        self.ensure_alive()?;
        let region = self.slots.get(slot).ok_or(VmmError::UnknownSlot { slot })?;
        // SAFETY: a zero-sized region only removes the slot.
        unsafe { self.vm.set_user_memory_region(region.to_kvm_removal()) }
            .map_err(|source| VmmError::SetMemoryRegion { slot, source })?;

        debug!("detached slot {}", slot);
        self.slots.remove(slot).ok_or(VmmError::UnknownSlot { slot })
    }

    pub fn regions(&self) -> &SlotTable {
        &self.slots
    }

    /// Copies `data` into whichever attached region holds guest address `addr`.
    pub fn load_payload(&self, addr: u64, data: &[u8]) -> Result<()> {
        let region = self
            .slots
            .find_containing(addr)
            .ok_or(VmmError::PayloadPlacement { addr, len: data.len() })?;
        region.write_guest(addr, data)?;
        debug!("loaded {} payload bytes at {:#x}", data.len(), addr);
        Ok(())
    }

    pub fn create_vcpu(&mut self, id: u64) -> Result<VcpuContext> {
        self.ensure_alive()?;
        if self.vcpu_ids.contains(&id) {
            return Err(VmmError::VcpuCreationFailed {
                id,
                source: errno::Error::new(libc::EEXIST),
            });
        }
        let fd = self
            .vm
            .create_vcpu(id)
            .map_err(|source| VmmError::VcpuCreationFailed { id, source })?;
        self.vcpu_ids.insert(id);
        info!("vCPU {} created", id);
        Ok(VcpuContext::new(id, fd, self.alive.clone()))
    }

    /// Detaches every slot, most recent first, and marks the VM dead so its
    /// vCPUs report `StaleContext`. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("destroying VM");
        }
        while let Some(region) = self.slots.pop_last() {
            let slot = region.slot();
            // SAFETY: a zero-sized region only removes the slot.
            if let Err(e) = unsafe { self.vm.set_user_memory_region(region.to_kvm_removal()) } {
                // No vCPU can resume any more, so the stale slot is never
                // entered again.
                warn!("failed to unregister slot {} during teardown: {}", slot, e);
            }
            drop(region);
        }
    }
}


impl Drop for VmCapability {
    fn drop(&mut self) {
        self.destroy();
    }
}
