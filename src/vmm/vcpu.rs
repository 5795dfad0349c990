use kvm_bindings::{kvm_regs, kvm_run, kvm_segment, kvm_sregs};
use kvm_ioctls::VcpuFd;
use log::{debug, trace};
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vm_memory::VolatileSlice;

use super::exit::{self, ExitEvent, IoAccess};
use crate::error::{Result, VmmError};

/// CR0 protection-enable bit.
pub const X86_CR0_PE: u64 = 0x1;

/// Reserved RFLAGS bit 1, which must always be set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// General purpose registers plus instruction pointer and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl From<kvm_regs> for Registers {
    fn from(r: kvm_regs) -> Self {
        Self {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

impl From<Registers> for kvm_regs {
    fn from(r: Registers) -> Self {
        kvm_regs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        }
    }
}

/// A segment descriptor as cached in the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: bool,
    pub dpl: u8,
    /// Default operand / stack size: set for 32-bit.
    pub default_size: bool,
    /// Code or data (as opposed to system) descriptor.
    pub code_data: bool,
    pub long_mode: bool,
    /// Limit counted in 4 KiB units.
    pub granularity: bool,
    pub available: bool,
    pub unusable: bool,
}

impl Segment {
    /// Compares the fields the VMM programs itself. KVM may rewrite access
    /// bits such as `type_` or `unusable` on its own.
    pub fn same_descriptor(&self, other: &Segment) -> bool {
        self.base == other.base
            && self.limit == other.limit
            && self.selector == other.selector
            && self.granularity == other.granularity
            && self.default_size == other.default_size
    }
}

impl From<kvm_segment> for Segment {
    fn from(s: kvm_segment) -> Self {
        Self {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present != 0,
            dpl: s.dpl,
            default_size: s.db != 0,
            code_data: s.s != 0,
            long_mode: s.l != 0,
            granularity: s.g != 0,
            available: s.avl != 0,
            unusable: s.unusable != 0,
        }
    }
}

impl From<Segment> for kvm_segment {
    fn from(s: Segment) -> Self {
        kvm_segment {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present as u8,
            dpl: s.dpl,
            db: s.default_size as u8,
            s: s.code_data as u8,
            l: s.long_mode as u8,
            g: s.granularity as u8,
            avl: s.available as u8,
            unusable: s.unusable as u8,
            padding: 0,
        }
    }
}

/// Segment and control registers.
///
/// Descriptor tables, TR/LDT, CR2/CR8, APIC base and the pending interrupt
/// bitmap are not exposed; [`SpecialRegisters::apply_to`] leaves them as
/// the vCPU reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecialRegisters {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl From<kvm_sregs> for SpecialRegisters {
    fn from(s: kvm_sregs) -> Self {
        Self {
            cs: s.cs.into(),
            ds: s.ds.into(),
            es: s.es.into(),
            fs: s.fs.into(),
            gs: s.gs.into(),
            ss: s.ss.into(),
            cr0: s.cr0,
            cr3: s.cr3,
            cr4: s.cr4,
            efer: s.efer,
        }
    }
}

impl SpecialRegisters {
    pub fn apply_to(&self, raw: &mut kvm_sregs) {
        raw.cs = self.cs.into();
        raw.ds = self.ds.into();
        raw.es = self.es.into();
        raw.fs = self.fs.into();
        raw.gs = self.gs.into();
        raw.ss = self.ss.into();
        raw.cr0 = self.cr0;
        raw.cr3 = self.cr3;
        raw.cr4 = self.cr4;
        raw.efer = self.efer;
    }

    fn same_programmed_state(&self, other: &SpecialRegisters) -> bool {
        let segments = [
            (&self.cs, &other.cs),
            (&self.ds, &other.ds),
            (&self.es, &other.es),
            (&self.fs, &other.fs),
            (&self.gs, &other.gs),
            (&self.ss, &other.ss),
        ];
        segments.iter().all(|(a, b)| a.same_descriptor(b)) && self.cr0 == other.cr0
    }
}

/// Flat 32-bit protected mode: code, data and stack segments cover the whole
/// 4 GiB space with 4 KiB granularity, CS/SS default to 32-bit operands and
/// CR0.PE is set. Applying it twice yields the same state.
pub fn enter_flat_protected_mode(sregs: &mut SpecialRegisters) {
    for seg in [&mut sregs.cs, &mut sregs.ds, &mut sregs.ss] {
        seg.base = 0;
        seg.limit = 0xffff_ffff;
        seg.granularity = true;
    }

    sregs.cs.default_size = true;
    sregs.ss.default_size = true;

    sregs.cr0 |= X86_CR0_PE;
}

/// One virtual CPU and its shared exit page.
pub struct VcpuContext {
    id: u64,
    fd: Option<VcpuFd>,
    /// Size of the run area once the exit page has been mapped.
    run_size: Option<usize>,
    vm_alive: Arc<AtomicBool>,
}

impl fmt::Debug for VcpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcpuContext")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("run_size", &self.run_size)
            .finish()
    }
}

/// The run area kvm-ioctls mapped for `fd`, as a raw header plus a byte view
/// of the whole mapping.
fn run_area(fd: &mut VcpuFd, size: usize) -> (*mut kvm_run, VolatileSlice<'_>) {
    let run: *mut kvm_run = fd.get_kvm_run();
    // SAFETY: kvm-ioctls maps `KVM_GET_VCPU_MMAP_SIZE` bytes starting at
    // `kvm_run` for as long as `fd` lives, and `size` is that value.
    let area = unsafe { VolatileSlice::new(run.cast::<u8>(), size) };
    (run, area)
}

impl VcpuContext {
    pub(crate) fn new(id: u64, fd: VcpuFd, vm_alive: Arc<AtomicBool>) -> Self {
        Self { id, fd: Some(fd), run_size: None, vm_alive }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether neither this vCPU nor its VM has been destroyed.
    pub fn is_live(&self) -> bool {
        self.fd.is_some() && self.vm_alive.load(Ordering::Acquire)
    }

    fn fd(&self) -> Result<&VcpuFd> {
        match &self.fd {
            Some(fd) if self.vm_alive.load(Ordering::Acquire) => Ok(fd),
            _ => Err(VmmError::StaleContext { id: self.id }),
        }
    }

    /// Live handle plus the mapped run area size.
    fn run_parts(&mut self) -> Result<(&mut VcpuFd, usize)> {
        self.fd()?;
        let size = self.run_size.ok_or(VmmError::ExitPageNotMapped { id: self.id })?;
        match self.fd.as_mut() {
            Some(fd) => Ok((fd, size)),
            None => Err(VmmError::StaleContext { id: self.id }),
        }
    }

    pub fn get_registers(&self) -> Result<Registers> {
        let regs = self
            .fd()?
            .get_regs()
            .map_err(|source| VmmError::Registers { what: "regs", source })?;
        Ok(regs.into())
    }

    /// Writes `regs` and reads them back; a mismatch is reported rather than
    /// resuming with state the guest would not see.
    pub fn set_registers(&self, regs: &Registers) -> Result<()> {
        let fd = self.fd()?;
        fd.set_regs(&(*regs).into())
            .map_err(|source| VmmError::Registers { what: "regs", source })?;

        let readback = self.get_registers()?;
        if readback != *regs {
            return Err(VmmError::RegisterReadback { what: "regs" });
        }
        Ok(())
    }

    pub fn get_special_registers(&self) -> Result<SpecialRegisters> {
        let sregs = self
            .fd()?
            .get_sregs()
            .map_err(|source| VmmError::Registers { what: "sregs", source })?;
        Ok(sregs.into())
    }

    pub fn set_special_registers(&self, sregs: &SpecialRegisters) -> Result<()> {
        let fd = self.fd()?;
        let mut raw = fd
            .get_sregs()
            .map_err(|source| VmmError::Registers { what: "sregs", source })?;
        sregs.apply_to(&mut raw);
        fd.set_sregs(&raw)
            .map_err(|source| VmmError::Registers { what: "sregs", source })?;

        let readback = self.get_special_registers()?;
        if !readback.same_programmed_state(sregs) {
            return Err(VmmError::RegisterReadback { what: "sregs" });
        }
        Ok(())
    }

    /// Reads the special registers, switches them to flat protected mode and
    /// writes them back.
    pub fn enter_flat_protected_mode(&self) -> Result<()> {
        let mut sregs = self.get_special_registers()?;
        enter_flat_protected_mode(&mut sregs);
        self.set_special_registers(&sregs)
    }

    /// Exposes the vCPU's run area for exit decoding. `size` is the
    /// host-reported `KVM_GET_VCPU_MMAP_SIZE`; kvm-ioctls maps that many
    /// bytes when the vCPU is created.
    pub fn map_exit_page(&mut self, size: usize) -> Result<()> {
        self.fd()?;
        if size < size_of::<kvm_run>() {
            return Err(VmmError::MappingFailed(format!(
                "run area of {} bytes cannot hold kvm_run ({} bytes)",
                size,
                size_of::<kvm_run>()
            )));
        }
        debug!("vCPU {} exit page mapped ({} bytes)", self.id, size);
        self.run_size = Some(size);
        Ok(())
    }

    /// Runs the guest until its next exit and decodes that exit.
    pub fn resume(&mut self) -> Result<ExitEvent> {
        let id = self.id;
        let (fd, size) = self.run_parts()?;
        // The exit is decoded from `kvm_run` below, which also carries the
        // internal error words and the raw data offset.
        fd.run().map(|_| ()).map_err(VmmError::ResumeFailed)?;

        let (run, area) = run_area(fd, size);
        // SAFETY: `run` is valid and the guest is stopped until the next
        // KVM_RUN, so the host does not write it while it is read.
        let event = exit::decode(unsafe { &*run }, &area)?;
        trace!("vCPU {} exit: {:?}", id, event);
        Ok(event)
    }

    /// Supplies the data an `IoIn` exit asked for.
    pub fn complete_io_in(&mut self, io: &IoAccess, data: &[u8]) -> Result<()> {
        let (fd, size) = self.run_parts()?;
        let (_, area) = run_area(fd, size);
        exit::fill_io_in(&area, io, data)
    }

    /// Closes the vCPU handle, which also releases its run area. Later calls
    /// report `StaleContext`.
    pub fn destroy(&mut self) {
        if self.fd.is_some() {
            debug!("destroying vCPU {}", self.id);
        }
        self.run_size = None;
        self.fd = None;
    }
}

impl Drop for VcpuContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_state() -> SpecialRegisters {
        // Values KVM reports for a freshly created x86 vCPU.
        let code = Segment {
            base: 0xffff_0000,
            limit: 0xffff,
            selector: 0xf000,
            type_: 0xb,
            present: true,
            code_data: true,
            ..Default::default()
        };
        let data = Segment {
            base: 0,
            limit: 0xffff,
            selector: 0,
            type_: 0x3,
            present: true,
            code_data: true,
            ..Default::default()
        };
        SpecialRegisters {
            cs: code,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            cr0: 0x6000_0010,
            ..Default::default()
        }
    }

    #[test]
    fn test_flat_protected_mode() {
        let mut sregs = reset_state();
        enter_flat_protected_mode(&mut sregs);

        for seg in [sregs.cs, sregs.ds, sregs.ss] {
            assert_eq!(seg.base, 0);
            assert_eq!(seg.limit, 0xffff_ffff);
            assert!(seg.granularity);
        }
        assert!(sregs.cs.default_size);
        assert!(sregs.ss.default_size);
        assert!(!sregs.ds.default_size);
        assert_eq!(sregs.cr0 & X86_CR0_PE, X86_CR0_PE);
        assert_eq!(sregs.cr0, 0x6000_0011);
        // Untouched segments keep their reset values.
        assert_eq!(sregs.es, reset_state().es);
        assert_eq!(sregs.cs.selector, 0xf000);
    }

    #[test]
    fn test_flat_protected_mode_is_idempotent() {
        let mut once = reset_state();
        enter_flat_protected_mode(&mut once);

        let mut twice = once;
        enter_flat_protected_mode(&mut twice);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_segment_conversion_round_trip() {
        let seg = Segment {
            base: 0x1000,
            limit: 0xfffff,
            selector: 0x10,
            type_: 0xb,
            present: true,
            dpl: 0,
            default_size: true,
            code_data: true,
            long_mode: false,
            granularity: true,
            available: false,
            unusable: false,
        };
        let raw: kvm_segment = seg.into();
        assert_eq!(raw.db, 1);
        assert_eq!(raw.g, 1);
        assert_eq!(Segment::from(raw), seg);
    }

    #[test]
    fn test_apply_preserves_unexposed_state() {
        let mut raw = kvm_sregs::default();
        raw.cr2 = 0xdead_b000;
        raw.gdt.base = 0x500;
        raw.apic_base = 0xfee0_0900;

        let mut sregs = SpecialRegisters::from(raw);
        enter_flat_protected_mode(&mut sregs);
        sregs.apply_to(&mut raw);

        assert_eq!(raw.cr2, 0xdead_b000);
        assert_eq!(raw.gdt.base, 0x500);
        assert_eq!(raw.apic_base, 0xfee0_0900);
        assert_eq!(raw.cs.limit, 0xffff_ffff);
        assert_eq!(raw.cr0 & X86_CR0_PE, X86_CR0_PE);
    }

    #[test]
    fn test_registers_conversion_round_trip() {
        let regs = Registers {
            rax: 1,
            rbx: 2,
            r15: 15,
            rip: 0xF0000,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        let raw: kvm_regs = regs.into();
        assert_eq!(raw.rip, 0xF0000);
        assert_eq!(Registers::from(raw), regs);
    }

    #[test]
    fn test_readback_ignores_kvm_owned_bits() {
        let written = reset_state();
        let mut observed = written;
        observed.cs.type_ = 0x9;
        observed.fs.unusable = true;
        assert!(written.same_programmed_state(&observed));

        observed.ss.limit = 0xfff;
        assert!(!written.same_programmed_state(&observed));
    }
}
