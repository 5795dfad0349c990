use log::{debug, info, warn};

use super::devices::{ConsolePort, EchoPort, PortIo};
use super::event_loop::VmLoop;
use super::kvm_ctx::{HostCapability, HostDevice, VmCapability};
use super::memory::{GuestMemoryRegion, RegionFlags};
use super::vcpu::{Registers, VcpuContext, RFLAGS_RESERVED};
use crate::config::{IoMode, VmmConfig};
use crate::error::Result;
use crate::types::RunReport;


/// Demo guest: `mov al, 0x42; out 0x10, al; hlt`. The encoding is the same
/// in real mode and 32-bit protected mode.
pub const DEMO_PAYLOAD: [u8; 5] = [0xB0, 0x42, 0xE6, 0x10, 0xF4];


/// Runs `payload` with the port backend selected by `config.io`.
pub fn run_vm(config: &VmmConfig, payload: &[u8]) -> Result<RunReport> {
    match config.io {
        IoMode::Console => run_vm_with_io(config, payload, &mut ConsolePort::stdio()),
        IoMode::Echo => run_vm_with_io(config, payload, &mut EchoPort::new()),
    }
}


/// Opens KVM, builds the VM described by `config`, runs `payload` until it
/// stops and tears everything down on every path.
pub fn run_vm_with_io(config: &VmmConfig, payload: &[u8], io: &mut dyn PortIo) -> Result<RunReport> {
    config.validate()?;

    // 1) host + VM
    let host = HostDevice::open()?.validate(config.expected_api_version)?;
    let mut vm = VmCapability::create(&host)?;

    // 2) memory + vCPU + loop; the vCPU is gone by the time this returns
    let outcome = boot_and_run(&host, &mut vm, config, payload, io);

    // 3) teardown, also after run-loop failures
    if let Err(e) = &outcome {
        if e.is_run_failure() {
            warn!("run loop failed ({}), tearing down VM", e);
        }
    }
    vm.destroy();
    outcome
}


fn boot_and_run(
    host: &HostCapability,
    vm: &mut VmCapability,
    config: &VmmConfig,
    payload: &[u8],
    io: &mut dyn PortIo,
) -> Result<RunReport> {
    for m in &config.memory {
        let flags = RegionFlags { read_only: m.read_only, log_dirty: m.log_dirty };
        let region = GuestMemoryRegion::allocate(m.slot, m.guest_phys_addr, m.size, flags)?;
        vm.attach_memory(region)?;
    }
    vm.load_payload(config.payload_addr, payload)?;

    let mut vcpu = vm.create_vcpu(config.vcpu_id)?;
    vcpu.map_exit_page(host.vcpu_mmap_size()?)?;
    setup_vcpu(&vcpu, config)?;

    let mut event_loop = VmLoop::new(config.unknown_exits);
    let mut report = event_loop.run_until_exit(&mut vcpu, io)?;

    let finish = vcpu.get_registers()?;
    info!("finishing IP: {:#x}", finish.rip);
    report.final_rip = Some(finish.rip);

    vcpu.destroy();
    Ok(report)
}


fn setup_vcpu(vcpu: &VcpuContext, config: &VmmConfig) -> Result<()> {
    let start = vcpu.get_registers()?;
    let sregs = vcpu.get_special_registers()?;
    debug!(
        "vCPU {} reset state: IP {:#x}, CS base {:#x} limit {:#x} selector {:#x}",
        vcpu.id(),
        start.rip,
        sregs.cs.base,
        sregs.cs.limit,
        sregs.cs.selector
    );

    if config.flat_protected_mode {
        vcpu.enter_flat_protected_mode()?;
    }

    let regs = Registers { rip: config.entry_point, rflags: RFLAGS_RESERVED, ..start };
    vcpu.set_registers(&regs)?;
    info!("starting IP: {:#x}", regs.rip);
    Ok(())
}
