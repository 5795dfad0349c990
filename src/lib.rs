//! Minimal KVM virtual machine monitor.
//!
//! Bring-up is phased so that each step needs the capability produced by the
//! one before it:
//!
//! [`HostDevice`] → [`HostCapability`] → [`VmCapability`] →
//! [`GuestMemoryRegion`]s + [`VcpuContext`] → [`VmLoop`].
//!
//! [`run_vm`] performs the whole sequence for a [`VmmConfig`].


pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use crate::config::{IoMode, MemorySlotConfig, UnknownExitPolicy, VmmConfig};
pub use crate::error::{Result, VmmError};
pub use crate::types::{RunReport, StopReason};
pub use crate::vmm::devices::{ConsolePort, EchoPort, PortIo};
pub use crate::vmm::event_loop::{Dispatcher, GuestCpu, Step, VmLoop};
pub use crate::vmm::exit::{ExitEvent, IoAccess};
pub use crate::vmm::kvm_ctx::{HostCapability, HostDevice, VmCapability};
pub use crate::vmm::memory::{GuestMemoryRegion, RegionFlags};
pub use crate::vmm::run::{run_vm, run_vm_with_io, DEMO_PAYLOAD};
pub use crate::vmm::vcpu::{enter_flat_protected_mode, Registers, Segment, SpecialRegisters, VcpuContext};
