use thiserror::Error;
use vmm_sys_util::errno;

/// Errors raised while bringing up or running a guest.
///
/// Host failures keep the underlying `errno` as their source so callers can
/// tell a missing kernel module from a permission problem.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error("virtualization device unavailable: {0}")]
    UnavailableDevice(#[source] errno::Error),

    #[error("incompatible KVM API version: expected {expected}, host reports {found}")]
    IncompatibleVersion { expected: i32, found: i32 },

    #[error("failed to create VM: {0}")]
    VmCreationFailed(#[source] errno::Error),

    #[error("memory slot {slot} is already attached")]
    SlotConflict { slot: u32 },

    #[error("memory slot {slot} is not page aligned (base {guest_phys_addr:#x}, size {size:#x}, page {page_size:#x})")]
    AlignmentViolation {
        slot: u32,
        guest_phys_addr: u64,
        size: u64,
        page_size: u64,
    },

    #[error("memory slot {slot} wraps the guest-physical address space (base {guest_phys_addr:#x}, size {size:#x})")]
    RangeOverflow {
        slot: u32,
        guest_phys_addr: u64,
        size: u64,
    },

    #[error("memory slot {slot} overlaps slot {existing} in guest-physical space")]
    OverlapViolation { slot: u32, existing: u32 },

    #[error("memory slot {slot} is not attached")]
    UnknownSlot { slot: u32 },

    #[error("failed to register memory slot {slot}: {source}")]
    SetMemoryRegion {
        slot: u32,
        #[source]
        source: errno::Error,
    },

    #[error("failed to create vCPU {id}: {source}")]
    VcpuCreationFailed {
        id: u64,
        #[source]
        source: errno::Error,
    },

    #[error("vCPU {id} used after it or its VM was destroyed")]
    StaleContext { id: u64 },

    #[error("VM used after it was destroyed")]
    VmDestroyed,

    #[error("failed to access vCPU {what}: {source}")]
    Registers {
        what: &'static str,
        #[source]
        source: errno::Error,
    },

    #[error("vCPU {what} read back differently from what was written")]
    RegisterReadback { what: &'static str },

    #[error("memory mapping failed: {0}")]
    MappingFailed(String),

    #[error("vCPU {id} has no exit page mapped")]
    ExitPageNotMapped { id: u64 },

    #[error("exit page access out of bounds (offset {offset:#x}, len {len}, page {page_size})")]
    ExitPageBounds {
        offset: u64,
        len: usize,
        page_size: usize,
    },

    #[error("payload of {len} bytes does not fit at {addr:#x}")]
    PayloadPlacement { addr: u64, len: usize },

    #[error("failed to resume vCPU: {0}")]
    ResumeFailed(#[source] errno::Error),

    #[error("guest entry failed (hardware reason {hardware_reason:#x})")]
    EntryFailed { hardware_reason: u64 },

    #[error("KVM internal error, suberror {suberror}, data {data:x?}")]
    InternalError { suberror: u32, data: Vec<u64> },

    #[error("port {port:#x} I/O failed: {source}")]
    PortIo {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("unhandled exit reason {0}")]
    UnknownExit(u32),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VmmError {
    /// Process exit code for this failure. Zero is reserved for a guest that
    /// halted or shut down normally.
    pub fn exit_code(&self) -> u8 {
        match self {
            VmmError::UnavailableDevice(_) => 2,
            VmmError::IncompatibleVersion { .. } => 3,
            VmmError::VmCreationFailed(_) => 4,
            VmmError::SlotConflict { .. } => 5,
            VmmError::AlignmentViolation { .. } => 6,
            VmmError::OverlapViolation { .. } => 7,
            VmmError::VcpuCreationFailed { .. } => 8,
            VmmError::StaleContext { .. } | VmmError::VmDestroyed => 9,
            VmmError::MappingFailed(_) => 10,
            VmmError::ResumeFailed(_) => 11,
            VmmError::InternalError { .. } => 12,
            VmmError::UnknownExit(_) => 13,
            VmmError::EntryFailed { .. } => 14,
            VmmError::UnknownSlot { .. } | VmmError::SetMemoryRegion { .. } => 15,
            VmmError::Registers { .. } | VmmError::RegisterReadback { .. } => 16,
            VmmError::ExitPageNotMapped { .. } | VmmError::ExitPageBounds { .. } => 17,
            VmmError::RangeOverflow { .. } => 18,
            VmmError::PortIo { .. } => 19,
            VmmError::PayloadPlacement { .. } | VmmError::Config(_) => 1,
        }
    }

    /// Whether the error came out of the run loop rather than setup.
    pub fn is_run_failure(&self) -> bool {
        matches!(
            self,
            VmmError::ResumeFailed(_)
                | VmmError::EntryFailed { .. }
                | VmmError::InternalError { .. }
                | VmmError::UnknownExit(_)
                | VmmError::PortIo { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VmmError>;
