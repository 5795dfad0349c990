//! Decoding of the vCPU's `kvm_run` area into [`ExitEvent`]s.
//!
//! The area is only read after `KVM_RUN` returns and is decoded into an owned
//! value straight away, so nothing keeps a view of host-written memory
//! across resumes. Port data lives past the `kvm_run` header at the offset
//! the host reports, and is reached through a bounds-checked
//! [`VolatileSlice`] covering the whole mapping.

use kvm_bindings::{
    kvm_run, KVM_EXIT_DEBUG, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR,
    KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_EXIT_SHUTDOWN,
};
use std::mem::size_of;
use vm_memory::{Bytes, VolatileSlice};

use crate::error::{Result, VmmError};

/// Where a port access keeps its data inside the run area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    /// Width of one transfer in bytes.
    pub size: u8,
    /// Number of transfers; above one for string instructions.
    pub count: u32,
    pub data_offset: u64,
}

impl IoAccess {
    /// Total bytes moved by this access.
    pub fn len(&self) -> usize {
        self.size as usize * self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why the guest stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvent {
    /// The guest reads a port; input must be written before resuming.
    IoIn(IoAccess),
    /// The guest wrote a port; `data` holds a copy of the bytes.
    IoOut(IoAccess, Vec<u8>),
    Halt,
    Shutdown,
    Debug { exception: u32, pc: u64 },
    FailEntry { hardware_reason: u64 },
    InternalError { suberror: u32, data: Vec<u64> },
    Unknown(u32),
}

fn bounds(area: &VolatileSlice<'_>, offset: u64, len: usize) -> VmmError {
    VmmError::ExitPageBounds { offset, len, page_size: area.len() }
}

/// Checks that `io`'s data lies past the `kvm_run` header and inside the
/// mapped area, and returns its start.
fn io_data_start(area: &VolatileSlice<'_>, io: &IoAccess) -> Result<usize> {
    let start = usize::try_from(io.data_offset).map_err(|_| bounds(area, io.data_offset, io.len()))?;
    match start.checked_add(io.len()) {
        Some(end) if start >= size_of::<kvm_run>() && end <= area.len() => Ok(start),
        _ => Err(bounds(area, io.data_offset, io.len())),
    }
}

/// Decodes the exit recorded in `run`. `area` covers the whole run mapping,
/// `run` included, and is only used for port data.
pub fn decode(run: &kvm_run, area: &VolatileSlice<'_>) -> Result<ExitEvent> {
    let event = match run.exit_reason {
        KVM_EXIT_IO => {
            // SAFETY: the exit reason selects the `io` member.
            let raw = unsafe { run.__bindgen_anon_1.io };
            let io = IoAccess {
                port: raw.port,
                size: raw.size,
                count: raw.count,
                data_offset: raw.data_offset,
            };
            let start = io_data_start(area, &io)?;
            match u32::from(raw.direction) {
                KVM_EXIT_IO_IN => ExitEvent::IoIn(io),
                KVM_EXIT_IO_OUT => {
                    let mut data = vec![0u8; io.len()];
                    area.read_slice(&mut data, start)
                        .map_err(|_| bounds(area, io.data_offset, io.len()))?;
                    ExitEvent::IoOut(io, data)
                }
                _ => ExitEvent::Unknown(run.exit_reason),
            }
        }
        KVM_EXIT_HLT => ExitEvent::Halt,
        KVM_EXIT_SHUTDOWN => ExitEvent::Shutdown,
        KVM_EXIT_DEBUG => {
            // SAFETY: the exit reason selects the `debug` member.
            let arch = unsafe { run.__bindgen_anon_1.debug.arch };
            ExitEvent::Debug { exception: arch.exception, pc: arch.pc }
        }
        KVM_EXIT_FAIL_ENTRY => {
            // SAFETY: the exit reason selects the `fail_entry` member.
            let fail = unsafe { run.__bindgen_anon_1.fail_entry };
            ExitEvent::FailEntry { hardware_reason: fail.hardware_entry_failure_reason }
        }
        KVM_EXIT_INTERNAL_ERROR => {
            // SAFETY: the exit reason selects the `internal` member.
            let internal = unsafe { run.__bindgen_anon_1.internal };
            let ndata = (internal.ndata as usize).min(internal.data.len());
            ExitEvent::InternalError {
                suberror: internal.suberror,
                data: internal.data[..ndata].to_vec(),
            }
        }
        other => ExitEvent::Unknown(other),
    };

    Ok(event)
}

/// Writes input for an `IoIn` exit at the offset the host reported.
pub fn fill_io_in(area: &VolatileSlice<'_>, io: &IoAccess, data: &[u8]) -> Result<()> {
    let start = io_data_start(area, io)?;
    let len = data.len().min(io.len());
    area.write_slice(&data[..len], start)
        .map_err(|_| bounds(area, io.data_offset, len))
}
