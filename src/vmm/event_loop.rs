use log::{debug, error, info, warn};

use super::devices::PortIo;
use super::exit::{ExitEvent, IoAccess};
use super::vcpu::VcpuContext;
use crate::config::UnknownExitPolicy;
use crate::error::{Result, VmmError};
use crate::types::{RunReport, StopReason};


/// Something the run loop can resume. Implemented by [`VcpuContext`].
pub trait GuestCpu {
    /// Runs the guest until its next exit.
    fn resume(&mut self) -> Result<ExitEvent>;

    /// Hands input for an `IoIn` exit back to the guest.
    fn complete_io_in(&mut self, io: &IoAccess, data: &[u8]) -> Result<()>;
}


impl GuestCpu for VcpuContext {
    fn resume(&mut self) -> Result<ExitEvent> {
        VcpuContext::resume(self)
    }

    fn complete_io_in(&mut self, io: &IoAccess, data: &[u8]) -> Result<()> {
        VcpuContext::complete_io_in(self, io, data)
    }
}


/// What the loop does after an exit has been serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop(StopReason),
}


/// Services one exit at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    unknown_exits: UnknownExitPolicy,
}


impl Dispatcher {
    pub fn new(unknown_exits: UnknownExitPolicy) -> Self {
        Self { unknown_exits }
    }

    /// Performs the side effect of `event` and classifies it. Fatal exits
    /// come back as errors.
    pub fn dispatch<C, P>(&self, event: ExitEvent, cpu: &mut C, io: &mut P) -> Result<Step>
    where
        C: GuestCpu + ?Sized,
        P: PortIo + ?Sized,
    {
        match event {
            ExitEvent::IoIn(access) => {
                let mut data = vec![0u8; access.len()];
                io.read(access.port, access.size as usize, &mut data)
                    .map_err(|source| VmmError::PortIo { port: access.port, source })?;
                cpu.complete_io_in(&access, &data)?;
                Ok(Step::Continue)
            }
            ExitEvent::IoOut(access, data) => {
                io.write(access.port, access.size as usize, &data)
                    .map_err(|source| VmmError::PortIo { port: access.port, source })?;
                Ok(Step::Continue)
            }
            ExitEvent::Debug { exception, pc } => {
                debug!("debug exit: exception {} at {:#x}", exception, pc);
                Ok(Step::Continue)
            }
            ExitEvent::Halt => Ok(Step::Stop(StopReason::Halt)),
            ExitEvent::Shutdown => Ok(Step::Stop(StopReason::Shutdown)),
            ExitEvent::FailEntry { hardware_reason } => {
                error!("guest entry failed, hardware reason {:#x}", hardware_reason);
                Err(VmmError::EntryFailed { hardware_reason })
            }
            ExitEvent::InternalError { suberror, data } => {
                error!("KVM internal error, suberror {} data {:x?}", suberror, data);
                Err(VmmError::InternalError { suberror, data })
            }
            ExitEvent::Unknown(reason) => match self.unknown_exits {
                UnknownExitPolicy::Fatal => {
                    error!("unhandled exit reason {}", reason);
                    Err(VmmError::UnknownExit(reason))
                }
                UnknownExitPolicy::LogAndContinue => {
                    warn!("ignoring unhandled exit reason {}", reason);
                    Ok(Step::Continue)
                }
            },
        }
    }
}


#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    exits: u64,
    io_in: u64,
    io_out: u64,
    debug: u64,
    ignored_unknown: u64,
}


impl Counters {
    fn record(&mut self, event: &ExitEvent) {
        self.exits += 1;
        match event {
            ExitEvent::IoIn(_) => self.io_in += 1,
            ExitEvent::IoOut(..) => self.io_out += 1,
            ExitEvent::Debug { .. } => self.debug += 1,
            ExitEvent::Unknown(_) => self.ignored_unknown += 1,
            _ => {}
        }
    }
}


/// Resume / dispatch loop for one vCPU.
pub struct VmLoop {
    dispatcher: Dispatcher,
    counters: Counters,
}


impl VmLoop {
    pub fn new(unknown_exits: UnknownExitPolicy) -> Self {
        Self { dispatcher: Dispatcher::new(unknown_exits), counters: Counters::default() }
    }

    /// Resumes `cpu` until the guest halts or shuts down, or an exit is fatal.
    pub fn run_until_exit<C, P>(&mut self, cpu: &mut C, io: &mut P) -> Result<RunReport>
    where
        C: GuestCpu + ?Sized,
        P: PortIo + ?Sized,
    {
        info!("starting guest execution");
        loop {
            let event = cpu.resume()?;
            self.counters.record(&event);
            if let Step::Stop(stop) = self.dispatcher.dispatch(event, cpu, io)? {
                info!("guest stopped ({:?}) after {} exits", stop, self.counters.exits);
                return Ok(self.report(stop));
            }
        }
    }

    fn report(&self, stop: StopReason) -> RunReport {
        let c = self.counters;
        RunReport {
            exits: c.exits,
            io_in: c.io_in,
            io_out: c.io_out,
            debug: c.debug,
            ignored_unknown: c.ignored_unknown,
            ..RunReport::new(stop)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::devices::{ConsolePort, EchoPort};
    use std::collections::VecDeque;
    use std::io::{self, Cursor};

    fn io(port: u16, size: u8) -> IoAccess {
        IoAccess { port, size, count: 1, data_offset: 0x1000 }
    }

    /// Replays a fixed list of exits.
    #[derive(Default)]
    struct ScriptedCpu {
        script: VecDeque<Result<ExitEvent>>,
        resumes: usize,
        inputs: Vec<(u16, Vec<u8>)>,
    }

    impl ScriptedCpu {
        fn new(events: Vec<ExitEvent>) -> Self {
            Self { script: events.into_iter().map(Ok).collect(), ..Default::default() }
        }
    }

    impl GuestCpu for ScriptedCpu {
        fn resume(&mut self) -> Result<ExitEvent> {
            self.resumes += 1;
            self.script.pop_front().unwrap_or(Err(VmmError::StaleContext { id: 0 }))
        }

        fn complete_io_in(&mut self, io: &IoAccess, data: &[u8]) -> Result<()> {
            self.inputs.push((io.port, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_io_out_then_halt() {
        let mut cpu = ScriptedCpu::new(vec![ExitEvent::IoOut(io(0x10, 1), vec![0x42]), ExitEvent::Halt]);
        let mut port = EchoPort::new();

        let report = VmLoop::new(UnknownExitPolicy::Fatal).run_until_exit(&mut cpu, &mut port).unwrap();

        assert_eq!(report.stop, StopReason::Halt);
        assert_eq!(report.exits, 2);
        assert_eq!(report.io_out, 1);
        assert_eq!(port.writes(), &[(0x10, vec![0x42])]);
    }

    #[test]
    fn test_io_in_is_filled_before_next_resume() {
        let mut cpu = ScriptedCpu::new(vec![
            ExitEvent::IoOut(io(0x10, 1), vec![0x42]),
            ExitEvent::IoIn(io(0x10, 1)),
            ExitEvent::Shutdown,
        ]);
        let mut port = EchoPort::new();

        let report = VmLoop::new(UnknownExitPolicy::Fatal).run_until_exit(&mut cpu, &mut port).unwrap();

        assert_eq!(report.stop, StopReason::Shutdown);
        assert_eq!(report.io_in, 1);
        assert_eq!(cpu.inputs, vec![(0x10, vec![0x42])]);
    }

    #[test]
    fn test_debug_exits_continue() {
        let mut cpu = ScriptedCpu::new(vec![
            ExitEvent::Debug { exception: 1, pc: 0xF0000 },
            ExitEvent::Debug { exception: 1, pc: 0xF0002 },
            ExitEvent::Halt,
        ]);
        let report = VmLoop::new(UnknownExitPolicy::Fatal)
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap();
        assert_eq!(report.debug, 2);
        assert_eq!(cpu.resumes, 3);
    }

    #[test]
    fn test_internal_error_is_terminal() {
        let mut cpu = ScriptedCpu::new(vec![
            ExitEvent::InternalError { suberror: 1, data: vec![] },
            ExitEvent::Halt,
        ]);
        let err = VmLoop::new(UnknownExitPolicy::LogAndContinue)
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap_err();

        assert!(matches!(err, VmmError::InternalError { suberror: 1, .. }));
        assert_eq!(cpu.resumes, 1);
    }

    #[test]
    fn test_unknown_exit_is_fatal_by_default() {
        let mut cpu = ScriptedCpu::new(vec![ExitEvent::Unknown(6), ExitEvent::Halt]);
        let err = VmLoop::new(UnknownExitPolicy::default())
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap_err();
        assert!(matches!(err, VmmError::UnknownExit(6)));
        assert_eq!(cpu.resumes, 1);
    }

    #[test]
    fn test_unknown_exit_tolerated_when_configured() {
        let mut cpu = ScriptedCpu::new(vec![ExitEvent::Unknown(6), ExitEvent::Halt]);
        let report = VmLoop::new(UnknownExitPolicy::LogAndContinue)
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap();
        assert_eq!(report.ignored_unknown, 1);
        assert_eq!(report.stop, StopReason::Halt);
    }

    #[test]
    fn test_fail_entry_is_fatal() {
        let mut cpu = ScriptedCpu::new(vec![ExitEvent::FailEntry { hardware_reason: 0x21 }]);
        let err = VmLoop::new(UnknownExitPolicy::LogAndContinue)
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap_err();
        assert!(matches!(err, VmmError::EntryFailed { hardware_reason: 0x21 }));
    }

    #[test]
    fn test_port_input_failure_stops_the_loop() {
        let mut cpu = ScriptedCpu::new(vec![ExitEvent::IoIn(io(0x10, 1)), ExitEvent::Halt]);
        let mut port = ConsolePort::new(Cursor::new(Vec::new()), Vec::new());

        let err = VmLoop::new(UnknownExitPolicy::LogAndContinue)
            .run_until_exit(&mut cpu, &mut port)
            .unwrap_err();

        match err {
            VmmError::PortIo { port, source } => {
                assert_eq!(port, 0x10);
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(cpu.inputs.is_empty());
        assert_eq!(cpu.resumes, 1);
    }

    #[test]
    fn test_port_output_failure_is_fatal() {
        struct RefusingPort;

        impl PortIo for RefusingPort {
            fn read(&mut self, _port: u16, _size: usize, _data: &mut [u8]) -> io::Result<()> {
                Ok(())
            }

            fn write(&mut self, _port: u16, _size: usize, _data: &[u8]) -> io::Result<()> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }

        let mut cpu = ScriptedCpu::new(vec![ExitEvent::IoOut(io(0x10, 1), vec![0x42]), ExitEvent::Halt]);
        let err = VmLoop::new(UnknownExitPolicy::Fatal)
            .run_until_exit(&mut cpu, &mut RefusingPort)
            .unwrap_err();

        assert!(matches!(err, VmmError::PortIo { port: 0x10, .. }));
        assert!(err.is_run_failure());
        assert_eq!(cpu.resumes, 1);
    }

    #[test]
    fn test_resume_failure_propagates() {
        let mut cpu = ScriptedCpu::default();
        cpu.script.push_back(Err(VmmError::ResumeFailed(vmm_sys_util::errno::Error::new(libc::EFAULT))));
        let err = VmLoop::new(UnknownExitPolicy::Fatal)
            .run_until_exit(&mut cpu, &mut EchoPort::new())
            .unwrap_err();
        assert!(matches!(err, VmmError::ResumeFailed(_)));
    }
}
