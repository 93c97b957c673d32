//! Virtual CPU provisioning and execution.
//!
//! Each vCPU owns a KVM vCPU file descriptor and a host thread running the
//! `KVM_RUN` loop. The shared run-area KVM uses to describe VM exits is
//! mapped and decoded by `kvm-ioctls` when the handle is created; this
//! module only ever sees the decoded [`VcpuExit`] values.
//!
//! # Initial CPU state
//!
//! The guest binary is entered directly, with no BIOS or bootloader:
//!
//! - RIP = load address, RSP = RBP = top of guest memory
//! - RFLAGS = 0x2 (bit 1 is reserved-must-be-one; VM entry fails without it)
//! - CS/DS/SS selectors and bases forced to zero for flat real-mode-like
//!   segmentation
//! - the host's supported CPUID leaves applied unmasked
//!
//! # Pause / resume / shutdown signals
//!
//! Three real-time signals (`SIGRTMIN+0/1/2`) are installed with no-op
//! handlers. Their only purpose is to make a blocked `KVM_RUN` return
//! `EINTR` so the thread re-reads the shared VM state; the state word
//! itself is the actual instruction. A paused thread parks in 10 ms sleeps
//! and never re-enters the guest, so no guest instruction can commit after
//! its thread has observed PAUSED.

use std::os::unix::thread::JoinHandleExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use kvm_bindings::{kvm_regs, kvm_sregs, CpuId};
use kvm_ioctls::{VcpuExit, VcpuFd};
use tracing::{error, info, trace};

use crate::devices::{Serial, SERIAL_PORT};
use crate::error::VmmError;
use crate::kvm::vm::StateCell;
use crate::kvm::{io_err, VmState};

/// Interval between state polls while the VM is paused.
const PAUSE_POLL: Duration = Duration::from_millis(10);

/// Signal that interrupts `KVM_RUN` for a pause.
pub fn sig_pause() -> i32 {
    libc::SIGRTMIN()
}

/// Signal that interrupts `KVM_RUN` for a resume.
pub fn sig_resume() -> i32 {
    libc::SIGRTMIN() + 1
}

/// Signal that interrupts `KVM_RUN` for a shutdown.
pub fn sig_shutdown() -> i32 {
    libc::SIGRTMIN() + 2
}

extern "C" fn interrupt_handler(_sig: libc::c_int) {
    // Intentionally empty: the signal only exists to interrupt KVM_RUN.
}

/// Installs the no-op handlers for the three control signals. Idempotent.
fn install_control_signal_handlers() {
    // SAFETY: installing a handler that touches no state, per signal(2).
    unsafe {
        for sig in [sig_pause(), sig_resume(), sig_shutdown()] {
            libc::signal(sig, interrupt_handler as *const () as libc::sighandler_t);
        }
    }
}

/// What the run loop does after decoding one VM exit.
enum ExitAction {
    Continue,
    Shutdown,
    /// KVM reported an internal error: dump registers, then shut down.
    InternalError,
}

/// A virtual CPU: KVM handle plus its host thread.
///
/// The handle lives behind a mutex shared between the run-loop thread and
/// the control plane. The run loop holds it only across a single `KVM_RUN`;
/// register readback happens exclusively while the VM is paused, when the
/// thread is parked outside the lock.
pub struct Vcpu {
    pub id: u32,
    fd: Arc<Mutex<VcpuFd>>,
    thread: Option<JoinHandle<()>>,
}

impl Vcpu {
    pub(crate) fn new(id: u32, fd: VcpuFd) -> Vcpu {
        Vcpu {
            id,
            fd: Arc::new(Mutex::new(fd)),
            thread: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VcpuFd> {
        self.fd.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes the initial register state and CPUID, and installs the
    /// control signal handlers.
    ///
    /// Must not be called while the run thread exists: register writes are
    /// only valid outside `KVM_RUN`.
    pub fn setup(&self, start_addr: u64, mem_size: u64, cpuid: &CpuId) -> Result<(), VmmError> {
        let creation_err = |e: kvm_ioctls::Error| VmmError::VcpuCreation {
            id: self.id,
            source: io_err(e),
        };

        let fd = self.lock();

        let regs = kvm_regs {
            rip: start_addr,
            rsp: mem_size - 1,
            rbp: mem_size - 1,
            rflags: 0x2,
            ..Default::default()
        };
        fd.set_regs(&regs).map_err(creation_err)?;
        info!("vcpu {}: registers set (rip {start_addr:#x})", self.id);

        let mut sregs = fd.get_sregs().map_err(creation_err)?;
        sregs.cs.selector = 0;
        sregs.cs.base = 0;
        sregs.ds.selector = 0;
        sregs.ds.base = 0;
        sregs.ss.selector = 0;
        sregs.ss.base = 0;
        fd.set_sregs(&sregs).map_err(creation_err)?;
        info!("vcpu {}: segment registers set", self.id);

        fd.set_cpuid2(cpuid).map_err(creation_err)?;

        install_control_signal_handlers();
        Ok(())
    }

    /// Reads the general registers. Callers must hold the VM paused.
    pub fn get_regs(&self) -> Result<kvm_regs, VmmError> {
        self.lock().get_regs().map_err(|e| VmmError::Ioctl(io_err(e)))
    }

    /// Reads the segment/control registers. Callers must hold the VM paused.
    pub fn get_sregs(&self) -> Result<kvm_sregs, VmmError> {
        self.lock().get_sregs().map_err(|e| VmmError::Ioctl(io_err(e)))
    }

    /// Spawns the run-loop thread.
    pub fn start(&mut self, state: Arc<StateCell>) -> Result<(), VmmError> {
        let id = self.id;
        let fd = Arc::clone(&self.fd);

        let thread = std::thread::Builder::new()
            .name(format!("vcpu{id}"))
            .spawn(move || run_loop(id, &fd, &state))
            .map_err(|e| VmmError::Run(format!("cannot spawn thread for vcpu {id}: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Sends a control signal to the run-loop thread, interrupting a
    /// blocked `KVM_RUN`. A no-op before `start`.
    pub fn signal(&self, sig: i32) {
        if let Some(thread) = &self.thread {
            // SAFETY: the pthread handle stays valid until join() consumes
            // the JoinHandle, and the signal carries a no-op handler.
            unsafe {
                libc::pthread_kill(thread.as_pthread_t(), sig);
            }
        }
    }

    /// Waits for the run-loop thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("vcpu {}: thread panicked", self.id);
            }
        }
    }
}

/// Per-vCPU thread body: honor pause/resume/shutdown, run the guest,
/// dispatch exit reasons.
fn run_loop(id: u32, fd: &Mutex<VcpuFd>, state: &StateCell) {
    let mut serial = Serial::stdout();
    info!("vcpu {id}: thread started");

    while state.get() != VmState::Shutdown {
        if state.get() == VmState::Paused {
            std::thread::sleep(PAUSE_POLL);
            continue;
        }

        let mut vcpu = fd.lock().unwrap_or_else(|e| e.into_inner());
        match vcpu.run() {
            Ok(exit) => {
                let action = dispatch_exit(id, exit, &mut serial);
                match action {
                    ExitAction::Continue => {}
                    ExitAction::Shutdown => state.set(VmState::Shutdown),
                    ExitAction::InternalError => {
                        match vcpu.get_regs() {
                            Ok(regs) => log_regs(id, &regs),
                            Err(e) => error!("vcpu {id}: cannot read registers: {e}"),
                        }
                        state.set(VmState::Shutdown);
                    }
                }
            }
            Err(e) if e.errno() == libc::EINTR => {
                // A control signal knocked us out of KVM_RUN; loop around
                // and re-read the state word.
                trace!("vcpu {id}: run interrupted");
            }
            Err(e) => {
                error!("vcpu {id}: KVM_RUN failed: {e}");
                state.set(VmState::Shutdown);
            }
        }
    }

    info!("vcpu {id}: thread exiting");
}

fn dispatch_exit<W: std::io::Write>(
    id: u32,
    exit: VcpuExit<'_>,
    serial: &mut Serial<W>,
) -> ExitAction {
    match exit {
        VcpuExit::Hlt => {
            trace!("vcpu {id}: exit hlt");
            ExitAction::Shutdown
        }
        VcpuExit::IoOut(SERIAL_PORT, data) => {
            serial.write_bytes(data);
            ExitAction::Continue
        }
        VcpuExit::IoOut(port, _) => {
            error!("vcpu {id}: unhandled io out on port {port:#x}");
            ExitAction::Shutdown
        }
        VcpuExit::IoIn(port, _) => {
            error!("vcpu {id}: unhandled io in on port {port:#x}");
            ExitAction::Shutdown
        }
        VcpuExit::Shutdown => {
            error!("vcpu {id}: exit shutdown");
            ExitAction::Shutdown
        }
        VcpuExit::InternalError => {
            error!("vcpu {id}: exit internal error");
            ExitAction::InternalError
        }
        VcpuExit::FailEntry(reason, cpu) => {
            error!("vcpu {id}: failed to enter guest (reason {reason:#x}, cpu {cpu})");
            ExitAction::Shutdown
        }
        VcpuExit::Unknown => {
            error!("vcpu {id}: exit unknown");
            ExitAction::Shutdown
        }
        VcpuExit::Intr => {
            // Spurious wakeup or a control signal that raced KVM_RUN entry.
            trace!("vcpu {id}: exit intr");
            ExitAction::Continue
        }
        VcpuExit::Debug(_) => {
            trace!("vcpu {id}: exit debug");
            ExitAction::Continue
        }
        other => {
            trace!("vcpu {id}: unhandled exit {other:?}");
            ExitAction::Continue
        }
    }
}

/// Logs a general-register snapshot in the four-column layout the status
/// client also uses.
fn log_regs(id: u32, regs: &kvm_regs) {
    error!(
        "vcpu {id}: rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
        regs.rax, regs.rbx, regs.rcx, regs.rdx
    );
    error!(
        "vcpu {id}: r8  {:#018x} r9  {:#018x} r10 {:#018x} r11 {:#018x}",
        regs.r8, regs.r9, regs.r10, regs.r11
    );
    error!(
        "vcpu {id}: r12 {:#018x} r13 {:#018x} r14 {:#018x} r15 {:#018x}",
        regs.r12, regs.r13, regs.r14, regs.r15
    );
    error!(
        "vcpu {id}: rsp {:#018x} rbp {:#018x} rip {:#018x} rflags {:#018x}",
        regs.rsp, regs.rbp, regs.rip, regs.rflags
    );
    error!("vcpu {id}: rdi {:#018x} rsi {:#018x}", regs.rdi, regs.rsi);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signals_are_distinct_rt_signals() {
        let sigs = [sig_pause(), sig_resume(), sig_shutdown()];
        assert_eq!(sigs[1], sigs[0] + 1);
        assert_eq!(sigs[2], sigs[0] + 2);
        for sig in sigs {
            assert!(sig >= libc::SIGRTMIN() && sig <= libc::SIGRTMAX());
        }
    }

    #[test]
    fn test_install_handlers_is_idempotent() {
        install_control_signal_handlers();
        install_control_signal_handlers();
    }
}
