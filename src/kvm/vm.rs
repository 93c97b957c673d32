//! Virtual machine provisioning, state machine, and control-plane server.
//!
//! # Provisioning
//!
//! `Vm::new` runs the fixed startup sequence; any failure aborts with a
//! specific error and unwinds everything provisioned so far:
//!
//! 1. open `/dev/kvm` (read-write, close-on-exec)
//! 2. verify the KVM API version against the compile-time constant
//! 3. create the VM file descriptor
//! 4. probe required capabilities (user memory regions, extended CPUID,
//!    and the TSS address on Intel hosts)
//! 5. on Intel, set the Task State Segment base
//! 6. allocate guest memory (anonymous mmap; zero size rejected)
//! 7. register it as slot 0 at guest-physical 0
//! 8. initialize the command mutex and set the state to PAUSED
//!
//! # State machine
//!
//! ```text
//! PAUSED ──RESUME──▶ RUNNING ──PAUSE──▶ PAUSED
//!   │                   │
//!   └──SHUTDOWN─────────┴─────────────▶ SHUTDOWN (terminal)
//! ```
//!
//! HLT from any vCPU, a failed run ioctl, or SIGINT/SIGTERM at the server
//! also drive the state to SHUTDOWN. The state is one atomic word so the
//! vCPU threads can read it without synchronization; [`StateCell::set`]
//! refuses to leave SHUTDOWN, which makes the terminal state immune to any
//! handler ordering.
//!
//! # Control plane
//!
//! The main thread owns a non-blocking listener inside the VM's rendezvous
//! directory and interleaves `accept` with state checks and a 100 ms sleep.
//! Connections are served one at a time; a client may pipeline several
//! commands and gets exactly one reply per command. SHOW_REGS and DUMP_MEM
//! demand a paused VM, so the snapshots they take are consistent with the
//! last instruction the guest committed.

use std::fs::OpenOptions;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kvm_bindings::{kvm_userspace_memory_region, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Cap, Kvm, VmFd};
use tracing::{info, warn};

use crate::error::VmmError;
use crate::ipc::{self, Command, CommandTag, Reply};
use crate::kvm::vcpu::{self, Vcpu};
use crate::kvm::{
    host_cpu_vendor, io_err, CpuVendor, GuestMemory, VmState, KERNEL_LOAD_ADDR, MAX_VCPUS,
    TSS_ADDR,
};
use crate::rendezvous::Rendezvous;

/// Interval between accept attempts in the control-plane loop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Lock-free VM state cell shared between the main thread and every vCPU
/// thread.
///
/// A single-word atomic: reads are unsynchronized and best-effort, stores
/// are immediate. SHUTDOWN is terminal; once stored, no later `set` can
/// leave it.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: VmState) -> StateCell {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> VmState {
        VmState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Stores a new state, unless the cell already reached SHUTDOWN.
    pub fn set(&self, new: VmState) {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if VmState::from_u8(current) == VmState::Shutdown {
                return;
            }
            match self.0.compare_exchange(
                current,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

// ── Termination signals ─────────────────────────────────────────────

/// Set by the SIGINT/SIGTERM handler; polled by the serve loop.
static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn term_handler(_sig: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::Relaxed);
}

/// Installs SIGINT/SIGTERM handlers that request a shutdown.
///
/// Registered without SA_RESTART so a blocked command read is interrupted
/// and the serve loop gets to observe the flag.
pub fn install_term_signal_handlers() {
    // SAFETY: sigaction with a handler that only stores to an atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = term_handler as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for sig in [libc::SIGINT, libc::SIGTERM] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}

fn term_requested() -> bool {
    TERM_REQUESTED.load(Ordering::Relaxed)
}

// ── The VM ──────────────────────────────────────────────────────────

/// A provisioned virtual machine.
pub struct Vm {
    name: Option<String>,
    kvm: Kvm,
    vm: VmFd,
    memory: GuestMemory,
    vcpus: Vec<Vcpu>,
    listener: Option<UnixListener>,
    state: Arc<StateCell>,
    /// Serializes command handlers; vCPU threads never take it.
    lock: Mutex<()>,
}

impl Vm {
    /// Provisions a VM with `mem_size` bytes of guest memory (see the
    /// module docs for the exact sequence).
    pub fn new(name: Option<String>, mem_size: u64) -> Result<Vm, VmmError> {
        let kvm = Kvm::new().map_err(|e| VmmError::NoDevice(io_err(e)))?;
        info!("/dev/kvm device opened");

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(VmmError::WrongVersion {
                expected: KVM_API_VERSION as i32,
                got: version,
            });
        }

        let vm = kvm.create_vm().map_err(|e| VmmError::CreateVm(io_err(e)))?;
        info!("KVM virtual machine created");

        let vendor = host_cpu_vendor();
        let mut required: Vec<(Cap, &'static str)> = vec![
            (Cap::UserMemory, "KVM_CAP_USER_MEMORY"),
            (Cap::ExtCpuid, "KVM_CAP_EXT_CPUID"),
        ];
        if vendor == CpuVendor::Intel {
            required.push((Cap::SetTssAddr, "KVM_CAP_SET_TSS_ADDR"));
        }
        for (cap, cap_name) in required {
            if !kvm.check_extension(cap) {
                return Err(VmmError::UnsupportedCaps(cap_name));
            }
        }

        if vendor == CpuVendor::Intel {
            // Intel VT-x refuses to run without a TSS base; AMD-V does not
            // have the requirement.
            info!("Intel host, setting TSS address to {TSS_ADDR:#x}");
            vm.set_tss_address(TSS_ADDR)
                .map_err(|e| VmmError::Ioctl(io_err(e)))?;
        }

        let memory = GuestMemory::new(mem_size)?;
        info!("VM memory allocated ({mem_size} bytes)");

        let (host_addr, size) = memory.as_raw_parts();
        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: the region describes memory owned by `memory`, which is
        // stored in the Vm and outlives the VM file descriptor.
        unsafe { vm.set_user_memory_region(region) }
            .map_err(|e| VmmError::MemoryRegion(io_err(e)))?;
        info!("VM memory region created at guest physical address 0x0");

        Ok(Vm {
            name,
            kvm,
            vm,
            memory,
            vcpus: Vec::new(),
            listener: None,
            state: Arc::new(StateCell::new(VmState::Paused)),
            lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> VmState {
        self.state.get()
    }

    /// Copies the guest binary to its load address.
    pub fn load_image(&self, image: &[u8]) -> Result<(), VmmError> {
        self.memory.load_image(image, KERNEL_LOAD_ADDR)?;
        info!("kernel loaded at guest physical {KERNEL_LOAD_ADDR:#x}");
        Ok(())
    }

    /// Creates the next vCPU (ids are a dense prefix of the naturals).
    pub fn add_vcpu(&mut self) -> Result<u32, VmmError> {
        let id = self.vcpus.len() as u32;
        if id as usize >= MAX_VCPUS {
            return Err(VmmError::VcpuCreation {
                id,
                source: std::io::Error::other(format!("more than {MAX_VCPUS} vcpus")),
            });
        }

        let fd = self
            .vm
            .create_vcpu(id as u64)
            .map_err(|e| VmmError::VcpuCreation {
                id,
                source: io_err(e),
            })?;

        self.vcpus.push(Vcpu::new(id, fd));
        info!("vcpu {id} initialized");
        Ok(id)
    }

    /// Initializes registers, segmentation, CPUID and control signals for
    /// one vCPU, entering the guest at `start_addr`.
    pub fn setup_vcpu(&self, id: u32, start_addr: u64) -> Result<(), VmmError> {
        let vcpu = self
            .vcpus
            .get(id as usize)
            .ok_or_else(|| VmmError::Internal(format!("no vcpu with id {id}")))?;

        let cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| VmmError::VcpuCreation {
                id,
                source: io_err(e),
            })?;

        vcpu.setup(start_addr, self.memory.size(), &cpuid)
    }

    /// Spawns the run-loop threads and transitions PAUSED → RUNNING.
    pub fn start(&mut self) -> Result<(), VmmError> {
        if self.vcpus.is_empty() {
            return Err(VmmError::Run("cannot start a VM with no vcpus".to_string()));
        }

        for vcpu in &mut self.vcpus {
            vcpu.start(Arc::clone(&self.state))?;
        }

        match &self.name {
            Some(name) => info!("starting vm {name}"),
            None => info!("starting unnamed vm"),
        }
        self.state.set(VmState::Running);
        Ok(())
    }

    /// Binds the control socket inside the rendezvous directory.
    pub fn bind_control_socket(&mut self, rendezvous: &Rendezvous) -> Result<(), VmmError> {
        let path = rendezvous.socket_path();
        self.listener = Some(ipc::bind_listener(&path)?);
        info!("control socket listening at {}", path.display());
        Ok(())
    }

    fn signal_vcpus(&self, sig: i32) {
        for vcpu in &self.vcpus {
            vcpu.signal(sig);
        }
    }

    /// Control-plane loop: accept, serve, watch for termination. Returns
    /// once the state is SHUTDOWN.
    pub fn serve(&self) {
        while self.state.get() != VmState::Shutdown {
            let accepted = match &self.listener {
                Some(listener) => match listener.accept() {
                    Ok((stream, _)) => Some(stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        None
                    }
                },
                None => None,
            };

            if let Some(stream) = accepted {
                self.handle_connection(stream);
            }

            if term_requested() {
                info!("termination signal received, shutting down");
                self.state.set(VmState::Shutdown);
                self.signal_vcpus(vcpu::sig_shutdown());
            }

            std::thread::sleep(ACCEPT_POLL);
        }
    }

    /// Serves one connection: commands in, one reply each, until the peer
    /// closes.
    fn handle_connection(&self, mut stream: UnixStream) {
        // The listener is non-blocking; reads on the accepted stream must
        // block so a pipelined client is served without spinning.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("cannot make connection blocking: {e}");
            return;
        }

        loop {
            match ipc::read_command(&mut stream) {
                Ok(Some(cmd)) => {
                    let reply = self.handle_command(&cmd);
                    if let Err(e) = ipc::write_reply(&mut stream, &reply) {
                        warn!("dropping connection: {e}");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping connection: {e}");
                    break;
                }
            }
        }
    }

    /// Dispatches one control command and builds its reply.
    pub fn handle_command(&self, cmd: &Command) -> Box<Reply> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut reply = Reply::for_command(cmd);

        let result = match cmd.tag() {
            Some(CommandTag::None) | Some(CommandTag::ShowState) => Ok(()),
            Some(CommandTag::ShowRegs) => self.fill_regs(cmd.vcpu_mask, &mut reply),
            Some(CommandTag::DumpMem) => self.dump_to_caller(cmd),
            Some(CommandTag::Pause) => {
                self.state.set(VmState::Paused);
                self.signal_vcpus(vcpu::sig_pause());
                info!("VM paused");
                Ok(())
            }
            Some(CommandTag::Resume) => {
                self.state.set(VmState::Running);
                self.signal_vcpus(vcpu::sig_resume());
                info!("VM resumed");
                Ok(())
            }
            Some(CommandTag::Shutdown) => {
                self.state.set(VmState::Shutdown);
                self.signal_vcpus(vcpu::sig_shutdown());
                info!("VM shutdown requested");
                Ok(())
            }
            None => Err(VmmError::Internal(format!(
                "unknown command tag {}",
                cmd.tag
            ))),
        };

        if let Err(e) = result {
            warn!("command failed: {e}");
            reply.error = e.code();
        }
        reply.state = self.state.get() as u8 as u32;
        reply
    }

    /// SHOW_REGS: snapshot registers of every in-range vCPU named by the
    /// mask. Requires a paused VM.
    fn fill_regs(&self, mask: u64, reply: &mut Reply) -> Result<(), VmmError> {
        if self.state.get() != VmState::Paused {
            return Err(VmmError::VmNotPaused);
        }

        for (id, vcpu) in self.vcpus.iter().enumerate() {
            if mask & (1 << id) == 0 {
                continue;
            }
            reply.regs[id] = vcpu.get_regs()?;
            reply.sregs[id] = vcpu.get_sregs()?;
        }
        Ok(())
    }

    /// DUMP_MEM: write a hex dump of guest memory onto the caller's stdout
    /// via `/proc/<pid>/fd/1`. Requires a paused VM.
    fn dump_to_caller(&self, cmd: &Command) -> Result<(), VmmError> {
        if self.state.get() != VmState::Paused {
            return Err(VmmError::VmNotPaused);
        }

        let [start, end, word_size, bytes_per_line] = cmd.mem_range;
        if start < 0 || word_size <= 0 || bytes_per_line <= 0 {
            return Err(VmmError::Internal(format!(
                "bad memory range: {:?}",
                cmd.mem_range
            )));
        }
        let end = if end < 0 { self.memory.size() } else { end as u64 };

        // Reaching the caller's terminal through proc assumes a shared pid
        // namespace, which holds for a same-host rendezvous under /tmp.
        let path = format!("/proc/{}/fd/1", cmd.pid);
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VmmError::Internal(format!("cannot open {path}: {e}")))?;

        self.memory.dump(
            &mut out,
            start as u64,
            end,
            word_size as u64,
            bytes_per_line as u64,
        )
    }

    /// Waits for every vCPU thread to exit.
    pub fn join_vcpus(&mut self) {
        for vcpu in &mut self.vcpus {
            vcpu.join();
        }
        info!("all vcpu threads joined");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(VmState::Paused);
        assert_eq!(cell.get(), VmState::Paused);

        cell.set(VmState::Running);
        assert_eq!(cell.get(), VmState::Running);

        cell.set(VmState::Paused);
        assert_eq!(cell.get(), VmState::Paused);
    }

    #[test]
    fn test_state_cell_shutdown_is_terminal() {
        let cell = StateCell::new(VmState::Running);
        cell.set(VmState::Shutdown);

        cell.set(VmState::Running);
        assert_eq!(cell.get(), VmState::Shutdown);
        cell.set(VmState::Paused);
        assert_eq!(cell.get(), VmState::Shutdown);
    }

    /// KVM-dependent tests self-skip on hosts without a usable /dev/kvm.
    fn test_vm(mem_size: u64) -> Option<Vm> {
        if Kvm::new().is_err() {
            eprintln!("skipping: /dev/kvm not available");
            return None;
        }
        Some(Vm::new(None, mem_size).unwrap())
    }

    #[test]
    fn test_provisioning() {
        let Some(mut vm) = test_vm(64_000) else { return };

        assert_eq!(vm.state(), VmState::Paused);
        vm.load_image(&[0xf4]).unwrap();

        assert_eq!(vm.add_vcpu().unwrap(), 0);
        assert_eq!(vm.add_vcpu().unwrap(), 1);
        vm.setup_vcpu(0, KERNEL_LOAD_ADDR).unwrap();
        vm.setup_vcpu(1, KERNEL_LOAD_ADDR).unwrap();
    }

    #[test]
    fn test_rejects_zero_memory() {
        if Kvm::new().is_err() {
            eprintln!("skipping: /dev/kvm not available");
            return;
        }
        assert!(matches!(Vm::new(None, 0), Err(VmmError::Allocation(_))));
    }

    #[test]
    fn test_show_regs_requires_pause() {
        let Some(mut vm) = test_vm(64_000) else { return };
        vm.add_vcpu().unwrap();
        vm.setup_vcpu(0, KERNEL_LOAD_ADDR).unwrap();

        // Freshly provisioned VMs are paused: reading registers works and
        // reflects the initial state.
        let mut cmd = Command::new(CommandTag::ShowRegs);
        cmd.vcpu_mask = 0b1;
        let reply = vm.handle_command(&cmd);
        assert_eq!(reply.error, 0);
        assert_eq!(reply.regs[0].rip, KERNEL_LOAD_ADDR);

        // RESUME flips the precondition.
        let resume = Command::new(CommandTag::Resume);
        assert_eq!(vm.handle_command(&resume).state(), VmState::Running);
        let reply = vm.handle_command(&cmd);
        assert_eq!(reply.error, VmmError::VmNotPaused.code());

        let pause = Command::new(CommandTag::Pause);
        assert_eq!(vm.handle_command(&pause).state(), VmState::Paused);
    }

    #[test]
    fn test_shutdown_command_is_terminal() {
        let Some(mut vm) = test_vm(64_000) else { return };
        vm.add_vcpu().unwrap();
        vm.setup_vcpu(0, KERNEL_LOAD_ADDR).unwrap();

        let reply = vm.handle_command(&Command::new(CommandTag::Shutdown));
        assert_eq!(reply.state(), VmState::Shutdown);

        // No handler can leave the terminal state.
        let reply = vm.handle_command(&Command::new(CommandTag::Resume));
        assert_eq!(reply.state(), VmState::Shutdown);
    }

    #[test]
    fn test_halt_guest_runs_to_shutdown() {
        // A guest that is a single `hlt` must halt the VM within 2 s.
        let Some(mut vm) = test_vm(64_000) else { return };
        vm.load_image(&[0xf4]).unwrap();
        vm.add_vcpu().unwrap();
        vm.setup_vcpu(0, KERNEL_LOAD_ADDR).unwrap();
        vm.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while vm.state() != VmState::Shutdown && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(vm.state(), VmState::Shutdown);
        vm.join_vcpus();
    }
}
