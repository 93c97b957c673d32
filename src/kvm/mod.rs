//! KVM (Kernel-based Virtual Machine) core.
//!
//! This module family wraps Linux KVM for hardware-assisted virtualization
//! and carries the VM's runtime state machine. The VMM talks to KVM through
//! ioctls on three file descriptors:
//!
//! - `/dev/kvm` - system-level operations (API version, capabilities, VMs)
//! - VM file descriptor - VM-level operations (memory slots, create vCPUs)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! # Execution model
//!
//! Each vCPU runs on its own host thread in a loop: issue `KVM_RUN`, let the
//! guest execute until a VM exit, handle the exit reason, repeat. The main
//! thread meanwhile serves the control socket and steers the shared VM state:
//!
//! ```text
//! main thread                        vCPU threads (one per vCPU)
//! ┌──────────────────┐              ┌───────────────────────────┐
//! │ accept() loop    │   signals    │ while state != SHUTDOWN   │
//! │ command handlers ├─────────────►│   paused? sleep 10ms      │
//! │ (pause/resume/   │  SIGRTMIN+n  │   KVM_RUN                 │
//! │  regs/dump/...)  │              │   dispatch exit reason    │
//! └────────┬─────────┘              └─────────────┬─────────────┘
//!          │                                      │
//!          └───────────► VM state ◄───────────────┘
//!                   (PAUSED / RUNNING / SHUTDOWN)
//! ```
//!
//! The state word is a single atomic cell; the three real-time signals exist
//! only to knock a vCPU thread out of a blocked `KVM_RUN` so it re-reads the
//! state promptly.
//!
//! # Module map
//!
//! - [`vm`] - VM provisioning, state machine, control-plane server
//! - [`vcpu`] - vCPU provisioning and the per-thread run loop
//! - [`memory`] - guest physical memory and the hex dump

pub mod memory;
pub mod vcpu;
pub mod vm;

pub use memory::GuestMemory;
pub use vcpu::Vcpu;
pub use vm::Vm;

/// Widest supported vCPU mask; ids run 0..MAX_VCPUS.
pub const MAX_VCPUS: usize = 64;

/// Converts a kvm-ioctls errno into a `std::io::Error` so it can ride as a
/// `#[source]` inside [`crate::error::VmmError`].
pub(crate) fn io_err(e: kvm_ioctls::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e.errno())
}

/// Guest physical address the kernel image is loaded at; also the initial
/// instruction pointer.
pub const KERNEL_LOAD_ADDR: u64 = 0x1000;

/// Task State Segment base required by Intel VT-x before the first run.
///
/// Lives in the unused hole below 4GB; KVM only needs the address to be
/// valid, not backed.
pub const TSS_ADDR: usize = 0xfffb_d000;

/// VM lifecycle state. SHUTDOWN is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    Paused = 0,
    Running = 1,
    Shutdown = 2,
}

impl VmState {
    /// Decodes a wire/state-cell value; anything unknown reads as SHUTDOWN,
    /// the safe terminal interpretation.
    pub fn from_u8(v: u8) -> VmState {
        match v {
            0 => VmState::Paused,
            1 => VmState::Running,
            _ => VmState::Shutdown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Paused => "paused",
            VmState::Running => "running",
            VmState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host CPU vendor, as reported by CPUID leaf 0.
///
/// Only used to decide whether the TSS base must be configured (an Intel
/// VT-x requirement; AMD-V does not care).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

/// Reads the host CPU vendor string with the native CPUID instruction.
#[cfg(target_arch = "x86_64")]
pub fn host_cpu_vendor() -> CpuVendor {
    // SAFETY: CPUID leaf 0 is defined on every x86_64 processor.
    let leaf = unsafe { core::arch::x86_64::__cpuid(0) };

    // The 12-byte vendor string is spread over EBX, EDX, ECX in that order.
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&leaf.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&leaf.ecx.to_le_bytes());

    match &vendor {
        b"GenuineIntel" => CpuVendor::Intel,
        b"AuthenticAMD" => CpuVendor::Amd,
        _ => CpuVendor::Unknown,
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn host_cpu_vendor() -> CpuVendor {
    CpuVendor::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [VmState::Paused, VmState::Running, VmState::Shutdown] {
            assert_eq!(VmState::from_u8(s as u8), s);
        }
        // Unknown encodings collapse to the terminal state.
        assert_eq!(VmState::from_u8(250), VmState::Shutdown);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(VmState::Paused.to_string(), "paused");
        assert_eq!(VmState::Running.to_string(), "running");
        assert_eq!(VmState::Shutdown.to_string(), "shutdown");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_vendor_probe_runs() {
        // We cannot assert which vendor CI runs on, only that the probe
        // returns a stable answer.
        assert_eq!(host_cpu_vendor(), host_cpu_vendor());
    }
}
