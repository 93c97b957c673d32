//! Crate-wide error type and its numeric codes.
//!
//! Every failure path funnels into [`VmmError`]. Each variant maps to a
//! stable numeric code that doubles as the process exit code and as the
//! error field of a control-plane reply, so a controller on the other end
//! of the socket can tell exactly which precondition failed.

use thiserror::Error;

/// Errors that can occur anywhere in the VMM.
#[derive(Error, Debug)]
pub enum VmmError {
    /// Malformed CLI input (bad number, bad list, bad size suffix).
    #[error("invalid argument: {0}")]
    Args(String),

    /// Failed to open /dev/kvm.
    ///
    /// This usually means KVM is not available (module not loaded, not
    /// running on Linux) or the user lacks permission on the device node.
    #[error("failed to open /dev/kvm: {0}")]
    NoDevice(#[source] std::io::Error),

    /// The kernel speaks a different KVM API version than we were built for.
    #[error("wrong KVM API version: expected {expected}, got {got}")]
    WrongVersion { expected: i32, got: i32 },

    /// Failed to create the VM file descriptor.
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] std::io::Error),

    /// A capability the VMM depends on is missing on this host.
    #[error("unsupported KVM capability: {0}")]
    UnsupportedCaps(&'static str),

    /// Guest memory allocation failed (also raised for a zero-size request).
    #[error("failed to allocate guest memory: {0}")]
    Allocation(String),

    /// Registering guest memory as a user memory region failed.
    #[error("failed to set user memory region: {0}")]
    MemoryRegion(#[source] std::io::Error),

    /// vCPU handle creation, run-area access, or register setup failed.
    #[error("failed to set up vcpu {id}: {source}")]
    VcpuCreation {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// Miscellaneous device ioctl failure.
    #[error("kvm ioctl failed: {0}")]
    Ioctl(#[source] std::io::Error),

    /// Thread spawn or run-loop failure.
    #[error("failed to run VM: {0}")]
    Run(String),

    /// Rendezvous directory or pidfile could not be set up, or the name is
    /// already owned by a live VM.
    #[error("filesystem setup failed: {0}")]
    FsSetup(String),

    /// Socket create/bind/listen/connect failure.
    #[error("control socket failure: {0}")]
    SocketCreation(#[source] std::io::Error),

    /// Sending or receiving a control command failed.
    #[error("control command failed: {0}")]
    Command(String),

    /// A register or memory command was issued while the VM was running.
    #[error("VM is not paused")]
    VmNotPaused,

    /// Catch-all.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmmError {
    /// Stable numeric code: process exit status and wire error field.
    ///
    /// 0 is reserved for success on the wire; 2 is produced by the CLI
    /// parser for unrecognized subcommands.
    pub fn code(&self) -> u32 {
        match self {
            VmmError::Args(_) => 1,
            VmmError::NoDevice(_) => 3,
            VmmError::WrongVersion { .. } => 4,
            VmmError::CreateVm(_) => 5,
            VmmError::UnsupportedCaps(_) => 6,
            VmmError::Allocation(_) => 7,
            VmmError::MemoryRegion(_) => 8,
            VmmError::VcpuCreation { .. } => 9,
            VmmError::Ioctl(_) => 10,
            VmmError::Run(_) => 11,
            VmmError::FsSetup(_) => 12,
            VmmError::SocketCreation(_) => 13,
            VmmError::Command(_) => 14,
            VmmError::VmNotPaused => 15,
            VmmError::Internal(_) => 16,
        }
    }
}

/// Exit code of the `UNRECOGNIZED_COMMAND` failure, produced by the CLI
/// layer before a [`VmmError`] exists.
pub const UNRECOGNIZED_COMMAND_CODE: u8 = 2;

/// Wire error code for success.
pub const WIRE_SUCCESS: u32 = 0;

/// Wire error code for [`VmmError::VmNotPaused`], the one failure a
/// controller is expected to explain to the user.
pub const WIRE_VM_NOT_PAUSED: u32 = 15;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_nonzero() {
        let errs = [
            VmmError::Args(String::new()),
            VmmError::NoDevice(std::io::Error::other("x")),
            VmmError::WrongVersion { expected: 12, got: 11 },
            VmmError::CreateVm(std::io::Error::other("x")),
            VmmError::UnsupportedCaps("KVM_CAP_USER_MEMORY"),
            VmmError::Allocation(String::new()),
            VmmError::MemoryRegion(std::io::Error::other("x")),
            VmmError::VcpuCreation { id: 0, source: std::io::Error::other("x") },
            VmmError::Ioctl(std::io::Error::other("x")),
            VmmError::Run(String::new()),
            VmmError::FsSetup(String::new()),
            VmmError::SocketCreation(std::io::Error::other("x")),
            VmmError::Command(String::new()),
            VmmError::VmNotPaused,
            VmmError::Internal(String::new()),
        ];

        let mut seen = std::collections::HashSet::new();
        for e in &errs {
            assert_ne!(e.code(), 0, "{e}");
            assert!(seen.insert(e.code()), "duplicate code for {e}");
        }
    }

    #[test]
    fn test_vm_not_paused_wire_code() {
        assert_eq!(VmmError::VmNotPaused.code(), WIRE_VM_NOT_PAUSED);
    }
}
