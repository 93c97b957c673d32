//! Control-plane wire protocol.
//!
//! A controller process talks to a running VM over the Unix stream socket in
//! the VM's rendezvous directory. Both directions use fixed-size records
//! ([`Command`] and [`Reply`]) moved as raw host-endian bytes; records are
//! framed purely by their size, there is no length prefix and no in-band
//! version field. That makes the protocol strictly same-host, same-arch,
//! which is all a rendezvous under `/tmp` can ever be.
//!
//! The byte moves go through `vm_memory::ByteValued`, the rust-vmm trait for
//! plain-old-data structs: a record is received by `read_exact` into its own
//! `as_mut_slice`, so alignment is correct by construction.
//!
//! One client may pipeline several commands on a single connection; the
//! server answers each with exactly one reply, in order. A clean close
//! (zero-byte read) ends the conversation; any short or failed read is an
//! error.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use kvm_bindings::{kvm_regs, kvm_sregs};
use vm_memory::ByteValued;

use crate::error::{VmmError, WIRE_SUCCESS};
use crate::kvm::{VmState, MAX_VCPUS};

/// Command tags, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandTag {
    None = 0,
    Pause = 1,
    Resume = 2,
    Shutdown = 3,
    ShowState = 4,
    ShowRegs = 5,
    DumpMem = 6,
}

impl CommandTag {
    pub fn from_u32(v: u32) -> Option<CommandTag> {
        match v {
            0 => Some(CommandTag::None),
            1 => Some(CommandTag::Pause),
            2 => Some(CommandTag::Resume),
            3 => Some(CommandTag::Shutdown),
            4 => Some(CommandTag::ShowState),
            5 => Some(CommandTag::ShowRegs),
            6 => Some(CommandTag::DumpMem),
            _ => None,
        }
    }
}

/// A single control request.
///
/// `mem_range` is `[start, end, word_size, bytes_per_line]` for DUMP_MEM
/// (`end = -1` meaning the whole guest memory); `pid` is the caller's
/// process id, which the server uses to reach the caller's stdout through
/// `/proc/<pid>/fd/1`. Field order keeps the struct padding-free.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Command {
    pub vcpu_mask: u64,
    pub mem_range: [i64; 4],
    pub tag: u32,
    pub pid: i32,
}

// SAFETY: repr(C), Copy, only integer fields, no padding (8 + 32 + 4 + 4),
// and any bit pattern is a valid value.
unsafe impl ByteValued for Command {}

impl Command {
    pub fn new(tag: CommandTag) -> Command {
        Command {
            tag: tag as u32,
            ..Command::default()
        }
    }

    pub fn tag(&self) -> Option<CommandTag> {
        CommandTag::from_u32(self.tag)
    }
}

/// A single control reply.
///
/// Register snapshots are indexed by vCPU id; only the entries whose bit is
/// set in the echoed mask (and that name an existing vCPU) are filled in,
/// the rest stay zero. `error` is 0 for success or a `VmmError` code.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Reply {
    pub vcpu_mask: u64,
    pub regs: [kvm_regs; MAX_VCPUS],
    pub sregs: [kvm_sregs; MAX_VCPUS],
    pub tag: u32,
    pub error: u32,
    pub state: u32,
    reserved: u32,
}

// SAFETY: repr(C), Copy, built from the padding-free kvm register structs
// and integer fields; the trailing reserved word keeps the size a multiple
// of the 8-byte alignment. Any bit pattern is a valid value.
unsafe impl ByteValued for Reply {}

impl Default for Reply {
    fn default() -> Self {
        Reply {
            vcpu_mask: 0,
            regs: [kvm_regs::default(); MAX_VCPUS],
            sregs: [kvm_sregs::default(); MAX_VCPUS],
            tag: CommandTag::None as u32,
            error: WIRE_SUCCESS,
            state: VmState::Paused as u32,
            reserved: 0,
        }
    }
}

impl Reply {
    /// A zeroed reply echoing the command's tag and mask.
    ///
    /// Boxed because the register arrays make the record large.
    pub fn for_command(cmd: &Command) -> Box<Reply> {
        let mut reply = Box::<Reply>::default();
        reply.tag = cmd.tag;
        reply.vcpu_mask = cmd.vcpu_mask;
        reply
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state as u8)
    }
}

// ── Server side ─────────────────────────────────────────────────────

/// Binds the control socket and makes it non-blocking, so the accept loop
/// can interleave with state checks.
pub fn bind_listener(path: &Path) -> Result<UnixListener, VmmError> {
    let listener = UnixListener::bind(path).map_err(VmmError::SocketCreation)?;
    listener
        .set_nonblocking(true)
        .map_err(VmmError::SocketCreation)?;
    Ok(listener)
}

/// Reads one command record from an accepted connection.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. A record cut short, or a signal interrupting the read, is an
/// error; the server drops the connection and re-checks its state.
pub fn read_command(stream: &mut UnixStream) -> Result<Option<Command>, VmmError> {
    let mut cmd = Command::default();
    let buf = cmd.as_mut_slice();

    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(VmmError::Command(format!(
                    "short command record: {filled} bytes"
                )))
            }
            Ok(n) => filled += n,
            Err(e) => return Err(VmmError::Command(format!("recv failed: {e}"))),
        }
    }

    Ok(Some(cmd))
}

/// Writes one reply record to an accepted connection.
pub fn write_reply(stream: &mut UnixStream, reply: &Reply) -> Result<(), VmmError> {
    stream
        .write_all(reply.as_slice())
        .map_err(|e| VmmError::Command(format!("send failed: {e}")))
}

// ── Client side ─────────────────────────────────────────────────────

/// Connects to a VM's control socket.
pub fn connect(socket_path: &Path) -> Result<UnixStream, VmmError> {
    UnixStream::connect(socket_path).map_err(VmmError::SocketCreation)
}

/// Sends one command and waits for its reply.
pub fn send_command(stream: &mut UnixStream, cmd: &Command) -> Result<Box<Reply>, VmmError> {
    stream
        .write_all(cmd.as_slice())
        .map_err(|e| VmmError::Command(format!("send failed: {e}")))?;

    let mut reply = Box::<Reply>::default();
    stream
        .read_exact(reply.as_mut_slice())
        .map_err(|e| VmmError::Command(format!("recv failed: {e}")))?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        // Padding-free layouts: the wire size is exactly the field sum.
        assert_eq!(std::mem::size_of::<Command>(), 48);
        assert_eq!(
            std::mem::size_of::<Reply>(),
            8 + MAX_VCPUS * std::mem::size_of::<kvm_regs>()
                + MAX_VCPUS * std::mem::size_of::<kvm_sregs>()
                + 16
        );
        assert_eq!(std::mem::size_of::<Reply>() % 8, 0);
    }

    #[test]
    fn test_tag_round_trip() {
        for tag in [
            CommandTag::None,
            CommandTag::Pause,
            CommandTag::Resume,
            CommandTag::Shutdown,
            CommandTag::ShowState,
            CommandTag::ShowRegs,
            CommandTag::DumpMem,
        ] {
            assert_eq!(CommandTag::from_u32(tag as u32), Some(tag));
        }
        assert_eq!(CommandTag::from_u32(7), None);
    }

    #[test]
    fn test_command_round_trip_over_socket() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();

        let mut cmd = Command::new(CommandTag::DumpMem);
        cmd.vcpu_mask = 0b1101;
        cmd.mem_range = [0, -1, 2, 16];
        cmd.pid = 1234;
        tx.write_all(cmd.as_slice()).unwrap();

        let got = read_command(&mut rx).unwrap().unwrap();
        assert_eq!(got.tag(), Some(CommandTag::DumpMem));
        assert_eq!(got.vcpu_mask, 0b1101);
        assert_eq!(got.mem_range, [0, -1, 2, 16]);
        assert_eq!(got.pid, 1234);
    }

    #[test]
    fn test_reply_round_trip_over_socket() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();

        let writer = std::thread::spawn(move || {
            let cmd = Command::new(CommandTag::ShowRegs);
            let mut reply = Reply::for_command(&cmd);
            reply.error = WIRE_SUCCESS;
            reply.state = VmState::Running as u32;
            reply.regs[0].rip = 0x1000;
            reply.regs[0].rsp = 0xffff;
            write_reply(&mut tx, &reply).unwrap();
        });

        let mut reply = Box::<Reply>::default();
        rx.read_exact(reply.as_mut_slice()).unwrap();
        writer.join().unwrap();

        assert_eq!(reply.tag, CommandTag::ShowRegs as u32);
        assert_eq!(reply.state(), VmState::Running);
        assert_eq!(reply.regs[0].rip, 0x1000);
        assert_eq!(reply.regs[0].rsp, 0xffff);
        assert_eq!(reply.regs[1].rip, 0);
    }

    #[test]
    fn test_clean_close_reads_none() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        drop(tx);
        assert!(read_command(&mut rx).unwrap().is_none());
    }

    #[test]
    fn test_short_record_is_error() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();
        tx.write_all(&[0u8; 10]).unwrap();
        drop(tx);
        assert!(read_command(&mut rx).is_err());
    }
}
