//! CLI subcommands.
//!
//! `run` is the serving side: it provisions a VM and stays in the
//! control-plane loop until shutdown. The other four are controllers: short
//! processes that locate a VM's rendezvous, verify the owner is alive,
//! connect to its socket and exchange fixed-size command records.

mod pause;
mod resume;
mod run;
mod shutdown;
mod status;

pub use pause::pause;
pub use resume::resume;
pub use run::{run, RunArgs};
pub use shutdown::shutdown;
pub use status::{status, StatusArgs};

use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::info;

use crate::error::{VmmError, WIRE_SUCCESS, WIRE_VM_NOT_PAUSED};
use crate::ipc::{self, Reply};
use crate::rendezvous;

/// Arguments shared by the thin controllers (`pause`, `resume`,
/// `shutdown`).
#[derive(clap::Args, Debug)]
pub struct NameArgs {
    /// Name of the virtual machine
    #[arg(short, long)]
    pub name: String,
}

/// Locates a VM by name and connects to its control socket.
///
/// Returns `None` (after an explanatory log line) when the VM is not
/// running: a missing rendezvous directory or a dead owner is a clean
/// no-op for every controller, not an error. Stale directories are left
/// in place; only the owner removes them.
fn connect_checked(name: &str) -> Result<Option<UnixStream>, VmmError> {
    let root = Path::new(rendezvous::ROOT);
    if !rendezvous::vm_is_alive(root, name) {
        info!("VM {name} is not running");
        return Ok(None);
    }

    let dir = rendezvous::vm_dir(root, name);
    let stream = ipc::connect(&rendezvous::socket_path(&dir, name))?;
    Ok(Some(stream))
}

/// Turns a reply's error field back into a `VmmError`.
fn check_reply(reply: &Reply) -> Result<(), VmmError> {
    match reply.error {
        WIRE_SUCCESS => Ok(()),
        WIRE_VM_NOT_PAUSED => Err(VmmError::VmNotPaused),
        code => Err(VmmError::Command(format!("VM reported error code {code}"))),
    }
}
