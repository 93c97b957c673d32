//! The `pause` subcommand.

use tracing::info;

use super::{check_reply, connect_checked, NameArgs};
use crate::error::VmmError;
use crate::ipc::{self, Command, CommandTag};
use crate::kvm::VmState;

pub fn pause(args: &NameArgs) -> Result<(), VmmError> {
    let Some(mut stream) = connect_checked(&args.name)? else {
        return Ok(());
    };

    // Pausing a VM that is not running is a no-op, not an error.
    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::ShowState))?;
    check_reply(&reply)?;
    match reply.state() {
        VmState::Paused | VmState::Shutdown => {
            info!("VM {} is already {}", args.name, reply.state());
            return Ok(());
        }
        VmState::Running => {}
    }

    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::Pause))?;
    check_reply(&reply)?;
    info!("VM {} paused", args.name);

    Ok(())
}
