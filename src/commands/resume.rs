//! The `resume` subcommand.

use tracing::info;

use super::{check_reply, connect_checked, NameArgs};
use crate::error::VmmError;
use crate::ipc::{self, Command, CommandTag};
use crate::kvm::VmState;

pub fn resume(args: &NameArgs) -> Result<(), VmmError> {
    let Some(mut stream) = connect_checked(&args.name)? else {
        return Ok(());
    };

    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::ShowState))?;
    check_reply(&reply)?;
    if reply.state() == VmState::Running {
        info!("VM {} is already running", args.name);
        return Ok(());
    }

    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::Resume))?;
    check_reply(&reply)?;
    info!("VM {} resumed", args.name);

    Ok(())
}
