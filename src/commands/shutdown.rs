//! The `shutdown` subcommand.

use tracing::info;

use super::{check_reply, connect_checked, NameArgs};
use crate::error::VmmError;
use crate::ipc::{self, Command, CommandTag};

pub fn shutdown(args: &NameArgs) -> Result<(), VmmError> {
    let Some(mut stream) = connect_checked(&args.name)? else {
        return Ok(());
    };

    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::Shutdown))?;
    check_reply(&reply)?;
    info!("VM {} shut down", args.name);

    Ok(())
}
