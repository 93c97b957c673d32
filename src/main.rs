//! mini_kvm - a minimal KVM virtual machine monitor with a runtime control
//! plane.
//!
//! `mini_kvm run` provisions an x86-64 VM from a raw guest binary and runs
//! one thread per vCPU; `pause`, `resume`, `shutdown` and `status` are
//! controllers that steer and inspect a running VM through its per-VM Unix
//! socket under `/tmp/mini_kvm/<name>/`.
//!
//! This VMM requires Linux with KVM support. It will not run on other
//! platforms.

#[cfg(target_os = "linux")]
mod commands;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod error;
#[cfg(target_os = "linux")]
mod ipc;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod logger;
#[cfg(target_os = "linux")]
mod parse;
#[cfg(target_os = "linux")]
mod rendezvous;

use std::process::ExitCode;

#[cfg(target_os = "linux")]
use clap::{Parser, Subcommand};

#[cfg(target_os = "linux")]
#[derive(Parser)]
#[command(name = "mini_kvm", version)]
#[command(about = "A minimal KVM virtual machine monitor with a runtime control plane")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[cfg(target_os = "linux")]
#[derive(Subcommand)]
enum Cmd {
    /// Create and run a virtual machine
    Run(commands::RunArgs),
    /// Pause a running virtual machine
    Pause(commands::NameArgs),
    /// Resume a paused virtual machine
    Resume(commands::NameArgs),
    /// Shut a virtual machine down
    Shutdown(commands::NameArgs),
    /// Inspect a virtual machine (state, registers, memory)
    Status(commands::StatusArgs),
}

#[cfg(target_os = "linux")]
fn main() -> ExitCode {
    use clap::error::ErrorKind;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => ExitCode::SUCCESS,
                // Only a subcommand nothing matches is "unrecognized";
                // every other parse failure is a malformed argument.
                ErrorKind::InvalidSubcommand => {
                    ExitCode::from(error::UNRECOGNIZED_COMMAND_CODE)
                }
                _ => ExitCode::from(error::VmmError::Args(e.to_string()).code() as u8),
            };
        }
    };

    let log_file = match &cli.command {
        Cmd::Run(args) => args.log.clone().flatten(),
        _ => None,
    };
    if let Err(e) = logger::init(log_file.as_deref()) {
        eprintln!("{e}");
        return ExitCode::from(e.code() as u8);
    }

    let result = match &cli.command {
        Cmd::Run(args) => commands::run(args),
        Cmd::Pause(args) => commands::pause(args),
        Cmd::Resume(args) => commands::resume(args),
        Cmd::Shutdown(args) => commands::shutdown(args),
        Cmd::Status(args) => commands::status(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.code() as u8)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() -> ExitCode {
    eprintln!("mini_kvm requires Linux with KVM support. This platform is not supported.");
    ExitCode::FAILURE
}
