//! The `run` subcommand: provision and serve a virtual machine.

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::info;

use crate::error::VmmError;
use crate::kvm::vm::install_term_signal_handlers;
use crate::kvm::{Vm, KERNEL_LOAD_ADDR, MAX_VCPUS};
use crate::parse;
use crate::rendezvous::{Rendezvous, ROOT};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Name of the virtual machine; without one the control plane is
    /// disabled and the VM only runs until the guest halts
    #[arg(short, long)]
    pub name: Option<String>,

    /// Path to the raw guest binary, loaded and entered at 0x1000
    #[arg(short, long)]
    pub kernel: PathBuf,

    /// Guest memory size, with an optional decimal K/M/G suffix
    #[arg(short, long, default_value = "512M", value_parser = parse::parse_mem)]
    pub mem: u64,

    /// Number of vCPUs
    #[arg(short, long, default_value_t = 1)]
    pub vcpu: u32,

    /// Write logs to a file (`--log=PATH`) instead of stdout
    #[arg(short, long, num_args = 0..=1, require_equals = true)]
    pub log: Option<Option<PathBuf>>,
}

pub fn run(args: &RunArgs) -> Result<(), VmmError> {
    if args.vcpu == 0 || args.vcpu as usize > MAX_VCPUS {
        return Err(VmmError::Args(format!(
            "vcpu count must be between 1 and {MAX_VCPUS}, got {}",
            args.vcpu
        )));
    }

    let image = std::fs::read(&args.kernel).map_err(|e| {
        VmmError::Args(format!("cannot read kernel {}: {e}", args.kernel.display()))
    })?;
    info!("argument parsing successful, starting initialization");

    let mut vm = Vm::new(args.name.clone(), args.mem)?;
    vm.load_image(&image)?;

    for _ in 0..args.vcpu {
        let id = vm.add_vcpu()?;
        vm.setup_vcpu(id, KERNEL_LOAD_ADDR)?;
    }

    // The rendezvous directory is removed when this guard drops, whether
    // the VM shuts down cleanly or a later setup step fails.
    let _rendezvous = match &args.name {
        Some(name) => {
            let rendezvous =
                Rendezvous::create(Path::new(ROOT), name, std::process::id() as i32)?;
            info!("rendezvous directory ready at {}", rendezvous.dir().display());
            vm.bind_control_socket(&rendezvous)?;
            Some(rendezvous)
        }
        None => {
            info!("no name given, control plane disabled");
            None
        }
    };

    install_term_signal_handlers();
    vm.start()?;
    vm.serve();
    vm.join_vcpus();
    info!("VM stopped in state {}", vm.state());

    Ok(())
}
