//! The `status` subcommand: inspect a running VM.
//!
//! Always reports the VM state. `--regs` additionally requests register
//! snapshots for the selected vCPUs, and `--mem` asks the VM to write a
//! hex dump of guest memory onto this process's stdout (the server reaches
//! it through `/proc/<our pid>/fd/1`). Both require the VM to be paused.

use std::io::Write;

use clap::Args;

use super::{check_reply, connect_checked};
use crate::error::VmmError;
use crate::ipc::{self, Command, CommandTag, Reply};
use crate::kvm::MAX_VCPUS;
use crate::parse;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Name of the virtual machine
    #[arg(short, long)]
    pub name: String,

    /// Comma-separated vCPU list for --regs (e.g. 0,2,3); defaults to vCPU 0
    #[arg(short, long)]
    pub vcpu: Option<String>,

    /// Show vCPU registers (the VM must be paused)
    #[arg(short, long)]
    pub regs: bool,

    /// Dump guest memory: start[,end[,word_size[,bytes_per_line]]],
    /// omitted fields defaulting to 0,-1,2,16 (the VM must be paused)
    #[arg(short, long)]
    pub mem: Option<String>,
}

pub fn status(args: &StatusArgs) -> Result<(), VmmError> {
    // Parse everything before touching the socket so argument errors do
    // not depend on whether the VM is up.
    let mask = match &args.vcpu {
        Some(list) => parse::parse_cpu_list(list)?,
        None => 0b1,
    };
    let mem_range = args.mem.as_deref().map(parse::parse_mem_range).transpose()?;

    let Some(mut stream) = connect_checked(&args.name)? else {
        return Ok(());
    };

    let reply = ipc::send_command(&mut stream, &Command::new(CommandTag::ShowState))?;
    check_reply(&reply)?;
    println!("VM {} is {}", args.name, reply.state());

    if args.regs {
        let mut cmd = Command::new(CommandTag::ShowRegs);
        cmd.vcpu_mask = mask;
        let reply = ipc::send_command(&mut stream, &cmd)?;
        check_reply(&reply)?;
        print_regs(&reply, mask);
    }

    if let Some(range) = mem_range {
        let mut cmd = Command::new(CommandTag::DumpMem);
        cmd.mem_range = range;
        cmd.pid = std::process::id() as i32;
        let reply = ipc::send_command(&mut stream, &cmd)?;
        // The dump itself arrived on our stdout through /proc before the
        // reply did; only failures need reporting.
        check_reply(&reply)?;
    }

    Ok(())
}

/// Prints one register block per selected vCPU on stdout.
fn print_regs(reply: &Reply, mask: u64) {
    let stdout = std::io::stdout();
    let _ = write_regs(&mut stdout.lock(), reply, mask);
}

/// Writes the register blocks in the VMM's traditional four-column layout,
/// one block per vCPU selected by `mask`, each followed by a control
/// register line.
fn write_regs<W: Write>(out: &mut W, reply: &Reply, mask: u64) -> std::io::Result<()> {
    for id in 0..MAX_VCPUS {
        if mask & (1 << id) == 0 {
            continue;
        }
        let regs = &reply.regs[id];
        let sregs = &reply.sregs[id];

        writeln!(out, "vcpu {id}:")?;
        writeln!(
            out,
            "rax {:#018x}\trbx {:#018x}\trcx {:#018x}\trdx {:#018x}",
            regs.rax, regs.rbx, regs.rcx, regs.rdx
        )?;
        writeln!(
            out,
            "r8  {:#018x}\tr9  {:#018x}\tr10 {:#018x}\tr11 {:#018x}",
            regs.r8, regs.r9, regs.r10, regs.r11
        )?;
        writeln!(
            out,
            "r12 {:#018x}\tr13 {:#018x}\tr14 {:#018x}\tr15 {:#018x}",
            regs.r12, regs.r13, regs.r14, regs.r15
        )?;
        writeln!(
            out,
            "rsp {:#018x}\trbp {:#018x}\trip {:#018x}\trflags {:#018x}",
            regs.rsp, regs.rbp, regs.rip, regs.rflags
        )?;
        writeln!(out, "rdi {:#018x}\trsi {:#018x}", regs.rdi, regs.rsi)?;
        writeln!(
            out,
            "cr0 {:#018x}\tcr2 {:#018x}\tcr3 {:#018x}\tcr4 {:#018x}",
            sregs.cr0, sregs.cr2, sregs.cr3, sregs.cr4
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_string(reply: &Reply, mask: u64) -> String {
        let mut out = Vec::new();
        write_regs(&mut out, reply, mask).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_register_block_layout() {
        let mut reply = Reply::for_command(&Command::new(CommandTag::ShowRegs));
        let regs = &mut reply.regs[0];
        regs.rax = 0x1;
        regs.rbx = 0x2;
        regs.rcx = 0x3;
        regs.rdx = 0x4;
        regs.rdi = 0x5;
        regs.rsi = 0x6;
        regs.r8 = 0x8;
        regs.r9 = 0x9;
        regs.r10 = 0xa;
        regs.r11 = 0xb;
        regs.r12 = 0xc;
        regs.r13 = 0xd;
        regs.r14 = 0xe;
        regs.r15 = 0xf;
        regs.rsp = 0x1000;
        regs.rbp = 0x2000;
        regs.rip = 0x3000;
        regs.rflags = 0x2;
        let sregs = &mut reply.sregs[0];
        sregs.cr0 = 0x11;
        sregs.cr2 = 0x22;
        sregs.cr3 = 0x33;
        sregs.cr4 = 0x44;

        let text = regs_string(&reply, 0b1);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "vcpu 0:");
        assert_eq!(
            lines[1],
            "rax 0x0000000000000001\trbx 0x0000000000000002\t\
             rcx 0x0000000000000003\trdx 0x0000000000000004"
        );
        assert_eq!(
            lines[2],
            "r8  0x0000000000000008\tr9  0x0000000000000009\t\
             r10 0x000000000000000a\tr11 0x000000000000000b"
        );
        assert_eq!(
            lines[3],
            "r12 0x000000000000000c\tr13 0x000000000000000d\t\
             r14 0x000000000000000e\tr15 0x000000000000000f"
        );
        assert_eq!(
            lines[4],
            "rsp 0x0000000000001000\trbp 0x0000000000002000\t\
             rip 0x0000000000003000\trflags 0x0000000000000002"
        );
        assert_eq!(lines[5], "rdi 0x0000000000000005\trsi 0x0000000000000006");
        assert_eq!(
            lines[6],
            "cr0 0x0000000000000011\tcr2 0x0000000000000022\t\
             cr3 0x0000000000000033\tcr4 0x0000000000000044"
        );
    }

    #[test]
    fn test_register_block_honors_mask() {
        let reply = Reply::for_command(&Command::new(CommandTag::ShowRegs));

        let text = regs_string(&reply, 0b10);
        assert!(text.starts_with("vcpu 1:"));
        assert!(!text.contains("vcpu 0:"));

        // An empty selection prints nothing at all.
        assert_eq!(regs_string(&reply, 0), "");
    }
}
