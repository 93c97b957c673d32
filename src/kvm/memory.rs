//! Guest physical memory.
//!
//! A single contiguous region registered as guest-physical `[0, mem_size)`
//! in slot 0, backed by `vm_memory::GuestMemoryMmap` (anonymous private
//! mmap), the standard abstraction of the rust-vmm ecosystem.
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │   ...        │       │              │
//! │ mem_size-1   │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! The guest binary is loaded at [`crate::kvm::KERNEL_LOAD_ADDR`]; the rest
//! of the region is zero. The host-virtual base is pinned for the lifetime
//! of the VM, which is what makes handing it to
//! `KVM_SET_USER_MEMORY_REGION` sound.

use std::io::Write;

use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

use crate::error::VmmError;

/// Guest physical memory region backed by vm-memory.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocates a guest memory region of `size` bytes at guest-physical 0.
    ///
    /// A zero size is rejected before touching mmap.
    pub fn new(size: u64) -> Result<Self, VmmError> {
        if size == 0 {
            return Err(VmmError::Allocation(
                "cannot create a VM with memory of size 0".to_string(),
            ));
        }

        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| VmmError::Allocation(format!("guest memory mmap failed: {e}")))?;

        Ok(Self { inner, size })
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Raw parts for KVM memory region registration:
    /// (host virtual address, size).
    ///
    /// The pointer is valid only while this `GuestMemory` exists.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    /// Writes bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), VmmError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| VmmError::Internal(format!("guest memory write at {addr:#x}: {e}")))
    }

    /// Reads bytes from a guest physical address into `data`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), VmmError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| VmmError::Internal(format!("guest memory read at {addr:#x}: {e}")))
    }

    /// Copies a guest binary into memory at `addr`.
    ///
    /// The image must fit below `mem_size`; there is no format parsing, the
    /// bytes are executed as-is.
    pub fn load_image(&self, image: &[u8], addr: u64) -> Result<(), VmmError> {
        if image.is_empty() {
            return Err(VmmError::Internal("kernel image is empty".to_string()));
        }
        self.write(addr, image)
    }

    /// Writes a formatted hex dump of `[start, end)` to `out`.
    ///
    /// Bytes are grouped into words of `word_size` bytes (rendered in memory
    /// order), `bytes_per_line` bytes per line, each line prefixed with an
    /// 8-hex-digit address. The header line carries the decimal bounds.
    pub fn dump<W: Write>(
        &self,
        out: &mut W,
        start: u64,
        end: u64,
        word_size: u64,
        bytes_per_line: u64,
    ) -> Result<(), VmmError> {
        if word_size == 0 || bytes_per_line == 0 || bytes_per_line % word_size != 0 {
            return Err(VmmError::Internal(format!(
                "bad dump geometry: word_size {word_size}, bytes_per_line {bytes_per_line}"
            )));
        }
        if start > end || end > self.size {
            return Err(VmmError::Internal(format!(
                "dump range [{start}, {end}) outside guest memory of size {}",
                self.size
            )));
        }

        let io_err = |e: std::io::Error| VmmError::Internal(format!("dump write failed: {e}"));

        writeln!(out, "mem dump: @{start} -> @{end}").map_err(io_err)?;

        let mut word = vec![0u8; word_size as usize];
        let mut addr = start;
        while addr < end {
            write!(out, "{addr:08x}").map_err(io_err)?;

            let line_end = (addr + bytes_per_line).min(end);
            let mut word_addr = addr;
            while word_addr < line_end {
                let n = ((line_end - word_addr) as usize).min(word.len());
                self.read(word_addr, &mut word[..n])?;

                write!(out, " ").map_err(io_err)?;
                for byte in &word[..n] {
                    write!(out, "{byte:02x}").map_err(io_err)?;
                }
                word_addr += n as u64;
            }

            writeln!(out).map_err(io_err)?;
            addr = line_end;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_string(mem: &GuestMemory, range: (u64, u64, u64, u64)) -> String {
        let mut out = Vec::new();
        mem.dump(&mut out, range.0, range.1, range.2, range.3).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_rejects_zero_size() {
        assert!(GuestMemory::new(0).is_err());
    }

    #[test]
    fn test_write_read_round_trip() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0x100, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        mem.read(0x100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());

        let mut buf = [0u8; 2];
        assert!(mem.read(99, &mut buf).is_err());
    }

    #[test]
    fn test_load_image() {
        let mem = GuestMemory::new(0x2000).unwrap();
        mem.load_image(&[0xf4], 0x1000).unwrap();

        let mut buf = [0u8; 1];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf[0], 0xf4);

        assert!(mem.load_image(&[], 0).is_err());
        assert!(mem.load_image(&[0u8; 0x100], 0x1f80).is_err());
    }

    #[test]
    fn test_dump_header() {
        let mem = GuestMemory::new(4096).unwrap();
        let text = dump_string(&mem, (0, 32, 2, 16));
        assert!(text.starts_with("mem dump: @0 -> @32\n"));
    }

    #[test]
    fn test_dump_byte_lines() {
        // Fill bytes with i mod 256, dump the first 32 as single-byte
        // words, 16 per line.
        let mem = GuestMemory::new(4096).unwrap();
        let pattern: Vec<u8> = (0u16..256).map(|i| i as u8).collect();
        mem.write(0, &pattern).unwrap();

        let text = dump_string(&mem, (0, 32, 1, 16));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[1],
            "00000000 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f"
        );
        assert_eq!(
            lines[2],
            "00000010 10 11 12 13 14 15 16 17 18 19 1a 1b 1c 1d 1e 1f"
        );
    }

    #[test]
    fn test_dump_word_grouping() {
        let mem = GuestMemory::new(4096).unwrap();
        let text = dump_string(&mem, (0, 16, 2, 16));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        // 16 bytes / 2-byte words = 8 words after the address prefix.
        let fields: Vec<&str> = lines[1].split_whitespace().collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "00000000");
        assert!(fields[1..].iter().all(|w| *w == "0000"));
    }

    #[test]
    fn test_dump_rejects_bad_geometry() {
        let mem = GuestMemory::new(4096).unwrap();
        let mut out = Vec::new();
        assert!(mem.dump(&mut out, 0, 16, 0, 16).is_err());
        assert!(mem.dump(&mut out, 0, 16, 3, 16).is_err());
        assert!(mem.dump(&mut out, 16, 0, 2, 16).is_err());
        assert!(mem.dump(&mut out, 0, 8192, 2, 16).is_err());
    }
}
