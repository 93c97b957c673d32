//! Per-VM filesystem rendezvous.
//!
//! Every named VM owns `/tmp/mini_kvm/<name>/`, holding:
//!
//! - `<name>.pid`  - the owner's process id, 4 raw bytes in host order
//! - `<name>.sock` - the control-plane Unix stream socket
//!
//! The directory doubles as a same-host lock: a second `run` with the same
//! name finds the directory, reads the pidfile and probes the owner with
//! signal 0. A live owner is a fatal startup conflict; a dead owner is
//! silently reclaimed (including any socket file it left behind, which
//! would otherwise break the new bind).
//!
//! Controllers use the same probe to decide whether a VM is running at all.
//! They never clean up a stale directory themselves; only the owner removes
//! its directory, on drop.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, Pid};
use tracing::{info, warn};

use crate::error::VmmError;

/// Root of all VM rendezvous directories.
pub const ROOT: &str = "/tmp/mini_kvm";

/// Directory of a named VM under `root`.
pub fn vm_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

fn pid_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pid"))
}

/// Control socket path inside a VM directory.
pub fn socket_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.sock"))
}

/// Signal-0 liveness probe.
pub fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Reads the 4-byte host-order pid record of a VM directory.
pub fn read_pid(dir: &Path, name: &str) -> Result<i32, VmmError> {
    let path = pid_path(dir, name);
    let mut file = File::open(&path)
        .map_err(|e| VmmError::FsSetup(format!("cannot open {}: {e}", path.display())))?;

    let mut raw = [0u8; 4];
    file.read_exact(&mut raw)
        .map_err(|e| VmmError::FsSetup(format!("cannot read {}: {e}", path.display())))?;
    Ok(i32::from_ne_bytes(raw))
}

/// Client-side check: does `name` resolve to a directory whose recorded
/// owner is still alive?
pub fn vm_is_alive(root: &Path, name: &str) -> bool {
    let dir = vm_dir(root, name);
    if !dir.is_dir() {
        return false;
    }
    match read_pid(&dir, name) {
        Ok(pid) => pid_is_alive(pid),
        Err(_) => false,
    }
}

/// Owned rendezvous directory of a running VM.
///
/// Dropping it removes the whole directory, pidfile and socket included.
pub struct Rendezvous {
    name: String,
    dir: PathBuf,
}

impl Rendezvous {
    /// Creates (or reclaims) the rendezvous directory and writes the
    /// pidfile.
    ///
    /// Fails with a filesystem-setup error when the name is owned by a
    /// process that is still alive.
    pub fn create(root: &Path, name: &str, pid: i32) -> Result<Rendezvous, VmmError> {
        match mkdir(root, Mode::S_IRWXU) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => {
                return Err(VmmError::FsSetup(format!(
                    "cannot create {}: {e}",
                    root.display()
                )))
            }
        }

        let dir = vm_dir(root, name);
        match mkdir(&dir, Mode::S_IRWXU) {
            Ok(()) => {}
            Err(Errno::EEXIST) => {
                // A previous owner left the directory behind; probe it.
                if let Ok(old) = read_pid(&dir, name) {
                    if pid_is_alive(old) {
                        return Err(VmmError::FsSetup(format!(
                            "VM {name} is already running (pid {old})"
                        )));
                    }
                }
                info!("reclaiming stale rendezvous directory for VM {name}");

                let sock = socket_path(&dir, name);
                if sock.exists() {
                    fs::remove_file(&sock).map_err(|e| {
                        VmmError::FsSetup(format!("cannot remove stale {}: {e}", sock.display()))
                    })?;
                }
            }
            Err(e) => {
                return Err(VmmError::FsSetup(format!(
                    "cannot create {}: {e}",
                    dir.display()
                )))
            }
        }

        let path = pid_path(&dir, name);
        File::create(&path)
            .and_then(|mut f| f.write_all(&pid.to_ne_bytes()))
            .map_err(|e| VmmError::FsSetup(format!("cannot write {}: {e}", path.display())))?;

        Ok(Rendezvous {
            name: name.to_string(),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the control socket binds to.
    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.dir, &self.name)
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("failed to remove {}: {e}", self.dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pid far above any default pid_max, guaranteed dead.
    const DEAD_PID: i32 = i32::MAX;

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn test_create_writes_pidfile() {
        let root = tempfile::tempdir().unwrap();
        let rdv = Rendezvous::create(root.path(), "t1", own_pid()).unwrap();

        assert!(rdv.dir().is_dir());
        assert_eq!(read_pid(rdv.dir(), "t1").unwrap(), own_pid());
    }

    #[test]
    fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir;
        {
            let rdv = Rendezvous::create(root.path(), "t1", own_pid()).unwrap();
            dir = rdv.dir().to_path_buf();
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_stale_owner_is_reclaimed() {
        let root = tempfile::tempdir().unwrap();
        let dir = vm_dir(root.path(), "t2");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("t2.pid"), DEAD_PID.to_ne_bytes()).unwrap();
        // A leftover socket file must not survive the reclaim.
        fs::write(socket_path(&dir, "t2"), b"").unwrap();

        let rdv = Rendezvous::create(root.path(), "t2", own_pid()).unwrap();
        assert_eq!(read_pid(rdv.dir(), "t2").unwrap(), own_pid());
        assert!(!rdv.socket_path().exists());
    }

    #[test]
    fn test_live_owner_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let _first = Rendezvous::create(root.path(), "t1", own_pid()).unwrap();

        let second = Rendezvous::create(root.path(), "t1", own_pid());
        assert!(matches!(second, Err(VmmError::FsSetup(_))));
        // The first owner's directory is untouched.
        assert!(vm_dir(root.path(), "t1").is_dir());
    }

    #[test]
    fn test_vm_is_alive() {
        let root = tempfile::tempdir().unwrap();
        assert!(!vm_is_alive(root.path(), "nope"));

        let rdv = Rendezvous::create(root.path(), "t3", own_pid()).unwrap();
        assert!(vm_is_alive(root.path(), "t3"));
        drop(rdv);
        assert!(!vm_is_alive(root.path(), "t3"));
    }

    #[test]
    fn test_dead_pid_reads_as_not_alive() {
        let root = tempfile::tempdir().unwrap();
        let dir = vm_dir(root.path(), "t4");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("t4.pid"), DEAD_PID.to_ne_bytes()).unwrap();
        assert!(!vm_is_alive(root.path(), "t4"));
    }
}
