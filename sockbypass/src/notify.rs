/*!
 * Seccomp user-notification transport.
 *
 * Wraps the listener fd handed over by the container runtime: receive a
 * pending notification, revalidate its id against TOCTOU races, send a
 * response, and install file descriptors into the notified process via the
 * addfd ioctl. The fd is driven nonblocking through tokio's AsyncFd so one
 * task per container can wait cooperatively.
 */

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use sockbypass_common::{BypassError, Result};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

/// Ask the kernel to execute the original syscall when responding.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// Replace the descriptor at `newfd` in the target process.
pub const SECCOMP_ADDFD_FLAG_SETFD: u32 = 1 << 1;

/// Mirrors kernel `struct seccomp_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Mirrors kernel `struct seccomp_notif`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// Mirrors kernel `struct seccomp_notif_resp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

/// Mirrors kernel `struct seccomp_notif_addfd`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifAddfd {
    pub id: u64,
    pub flags: u32,
    pub srcfd: u32,
    pub newfd: u32,
    pub newfd_flags: u32,
}

const SECCOMP_IOC_MAGIC: u8 = b'!';

nix::ioctl_readwrite!(seccomp_notif_recv, SECCOMP_IOC_MAGIC, 0, SeccompNotif);
nix::ioctl_readwrite!(seccomp_notif_send, SECCOMP_IOC_MAGIC, 1, SeccompNotifResp);
nix::ioctl_write_ptr!(seccomp_notif_id_valid, SECCOMP_IOC_MAGIC, 2, u64);
nix::ioctl_write_ptr!(seccomp_notif_addfd, SECCOMP_IOC_MAGIC, 3, SeccompNotifAddfd);

/// An owned seccomp notify fd.
pub struct NotifyFd {
    inner: AsyncFd<OwnedFd>,
}

impl NotifyFd {
    pub fn new(fd: OwnedFd) -> Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
            .map_err(|e| BypassError::Transport(format!("F_GETFL on seccomp fd: {}", e)))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))
            .map_err(|e| BypassError::Transport(format!("F_SETFL on seccomp fd: {}", e)))?;
        let inner = AsyncFd::with_interest(fd, Interest::READABLE)
            .map_err(|e| BypassError::Transport(format!("registering seccomp fd: {}", e)))?;
        Ok(NotifyFd { inner })
    }

    fn raw(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// Wait for and fetch the next pending notification.
    ///
    /// Returns `Ok(None)` once the notifying side has closed the fd, which
    /// is the only regular way for a session loop to terminate.
    pub async fn receive(&self) -> Result<Option<SeccompNotif>> {
        loop {
            let mut guard = self
                .inner
                .ready(Interest::READABLE)
                .await
                .map_err(|e| BypassError::Transport(format!("waiting on seccomp fd: {}", e)))?;

            let mut req = SeccompNotif::default();
            match unsafe { seccomp_notif_recv(self.raw(), &mut req) } {
                Ok(_) => return Ok(Some(req)),
                Err(Errno::EWOULDBLOCK) => {
                    if guard.ready().is_read_closed() {
                        return Ok(None);
                    }
                    guard.clear_ready();
                }
                Err(Errno::ENOENT) => {
                    // The notifying thread died before we fetched its
                    // notification.
                    debug!("pending notification vanished");
                    if guard.ready().is_read_closed() {
                        return Ok(None);
                    }
                    guard.clear_ready();
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(BypassError::Transport(format!(
                        "seccomp notif recv failed: {}",
                        e
                    )))
                }
            }
        }
    }

    /// TOCTOU check: is the notification id still alive?
    pub fn id_valid(&self, id: u64) -> bool {
        unsafe { seccomp_notif_id_valid(self.raw(), &id) }.is_ok()
    }

    pub fn respond(&self, resp: &mut SeccompNotifResp) -> Result<()> {
        unsafe { seccomp_notif_send(self.raw(), resp) }
            .map_err(|e| BypassError::Transport(format!("seccomp notif send failed: {}", e)))?;
        Ok(())
    }

    /// Install `srcfd` into the notified process, replacing the descriptor
    /// at `newfd` (SETFD semantics). Returns the descriptor number in the
    /// target.
    pub fn add_fd(&self, addfd: &SeccompNotifAddfd) -> Result<i32> {
        let fd = unsafe { seccomp_notif_addfd(self.raw(), addfd) }
            .map_err(BypassError::HostSyscall)?;
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_the_kernel_abi() {
        assert_eq!(std::mem::size_of::<SeccompData>(), 64);
        assert_eq!(std::mem::size_of::<SeccompNotif>(), 80);
        assert_eq!(std::mem::size_of::<SeccompNotifResp>(), 24);
        assert_eq!(std::mem::size_of::<SeccompNotifAddfd>(), 24);
    }

    #[test]
    fn default_notif_is_zeroed() {
        let notif = SeccompNotif::default();
        assert_eq!(notif.id, 0);
        assert_eq!(notif.pid, 0);
        assert_eq!(notif.data.nr, 0);
        assert_eq!(notif.data.args, [0u64; 6]);
    }
}
