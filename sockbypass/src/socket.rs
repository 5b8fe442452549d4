/*!
 * Per-socket interception state.
 *
 * Every (pid, sockfd) pair observed through the notify fd gets one record
 * holding the socket's creation arguments, the options replayed so far, the
 * last address seen on bind/connect and the bypass state. The map lives on
 * the owning session task; no locking is involved.
 */

use nix::errno::Errno;
use sockbypass_common::{BypassError, Result, SockAddr};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info_span, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// The fd is not a bypass candidate (not TCP over IP, policy said no,
    /// or a setup step failed before anything was installed).
    NotBypassable,
    /// Bypass candidate, nothing installed yet.
    NotBypassed,
    /// The container's descriptor now refers to a socket created on the host.
    Bypassed,
    /// A failure after a partial rewrite; nothing can be done to recover.
    Error,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::NotBypassable => "NotBypassable",
            SocketState::NotBypassed => "NotBypassed",
            SocketState::Bypassed => "Bypassed",
            SocketState::Error => "Error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOption {
    pub level: u64,
    pub optname: u64,
    pub optval: Vec<u8>,
    pub optlen: u64,
}

/// Only F_SETFD and F_SETFL are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcntlOption {
    pub cmd: u64,
    pub value: u64,
}

/// Domain/type/protocol captured at the socket(2) notification. The
/// notification arrives at syscall entry, so the resulting descriptor number
/// is unknown until the first syscall that names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedSocket {
    pub domain: u64,
    pub sock_type: u64,
    pub protocol: u64,
}

impl StagedSocket {
    fn bypass_capable(&self) -> bool {
        let domain = self.domain as i32;
        let base_type =
            self.sock_type as i32 & !(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK);
        (domain == libc::AF_INET || domain == libc::AF_INET6) && base_type == libc::SOCK_STREAM
    }
}

pub struct SocketRecord {
    pub state: SocketState,
    pub pid: u32,
    pub sockfd: i32,
    pub sock_domain: u64,
    pub sock_type: u64,
    pub sock_protocol: u64,
    /// Address captured on bind or connect, synthesized back on getpeername.
    pub addr: Option<SockAddr>,
    sockopts: Vec<SocketOption>,
    fcntls: Vec<FcntlOption>,
    pub ignore_bind: bool,
    pub span: Span,
}

impl SocketRecord {
    fn new(pid: u32, sockfd: i32, staged: Option<StagedSocket>, ignore_bind: bool) -> Self {
        let span = info_span!("socket", pid, sockfd);
        let (state, staged) = match staged {
            Some(s) if s.bypass_capable() => (SocketState::NotBypassed, s),
            Some(s) => (SocketState::NotBypassable, s),
            // First seen without a socket(2) notification, e.g. inherited
            // across the attach. Nothing is known about it; leave it alone.
            None => (
                SocketState::NotBypassable,
                StagedSocket {
                    domain: 0,
                    sock_type: 0,
                    protocol: 0,
                },
            ),
        };
        SocketRecord {
            state,
            pid,
            sockfd,
            sock_domain: staged.domain,
            sock_type: staged.sock_type,
            sock_protocol: staged.protocol,
            addr: None,
            sockopts: Vec::new(),
            fcntls: Vec::new(),
            ignore_bind,
            span,
        }
    }

    pub fn record_sockopt(&mut self, level: u64, optname: u64, optval: Vec<u8>, optlen: u64) {
        self.span.in_scope(|| {
            debug!(level, optname, optlen, "recorded setsockopt");
        });
        self.sockopts.push(SocketOption {
            level,
            optname,
            optval,
            optlen,
        });
    }

    pub fn record_fcntl(&mut self, cmd: u64, value: u64) {
        match cmd as i32 {
            libc::F_SETFD | libc::F_SETFL => {
                self.span.in_scope(|| debug!(cmd, value, "recorded fcntl"));
                self.fcntls.push(FcntlOption { cmd, value });
            }
            libc::F_GETFL => {
                // read-only, nothing to replay
            }
            other => {
                self.span
                    .in_scope(|| warn!(cmd = other, "unknown fcntl command ignored"));
            }
        }
    }

    pub fn sockopts(&self) -> &[SocketOption] {
        &self.sockopts
    }

    pub fn fcntls(&self) -> &[FcntlOption] {
        &self.fcntls
    }

    /// Replay every recorded option onto a freshly created host socket, in
    /// insertion order. The first failure aborts the sequence; the caller
    /// closes the host socket and marks this record NotBypassable.
    pub fn configure(&self, host_fd: i32) -> Result<()> {
        for opt in &self.sockopts {
            let optval = if opt.optval.is_empty() {
                std::ptr::null()
            } else {
                opt.optval.as_ptr() as *const libc::c_void
            };
            let rc = unsafe {
                libc::setsockopt(
                    host_fd,
                    opt.level as i32,
                    opt.optname as i32,
                    optval,
                    opt.optlen as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(BypassError::HostSyscall(Errno::last()));
            }
            self.span.in_scope(|| {
                debug!(level = opt.level, optname = opt.optname, "configured socket option");
            });
        }

        for fcntl in &self.fcntls {
            let rc = unsafe { libc::fcntl(host_fd, fcntl.cmd as i32, fcntl.value) };
            if rc < 0 {
                return Err(BypassError::HostSyscall(Errno::last()));
            }
            self.span
                .in_scope(|| debug!(cmd = fcntl.cmd, value = fcntl.value, "configured fcntl"));
        }

        Ok(())
    }
}

/// All per-socket state owned by one session task.
#[derive(Default)]
pub struct SocketTable {
    records: HashMap<(u32, i32), SocketRecord>,
    staged: HashMap<u32, StagedSocket>,
}

impl SocketTable {
    /// Stage the creation arguments seen on a socket(2) notification until
    /// the resulting descriptor shows up. A later socket(2) from the same
    /// thread replaces a stale staging.
    pub fn stage(&mut self, pid: u32, staged: StagedSocket) {
        self.staged.insert(pid, staged);
    }

    /// Fetch the record for (pid, sockfd), materializing it from the staged
    /// creation arguments on first sight.
    pub fn claim(&mut self, pid: u32, sockfd: i32, ignore_bind: bool) -> &mut SocketRecord {
        self.records.entry((pid, sockfd)).or_insert_with(|| {
            let staged = self.staged.remove(&pid);
            SocketRecord::new(pid, sockfd, staged, ignore_bind)
        })
    }

    pub fn get_mut(&mut self, pid: u32, sockfd: i32) -> Option<&mut SocketRecord> {
        self.records.get_mut(&(pid, sockfd))
    }

    pub fn remove(&mut self, pid: u32, sockfd: i32) -> Option<SocketRecord> {
        self.records.remove(&(pid, sockfd))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{FromRawFd, OwnedFd};

    fn tcp_staging() -> StagedSocket {
        StagedSocket {
            domain: libc::AF_INET as u64,
            sock_type: libc::SOCK_STREAM as u64,
            protocol: 0,
        }
    }

    #[test]
    fn staged_arguments_bind_to_the_first_descriptor_seen() {
        let mut table = SocketTable::default();
        table.stage(100, tcp_staging());

        let rec = table.claim(100, 7, false);
        assert_eq!(rec.state, SocketState::NotBypassed);
        assert_eq!(rec.sock_domain, libc::AF_INET as u64);

        // The staging is consumed; a second unknown fd is not a candidate.
        let other = table.claim(100, 8, false);
        assert_eq!(other.state, SocketState::NotBypassable);
    }

    #[test]
    fn non_tcp_sockets_are_not_candidates() {
        let mut table = SocketTable::default();
        table.stage(1, StagedSocket {
            domain: libc::AF_INET as u64,
            sock_type: libc::SOCK_DGRAM as u64,
            protocol: 0,
        });
        assert_eq!(table.claim(1, 3, false).state, SocketState::NotBypassable);

        table.stage(2, StagedSocket {
            domain: libc::AF_UNIX as u64,
            sock_type: libc::SOCK_STREAM as u64,
            protocol: 0,
        });
        assert_eq!(table.claim(2, 3, false).state, SocketState::NotBypassable);
    }

    #[test]
    fn cloexec_and_nonblock_flags_do_not_hide_tcp() {
        let mut table = SocketTable::default();
        table.stage(1, StagedSocket {
            domain: libc::AF_INET6 as u64,
            sock_type: (libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK) as u64,
            protocol: 0,
        });
        assert_eq!(table.claim(1, 3, false).state, SocketState::NotBypassed);
    }

    #[test]
    fn fcntl_recording_filters_commands() {
        let mut table = SocketTable::default();
        table.stage(1, tcp_staging());
        let rec = table.claim(1, 3, false);

        rec.record_fcntl(libc::F_SETFL as u64, libc::O_NONBLOCK as u64);
        rec.record_fcntl(libc::F_GETFL as u64, 0);
        rec.record_fcntl(0x4242, 1);
        assert_eq!(rec.fcntls().len(), 1);
        assert_eq!(rec.fcntls()[0].cmd, libc::F_SETFL as u64);
    }

    #[test]
    fn repeated_close_is_idempotent() {
        let mut table = SocketTable::default();
        table.stage(1, tcp_staging());
        table.claim(1, 3, false);
        assert_eq!(table.len(), 1);

        assert!(table.remove(1, 3).is_some());
        assert!(table.remove(1, 3).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn configure_replays_recorded_options_in_order() {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(raw >= 0);
        let host = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut table = SocketTable::default();
        table.stage(1, tcp_staging());
        let rec = table.claim(1, 3, false);
        rec.record_sockopt(
            libc::SOL_SOCKET as u64,
            libc::SO_REUSEADDR as u64,
            1i32.to_ne_bytes().to_vec(),
            4,
        );
        rec.record_sockopt(
            libc::SOL_SOCKET as u64,
            libc::SO_KEEPALIVE as u64,
            1i32.to_ne_bytes().to_vec(),
            4,
        );
        rec.record_fcntl(libc::F_SETFL as u64, libc::O_NONBLOCK as u64);

        // Replay happens in insertion order.
        assert_eq!(rec.sockopts().len(), 2);
        assert_eq!(rec.sockopts()[0].optname, libc::SO_REUSEADDR as u64);
        assert_eq!(rec.sockopts()[1].optname, libc::SO_KEEPALIVE as u64);
        rec.configure(raw).unwrap();

        let mut val: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &mut val as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(val, 1);

        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        drop(host);
    }

    #[test]
    fn configure_aborts_on_the_first_failure() {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(raw >= 0);
        let host = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut table = SocketTable::default();
        table.stage(1, tcp_staging());
        let rec = table.claim(1, 3, false);
        rec.record_sockopt(0x7fff, 0x7fff, vec![1, 0, 0, 0], 4);
        assert!(rec.configure(raw).is_err());
        drop(host);
    }
}
