/*!
 * Session handling and syscall dispatch.
 *
 * The handler listens on a unix socket for container process state messages
 * carrying seccomp fds, and spawns one independent task per fd. Each task
 * owns its fd, its per-socket record map and a deep copy of the policy
 * tables; the tasks share nothing mutable.
 */

use crate::mem::{self, MemWriter};
use crate::notify::{
    NotifyFd, SeccompNotif, SeccompNotifAddfd, SeccompNotifResp, SECCOMP_ADDFD_FLAG_SETFD,
    SECCOMP_USER_NOTIF_FLAG_CONTINUE,
};
use crate::policy::{self, AddrRewrite, BindDecision, ConnectDecision, PolicySnapshot};
use crate::registry::RegistryClient;
use crate::socket::{SocketRecord, SocketState, SocketTable, StagedSocket};
use nix::errno::Errno;
use nix::sys::socket::{bind as host_bind, recvmsg, ControlMessageOwned, MsgFlags, SockaddrIn, SockaddrIn6};
use sockbypass_common::addr::{INET6_ADDR_OFFSET, INET_ADDR_OFFSET, PORT_OFFSET};
use sockbypass_common::{
    BypassError, C2CConnectionConfig, ContainerInterface, ContainerProcessState,
    ForwardPortMapping, MultinodeConfig, Result, SockAddr, SubnetSet, SECCOMP_FD_NAME,
};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{IoSliceMut, Write};
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Owns the authoritative policy tables and the control socket.
pub struct Handler {
    socket_path: PathBuf,
    ignored: SubnetSet,
    ignored_auto: bool,
    forward_ports: HashMap<u16, ForwardPortMapping>,
    container_interfaces: Arc<RwLock<HashMap<SocketAddr, ContainerInterface>>>,
    non_bypassable: Arc<RwLock<HashSet<IpAddr>>>,
    c2c: C2CConnectionConfig,
    multinode: MultinodeConfig,
    ignore_bind: bool,
    handler_ip: Option<IpAddr>,
}

impl Handler {
    pub fn new(socket_path: PathBuf, ignore_bind: bool, handler_ip: Option<IpAddr>) -> Self {
        Handler {
            socket_path,
            ignored: SubnetSet::new(),
            ignored_auto: false,
            forward_ports: HashMap::new(),
            container_interfaces: Arc::new(RwLock::new(HashMap::new())),
            non_bypassable: Arc::new(RwLock::new(HashSet::new())),
            c2c: C2CConnectionConfig::default(),
            multinode: MultinodeConfig::default(),
            ignore_bind,
            handler_ip,
        }
    }

    pub fn set_ignored_subnets(&mut self, subnets: SubnetSet, auto: bool) {
        self.ignored = subnets;
        self.ignored_auto = auto;
    }

    pub fn set_forward_port(&mut self, mapping: ForwardPortMapping) -> Result<()> {
        if self.forward_ports.contains_key(&mapping.child_port) {
            return Err(BypassError::Config(format!(
                "child port {} is already published",
                mapping.child_port
            )));
        }
        self.forward_ports.insert(mapping.child_port, mapping);
        Ok(())
    }

    pub fn configure_c2c(&mut self, config: C2CConnectionConfig) {
        self.c2c = config;
    }

    pub fn configure_multinode(&mut self, config: MultinodeConfig) {
        self.multinode = config;
    }

    /// Swap in a container-interface map refreshed by the tracer
    /// collaborator. Readers see either the old or the new map, never a
    /// torn one; in-flight sessions keep their spawn-time copy.
    pub fn set_container_interfaces(&self, map: HashMap<SocketAddr, ContainerInterface>) {
        *self
            .container_interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner) = map;
    }

    /// Swap in the set of addresses reachable only inside container network
    /// namespaces.
    pub fn set_non_bypassable(&self, set: HashSet<IpAddr>) {
        *self
            .non_bypassable
            .write()
            .unwrap_or_else(PoisonError::into_inner) = set;
    }

    fn snapshot(&self, container_id: String) -> PolicySnapshot {
        let mut ignored = self.ignored.clone();
        if self.ignored_auto {
            match policy::discover_ignored() {
                Ok(subnets) => ignored.extend(subnets),
                Err(e) => warn!("interface auto-discovery failed: {}", e),
            }
        }
        PolicySnapshot {
            container_id,
            ignored,
            forward_ports: self.forward_ports.clone(),
            container_interfaces: self
                .container_interfaces
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            non_bypassable: self
                .non_bypassable
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            c2c: self.c2c.clone(),
            multinode: self.multinode.clone(),
            handler_ip: self.handler_ip,
            ignore_bind: self.ignore_bind,
        }
    }

    /// Accept seccomp fds until SIGTERM/SIGINT. Existing session tasks keep
    /// draining until their fds close.
    pub async fn start(self, ready_fd: Option<RawFd>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "waiting for seccomp file descriptors");

        if let Some(fd) = ready_fd {
            // One byte tells the launcher we are ready; the fd arrived from
            // its pipe and is ours to close.
            let mut ready = unsafe { File::from_raw_fd(fd) };
            ready.write_all(&[b'1'])?;
        }

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| BypassError::Config(format!("installing SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| BypassError::Config(format!("installing SIGINT handler: {}", e)))?;

        let mut sessions: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if let Err(e) = self.handle_connection(stream, &mut sessions).await {
                                error!("rejecting control connection: {}", e);
                            }
                        }
                        Err(e) => error!("cannot accept connection: {}", e),
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        drop(listener);
        info!(path = %self.socket_path.display(), "removing control socket");
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("failed to remove control socket: {}", e);
        }

        if !sessions.is_empty() {
            info!(active = sessions.len(), "waiting for sessions to drain");
            while sessions.join_next().await.is_some() {}
        }
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::UnixStream,
        sessions: &mut JoinSet<()>,
    ) -> Result<()> {
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(false)?;
        let (state, seccomp_fd) =
            tokio::task::spawn_blocking(move || receive_seccomp_fd(&std_stream))
                .await
                .map_err(|e| BypassError::Transport(format!("control receive task: {}", e)))??;

        info!(
            container_id = %state.state.id,
            pid = state.pid,
            fd = seccomp_fd.as_raw_fd(),
            "received new seccomp fd"
        );

        let snapshot = self.snapshot(state.state.id.clone());
        let registry = if snapshot.multinode.enable {
            Some(RegistryClient::new(snapshot.multinode.etcd_address.clone()))
        } else {
            None
        };
        let notify = NotifyFd::new(seccomp_fd)?;
        let session = NotifSession::new(notify, snapshot, registry);
        sessions.spawn(session.run());
        Ok(())
    }
}

/// Receive the single state message of a control connection: the JSON body
/// plus SCM_RIGHTS fds. Returns the seccomp fd; every other received fd is
/// closed here on all paths.
fn receive_seccomp_fd(stream: &StdUnixStream) -> Result<(ContainerProcessState, OwnedFd)> {
    const MAX_STATE_LEN: usize = 4096;
    const MAX_FDS: usize = 8;

    let mut buf = vec![0u8; MAX_STATE_LEN];
    let (received, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(|e| BypassError::Transport(format!("recvmsg on control socket: {}", e)))?;

        let mut fds: Vec<OwnedFd> = Vec::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for fd in raw_fds {
                    // Ownership transfers to us the moment the kernel hands
                    // the descriptor over.
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        (msg.bytes, fds)
    };

    if received == 0 || received >= MAX_STATE_LEN {
        return Err(BypassError::Decode(format!(
            "control message length {} out of range",
            received
        )));
    }
    let state: ContainerProcessState = serde_json::from_slice(&buf[..received])
        .map_err(|e| BypassError::Decode(format!("cannot parse container process state: {}", e)))?;

    let seccomp_fd = take_seccomp_fd(&state.fds, fds)?;
    Ok((state, seccomp_fd))
}

/// Pick the fd named `seccompFd` out of the received set; dropping the rest
/// closes them.
fn take_seccomp_fd(names: &[String], mut fds: Vec<OwnedFd>) -> Result<OwnedFd> {
    let mut index = None;
    for (i, name) in names.iter().enumerate() {
        if name == SECCOMP_FD_NAME {
            if index.is_some() {
                return Err(BypassError::Decode(
                    "malformed state fds: duplicate seccomp fd entry".to_string(),
                ));
            }
            index = Some(i);
        }
    }
    let index = index.ok_or_else(|| {
        BypassError::Decode("seccomp fd not found in state fds".to_string())
    })?;
    if index >= fds.len() {
        return Err(BypassError::Decode(
            "seccomp fd index out of range".to_string(),
        ));
    }
    Ok(fds.swap_remove(index))
}

/// Caller-supplied lengths are validated before they size any allocation:
/// a sockaddr never exceeds sockaddr_storage, an optval never exceeds a page.
const MAX_SOCKADDR_LEN: u64 = 128;
const MAX_OPTVAL_LEN: u64 = 4096;

/// One task per attached seccomp fd.
pub struct NotifSession {
    notify: NotifyFd,
    policy: PolicySnapshot,
    registry: Option<RegistryClient>,
    sockets: SocketTable,
    mem: MemWriter,
}

impl NotifSession {
    pub fn new(notify: NotifyFd, policy: PolicySnapshot, registry: Option<RegistryClient>) -> Self {
        NotifSession {
            notify,
            policy,
            registry,
            sockets: SocketTable::default(),
            mem: MemWriter::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let req = match self.notify.receive().await {
                Ok(Some(req)) => req,
                Ok(None) => {
                    info!("seccomp fd closed, session finished");
                    break;
                }
                Err(e) => {
                    error!("receiving notification failed: {}", e);
                    break;
                }
            };

            let mut resp = SeccompNotifResp {
                id: req.id,
                val: 0,
                error: 0,
                flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
            };

            self.dispatch(&req, &mut resp).await;

            // TOCTOU check: the notifying thread may be gone by now.
            if !self.notify.id_valid(req.id) {
                debug!(id = req.id, "request id is no longer valid, dropping response");
                continue;
            }
            if let Err(e) = self.notify.respond(&mut resp) {
                error!("sending notification response failed: {}", e);
            }
        }
    }

    async fn dispatch(&mut self, req: &SeccompNotif, resp: &mut SeccompNotifResp) {
        let nr = req.data.nr as i64;
        match nr {
            n if n == libc::SYS_socket => self.handle_socket(req),
            n if n == libc::SYS_setsockopt => self.handle_setsockopt(req),
            n if n == libc::SYS_fcntl => self.handle_fcntl(req),
            n if n == libc::SYS_connect => self.handle_connect(req).await,
            n if n == libc::SYS_bind => self.handle_bind(req, resp),
            n if n == libc::SYS_getpeername => self.handle_getpeername(req, resp),
            n if n == libc::SYS_close => self.handle_close(req),
            other => error!(syscall = other, pid = req.pid, "unknown syscall notification"),
        }
    }

    fn handle_socket(&mut self, req: &SeccompNotif) {
        let staged = StagedSocket {
            domain: req.data.args[0],
            sock_type: req.data.args[1],
            protocol: req.data.args[2],
        };
        debug!(
            pid = req.pid,
            domain = staged.domain,
            sock_type = staged.sock_type,
            protocol = staged.protocol,
            "socket"
        );
        self.sockets.stage(req.pid, staged);
    }

    fn handle_setsockopt(&mut self, req: &SeccompNotif) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        let level = req.data.args[1];
        let optname = req.data.args[2];
        let optlen = req.data.args[4];
        if optlen > MAX_OPTVAL_LEN {
            error!(pid, sockfd, optlen, "implausible optlen, not recording");
            return;
        }

        let optval = match mem::read(pid, req.data.args[3], optlen as usize) {
            Ok(buf) => buf,
            Err(e) => {
                error!(pid, sockfd, "reading optval failed: {}", e);
                return;
            }
        };
        let record = self.sockets.claim(pid, sockfd, self.policy.ignore_bind);
        record.record_sockopt(level, optname, optval, optlen);
    }

    fn handle_fcntl(&mut self, req: &SeccompNotif) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        let record = self.sockets.claim(pid, sockfd, self.policy.ignore_bind);
        record.record_fcntl(req.data.args[1], req.data.args[2]);
    }

    fn handle_close(&mut self, req: &SeccompNotif) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        if self.sockets.remove(pid, sockfd).is_some() {
            debug!(pid, sockfd, "close");
        }
    }

    async fn handle_connect(&mut self, req: &SeccompNotif) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        let addr_ptr = req.data.args[1];
        let addrlen = req.data.args[2];

        let record = self.sockets.claim(pid, sockfd, self.policy.ignore_bind);
        match record.state {
            SocketState::NotBypassed => {}
            SocketState::Bypassed => {
                // Already swapped; the kernel connects the host socket.
                record
                    .span
                    .in_scope(|| debug!("connect on an already bypassed socket"));
                return;
            }
            _ => return,
        }
        if addrlen > MAX_SOCKADDR_LEN {
            record
                .span
                .in_scope(|| error!(addrlen, "implausible connect addrlen"));
            record.state = SocketState::NotBypassable;
            return;
        }

        let buf = match mem::read(pid, addr_ptr, addrlen as usize) {
            Ok(buf) => buf,
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!(offset = addr_ptr, "reading connect sockaddr failed: {}", e));
                return;
            }
        };
        let dest = match SockAddr::decode(&buf) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                record
                    .span
                    .in_scope(|| debug!("unsupported destination address family"));
                record.state = SocketState::NotBypassable;
                return;
            }
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!("malformed connect sockaddr: {}", e));
                record.state = SocketState::NotBypassable;
                return;
            }
        };
        record.addr = Some(dest.clone());

        let decision = match self
            .policy
            .decide_connect(&dest, self.registry.as_ref())
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!(dest = %dest, "policy evaluation failed: {}", e));
                record.state = SocketState::Error;
                return;
            }
        };
        let rewrite = match decision {
            ConnectDecision::NotBypassable => {
                record
                    .span
                    .in_scope(|| info!(dest = %dest, "destination is not bypassed"));
                record.state = SocketState::NotBypassable;
                return;
            }
            ConnectDecision::Bypass { rewrite } => rewrite,
        };

        let host_fd = match create_host_socket(record) {
            Ok(fd) => fd,
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!("creating host socket failed: {}", e));
                record.state = SocketState::NotBypassable;
                return;
            }
        };
        if let Err(e) = record.configure(host_fd.as_raw_fd()) {
            record
                .span
                .in_scope(|| error!("configuring host socket failed: {}", e));
            record.state = SocketState::NotBypassable;
            return;
        }

        let addfd = SeccompNotifAddfd {
            id: req.id,
            flags: SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: host_fd.as_raw_fd() as u32,
            newfd: sockfd as u32,
            // SOCK_CLOEXEC must be carried over to the installed fd.
            newfd_flags: (record.sock_type & libc::SOCK_CLOEXEC as u64) as u32,
        };
        if let Err(e) = self.notify.add_fd(&addfd) {
            record
                .span
                .in_scope(|| error!("installing host socket failed: {}", e));
            record.state = SocketState::NotBypassable;
            return;
        }
        // The kernel holds the installed copy; ours closes with host_fd.
        drop(host_fd);

        if let Some(rewrite) = rewrite {
            if let Err(e) = write_rewrite(&mut self.mem, pid, addr_ptr, addrlen, &dest, &rewrite) {
                record
                    .span
                    .in_scope(|| error!("rewriting destination failed: {}", e));
                record.state = SocketState::Error;
                return;
            }
            record.span.in_scope(|| {
                info!(
                    port = rewrite.port,
                    "destination rewritten to host-side address"
                )
            });
        }

        record.state = SocketState::Bypassed;
        record
            .span
            .in_scope(|| info!(dest = %dest, "bypassed connect socket"));
        // The continue flag stays set: the kernel performs the connect on
        // the now-host socket with the (possibly rewritten) sockaddr.
    }

    fn handle_bind(&mut self, req: &SeccompNotif, resp: &mut SeccompNotifResp) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        let addr_ptr = req.data.args[1];
        let addrlen = req.data.args[2];

        let record = self.sockets.claim(pid, sockfd, self.policy.ignore_bind);
        if record.state != SocketState::NotBypassed {
            return;
        }
        if record.ignore_bind {
            record
                .span
                .in_scope(|| debug!("bind interception is disabled"));
            record.state = SocketState::NotBypassable;
            return;
        }
        if addrlen > MAX_SOCKADDR_LEN {
            record
                .span
                .in_scope(|| error!(addrlen, "implausible bind addrlen"));
            record.state = SocketState::NotBypassable;
            return;
        }

        let buf = match mem::read(pid, addr_ptr, addrlen as usize) {
            Ok(buf) => buf,
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!(offset = addr_ptr, "reading bind sockaddr failed: {}", e));
                record.state = SocketState::NotBypassable;
                return;
            }
        };
        let addr = match SockAddr::decode(&buf) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                record
                    .span
                    .in_scope(|| debug!("unsupported bind address family"));
                record.state = SocketState::NotBypassable;
                return;
            }
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!("malformed bind sockaddr: {}", e));
                record.state = SocketState::NotBypassable;
                return;
            }
        };
        record.addr = Some(addr.clone());

        let host_port = match self.policy.decide_bind(&addr, record.ignore_bind) {
            BindDecision::NotBypassable => {
                record.span.in_scope(|| {
                    info!(port = addr.port, "port is not a target of port forwarding")
                });
                record.state = SocketState::NotBypassable;
                return;
            }
            BindDecision::Bypass { host_port } => host_port,
        };

        let host_fd = match create_host_socket(record) {
            Ok(fd) => fd,
            Err(e) => {
                record
                    .span
                    .in_scope(|| error!("creating host socket failed: {}", e));
                record.state = SocketState::NotBypassable;
                return;
            }
        };
        if let Err(e) = record.configure(host_fd.as_raw_fd()) {
            record
                .span
                .in_scope(|| error!("configuring host socket failed: {}", e));
            record.state = SocketState::NotBypassable;
            return;
        }
        if let Err(e) = bind_host_socket(host_fd.as_raw_fd(), &addr, host_port) {
            record
                .span
                .in_scope(|| error!(host_port, "bind on host socket failed: {}", e));
            record.state = SocketState::NotBypassable;
            return;
        }

        let addfd = SeccompNotifAddfd {
            id: req.id,
            flags: SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: host_fd.as_raw_fd() as u32,
            newfd: sockfd as u32,
            newfd_flags: (record.sock_type & libc::SOCK_CLOEXEC as u64) as u32,
        };
        if let Err(e) = self.notify.add_fd(&addfd) {
            record
                .span
                .in_scope(|| error!("installing host socket failed: {}", e));
            record.state = SocketState::NotBypassable;
            return;
        }
        drop(host_fd);

        record.state = SocketState::Bypassed;
        record.span.in_scope(|| {
            info!(
                child_port = addr.port,
                host_port, "bypassed bind socket"
            )
        });

        // The bind already happened on the installed fd; report success
        // instead of letting the kernel bind again inside the namespace.
        resp.flags &= !SECCOMP_USER_NOTIF_FLAG_CONTINUE;
    }

    fn handle_getpeername(&mut self, req: &SeccompNotif, resp: &mut SeccompNotifResp) {
        let pid = req.pid;
        let sockfd = req.data.args[0] as i32;
        let Some(record) = self.sockets.get_mut(pid, sockfd) else {
            return;
        };
        let Some(addr) = record.addr.clone() else {
            return;
        };

        // The installed host socket's real peer may differ from what the
        // caller asked for; synthesize the original destination.
        let buf = addr.encode();
        if let Err(e) = self.mem.write(pid, req.data.args[1], &buf) {
            record
                .span
                .in_scope(|| error!(addr = %addr, "writing peer address failed: {}", e));
            return;
        }
        let len_bytes = (buf.len() as u32).to_le_bytes();
        if let Err(e) = self.mem.write(pid, req.data.args[2], &len_bytes) {
            record
                .span
                .in_scope(|| error!(addr = %addr, "writing peer address length failed: {}", e));
            return;
        }

        resp.flags &= !SECCOMP_USER_NOTIF_FLAG_CONTINUE;
        record
            .span
            .in_scope(|| info!(addr = %addr, "synthesized getpeername address"));
    }
}

fn create_host_socket(record: &SocketRecord) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            record.sock_domain as i32,
            record.sock_type as i32,
            record.sock_protocol as i32,
        )
    };
    if fd < 0 {
        return Err(BypassError::HostSyscall(Errno::last()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_host_socket(fd: RawFd, addr: &SockAddr, host_port: u16) -> Result<()> {
    match addr.ip {
        IpAddr::V4(ip) => {
            let sin = SockaddrIn::from(SocketAddrV4::new(ip, host_port));
            host_bind(fd, &sin)?;
        }
        IpAddr::V6(ip) => {
            let sin6 = SockaddrIn6::from(SocketAddrV6::new(ip, host_port, 0, addr.scope_id));
            host_bind(fd, &sin6)?;
        }
    }
    Ok(())
}

/// Overwrite the port (and optionally the address) inside the caller's
/// sockaddr buffer, after validating the supplied length against the family
/// layout.
fn write_rewrite(
    mem: &mut MemWriter,
    pid: u32,
    addr_ptr: u64,
    addrlen: u64,
    dest: &SockAddr,
    rewrite: &AddrRewrite,
) -> Result<()> {
    dest.validate_len(addrlen as usize)?;
    mem.write(pid, addr_ptr + PORT_OFFSET, &rewrite.port.to_be_bytes())?;

    if let Some(ip) = rewrite.ip {
        match (ip, &dest.ip) {
            (IpAddr::V4(new_ip), IpAddr::V4(_)) => {
                mem.write(pid, addr_ptr + INET_ADDR_OFFSET, &new_ip.octets())?;
            }
            (IpAddr::V6(new_ip), IpAddr::V6(_)) => {
                mem.write(pid, addr_ptr + INET6_ADDR_OFFSET, &new_ip.octets())?;
            }
            _ => {
                return Err(BypassError::Policy(format!(
                    "replacement address {} does not match destination family",
                    ip
                )))
            }
        }
    }
    Ok(())
}
