use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::Pid;
use sockbypass_common::{
    parse_publish_flag, BypassError, C2CConnectionConfig, MultinodeConfig, Result, SubnetSet,
};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

/// sockbypass - accelerate rootless-container network I/O by replacing
/// sockets that do not need the in-namespace network stack with sockets
/// created in the host network namespace.
#[derive(Parser, Debug)]
#[command(name = "sockbypass")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Seccomp-notify socket interception engine for rootless containers")]
pub struct Args {
    /// Control socket receiving seccomp fds from the runtime hook
    #[arg(long = "socket")]
    pub socket: Option<PathBuf>,

    /// Pid file path
    #[arg(long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Duplicate logs into a file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Publish a container's port to the host (HOST:CHILD)
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Subnets to ignore; "auto" also discovers host interface addresses
    #[arg(long = "ignore", default_values_t = ["127.0.0.0/8".to_string()])]
    pub ignore: Vec<String>,

    /// Only handle connects to this destination IP
    #[arg(long = "ip")]
    pub ip: Option<IpAddr>,

    /// Disable bypassing bind(2)
    #[arg(long = "ignore-bind")]
    pub ignore_bind: bool,

    /// Handle connections between containers
    #[arg(long = "handle-c2c-connections")]
    pub handle_c2c_connections: bool,

    /// Enable the connection tracer collaborator
    #[arg(long = "tracer")]
    pub tracer: bool,

    /// Enable multinode communication
    #[arg(long = "multinode")]
    pub multinode: bool,

    /// Etcd address for multinode communication
    #[arg(long = "multinode-etcd-address")]
    pub multinode_etcd_address: Option<String>,

    /// Host address for multinode communication
    #[arg(long = "multinode-host-address")]
    pub multinode_host_address: Option<String>,

    /// File descriptor to notify when ready
    #[arg(long = "ready-fd", default_value_t = -1)]
    pub ready_fd: i32,

    /// File descriptor whose closure terminates sockbypass
    #[arg(long = "exit-fd", default_value_t = -1)]
    pub exit_fd: i32,

    /// Enable debug logging
    #[arg(long = "debug")]
    pub debug: bool,

    /// (An internal flag. Do not use manually.)
    #[arg(long = "nsagent", hide = true)]
    pub nsagent: bool,

    /// (An internal flag. Do not use manually.)
    #[arg(long = "mem-nsenter-pid", default_value_t = -1, hide = true)]
    pub mem_nsenter_pid: i64,
}

mod handler;
mod mem;
mod notify;
mod nsagent;
mod policy;
mod registry;
mod socket;

use handler::Handler;

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    umask(Mode::from_bits_truncate(0o077));

    if args.nsagent {
        if args.mem_nsenter_pid <= 0 {
            return Err(BypassError::Config(
                "--mem-nsenter-pid is required with --nsagent".to_string(),
            ));
        }
        // Must run before any runtime thread exists: setns(CLONE_NEWNS)
        // requires a single-threaded process.
        return nsagent::run(args.mem_nsenter_pid as u32);
    }

    if args.tracer && !args.handle_c2c_connections {
        return Err(BypassError::Config(
            "--tracer requires --handle-c2c-connections".to_string(),
        ));
    }
    if args.multinode {
        if args.multinode_etcd_address.is_none() {
            return Err(BypassError::Config(
                "--multinode-etcd-address is not specified".to_string(),
            ));
        }
        if args.multinode_host_address.is_none() {
            return Err(BypassError::Config(
                "--multinode-host-address is not specified".to_string(),
            ));
        }
    }

    let socket_path = match &args.socket {
        Some(path) => path.clone(),
        None => {
            let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| {
                BypassError::Config(
                    "$XDG_RUNTIME_DIR needs to be set when --socket is not given".to_string(),
                )
            })?;
            PathBuf::from(runtime_dir).join("sockbypass.sock")
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args, socket_path))
}

async fn run(args: Args, socket_path: PathBuf) -> Result<()> {
    info!("starting sockbypass v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %socket_path.display(), "control socket");

    if let Some(pid_file) = &args.pid_file {
        std::fs::write(pid_file, std::process::id().to_string())?;
        info!(path = %pid_file.display(), "pid file written");
    }

    let mut handler = Handler::new(socket_path, args.ignore_bind, args.ip);

    let mut subnets = SubnetSet::new();
    let mut subnets_auto = false;
    for subnet in &args.ignore {
        if subnet == "auto" {
            if subnets_auto {
                warn!("--ignore=\"auto\" appeared multiple times");
            }
            subnets_auto = true;
            info!("enabling auto-discovery for --ignore");
        } else {
            subnets.push(subnet.parse()?);
            info!("{} is added to ignore", subnet);
        }
    }
    handler.set_ignored_subnets(subnets, subnets_auto);

    for publish in &args.publish {
        let mapping = parse_publish_flag(publish)?;
        info!(
            host = mapping.host_port,
            child = mapping.child_port,
            "forwarding port is added"
        );
        handler.set_forward_port(mapping)?;
    }

    handler.configure_c2c(C2CConnectionConfig {
        enable: args.handle_c2c_connections,
        tracer_enable: args.tracer,
    });
    if args.multinode {
        let config = MultinodeConfig {
            enable: true,
            etcd_address: args.multinode_etcd_address.clone().unwrap_or_default(),
            host_address: args.multinode_host_address.clone().unwrap_or_default(),
        };
        info!(
            etcd_address = %config.etcd_address,
            host_address = %config.host_address,
            "multinode communication is enabled"
        );
        handler.configure_multinode(config);
    }
    if let Some(ip) = args.ip {
        info!(%ip, "only handling this destination");
    }

    if args.exit_fd >= 0 {
        watch_exit_fd(args.exit_fd);
    }

    let ready_fd = (args.ready_fd >= 0).then_some(args.ready_fd);
    let result = handler.start(ready_fd).await;

    if let Some(pid_file) = &args.pid_file {
        info!(path = %pid_file.display(), "removing pid file");
        if let Err(e) = std::fs::remove_file(pid_file) {
            warn!("failed to remove pid file: {}", e);
        }
    }
    result
}

/// When the launcher closes the exit fd's peer, terminate via the regular
/// signal path so shutdown cleanup still runs.
fn watch_exit_fd(fd: i32) {
    tokio::task::spawn_blocking(move || {
        let mut exit_file = unsafe { File::from_raw_fd(fd) };
        let mut buf = [0u8; 16];
        loop {
            match exit_file.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("failed to wait for the exit fd: {}", e);
                    break;
                }
            }
        }
        info!("the exit fd was closed, sending SIGTERM to the process itself");
        if let Err(e) = kill(Pid::this(), Signal::SIGTERM) {
            error!("failed to signal the process: {}", e);
        }
    });
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    // Logs go to stderr: the nsagent mode owns stdout for its ack stream.
    match &args.log_file {
        Some(path) => {
            use tracing_subscriber::fmt::writer::MakeWriterExt;
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr.and(Arc::new(file)))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    if args.debug {
        info!("debug mode enabled");
    }
    Ok(())
}
