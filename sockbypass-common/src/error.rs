use thiserror::Error;

/// Common error types used across sockbypass components
#[derive(Error, Debug)]
pub enum BypassError {
    #[error("memory access failed: {0}")]
    MemoryAccess(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("policy evaluation failed: {0}")]
    Policy(String),

    #[error("host syscall failed: {0}")]
    HostSyscall(#[from] nix::Error),

    #[error("notification id is no longer valid")]
    Toctou,

    #[error("seccomp transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

pub type Result<T> = std::result::Result<T, BypassError>;
