pub mod addr;
pub mod error;
pub mod subnet;
pub mod types;

pub use addr::SockAddr;
pub use error::{BypassError, Result};
pub use subnet::{IpSubnet, SubnetSet};
pub use types::{
    parse_publish_flag, C2CConnectionConfig, ContainerInterface, ContainerProcessState,
    ForwardPortMapping, MultinodeConfig, SECCOMP_FD_NAME,
};
