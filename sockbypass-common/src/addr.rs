use crate::error::{BypassError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family values as used in the kernel sockaddr layout.
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Byte offset of the big-endian port within any sockaddr buffer.
pub const PORT_OFFSET: u64 = 2;
/// Byte offset of the 4 address bytes within a sockaddr_in buffer.
pub const INET_ADDR_OFFSET: u64 = 4;
/// Byte offset of the 16 address bytes within a sockaddr_in6 buffer
/// (family, port and flowinfo come first).
pub const INET6_ADDR_OFFSET: u64 = 8;

/// Encoded sizes of the two supported sockaddr layouts.
pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;

/// A socket address decoded from (or encoded to) the kernel sockaddr layout:
/// 2-byte native-endian family, 2-byte big-endian port, then 4 address bytes
/// for AF_INET or 4-byte flowinfo, 16 address bytes and a 4-byte scope id
/// for AF_INET6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockAddr {
    pub family: u16,
    pub port: u16,
    pub ip: IpAddr,
    pub scope_id: u32,
}

impl SockAddr {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SockAddr {
                family: AF_INET,
                port: v4.port(),
                ip: IpAddr::V4(*v4.ip()),
                scope_id: 0,
            },
            SocketAddr::V6(v6) => SockAddr {
                family: AF_INET6,
                port: v6.port(),
                ip: IpAddr::V6(*v6.ip()),
                scope_id: v6.scope_id(),
            },
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Decode a sockaddr buffer read from a process.
    ///
    /// Returns `Ok(None)` for families other than AF_INET/AF_INET6 so the
    /// caller can fall through without treating the buffer as an error.
    /// A buffer too short for its own family is a [`BypassError::Decode`].
    pub fn decode(buf: &[u8]) -> Result<Option<SockAddr>> {
        if buf.len() < 2 {
            return Err(BypassError::Decode(format!(
                "sockaddr buffer too short: {} bytes",
                buf.len()
            )));
        }
        let family = u16::from_ne_bytes([buf[0], buf[1]]);

        match family {
            AF_INET => {
                if buf.len() < 8 {
                    return Err(BypassError::Decode(format!(
                        "sockaddr_in buffer too short: {} bytes",
                        buf.len()
                    )));
                }
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                Ok(Some(SockAddr {
                    family,
                    port,
                    ip: IpAddr::V4(ip),
                    scope_id: 0,
                }))
            }
            AF_INET6 => {
                if buf.len() < SOCKADDR_IN6_LEN {
                    return Err(BypassError::Decode(format!(
                        "sockaddr_in6 buffer too short: {} bytes",
                        buf.len()
                    )));
                }
                let port = u16::from_be_bytes([buf[2], buf[3]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);
                let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
                Ok(Some(SockAddr {
                    family,
                    port,
                    ip: IpAddr::V6(Ipv6Addr::from(octets)),
                    scope_id,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Encode into the kernel sockaddr layout for writeback into a process.
    pub fn encode(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(ip) => {
                let mut buf = vec![0u8; SOCKADDR_IN_LEN];
                buf[0..2].copy_from_slice(&AF_INET.to_ne_bytes());
                buf[2..4].copy_from_slice(&self.port.to_be_bytes());
                buf[4..8].copy_from_slice(&ip.octets());
                buf
            }
            IpAddr::V6(ip) => {
                let mut buf = vec![0u8; SOCKADDR_IN6_LEN];
                buf[0..2].copy_from_slice(&AF_INET6.to_ne_bytes());
                buf[2..4].copy_from_slice(&self.port.to_be_bytes());
                buf[8..24].copy_from_slice(&ip.octets());
                buf[24..28].copy_from_slice(&self.scope_id.to_ne_bytes());
                buf
            }
        }
    }

    /// Validate the caller-supplied addrlen against this address's family
    /// layout before any in-place rewrite touches the buffer.
    pub fn validate_len(&self, addrlen: usize) -> Result<()> {
        let required = match self.ip {
            IpAddr::V4(_) => SOCKADDR_IN_LEN,
            IpAddr::V6(_) => SOCKADDR_IN6_LEN,
        };
        if addrlen < required {
            return Err(BypassError::Decode(format!(
                "addrlen {} too small for family {} (need {})",
                addrlen, self.family, required
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}
