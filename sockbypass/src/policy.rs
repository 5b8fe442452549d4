/*!
 * Bypass policy evaluation.
 *
 * Each session task owns an immutable snapshot of the handler's tables,
 * taken when the seccomp fd was accepted. Updates to the parent handler's
 * tables never affect in-flight sessions mid-decision.
 */

use crate::registry::RegistryClient;
use nix::ifaddrs::getifaddrs;
use sockbypass_common::subnet::{is_private_ip, private_ranges, IpSubnet};
use sockbypass_common::{
    C2CConnectionConfig, ContainerInterface, ForwardPortMapping, MultinodeConfig, Result,
    SockAddr, SubnetSet,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::{debug, info, warn};

/// Per-session policy snapshot, deep-copied from the handler at spawn time.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub container_id: String,
    pub ignored: SubnetSet,
    pub forward_ports: HashMap<u16, ForwardPortMapping>,
    pub container_interfaces: HashMap<SocketAddr, ContainerInterface>,
    pub non_bypassable: HashSet<IpAddr>,
    pub c2c: C2CConnectionConfig,
    pub multinode: MultinodeConfig,
    pub handler_ip: Option<IpAddr>,
    pub ignore_bind: bool,
}

/// In-place rewrite to apply to the caller's sockaddr after the host socket
/// is installed. `ip: None` keeps the original destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRewrite {
    pub port: u16,
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Fall through to the kernel's normal path inside the namespace.
    NotBypassable,
    /// Substitute a host socket; rewrite the destination if requested.
    Bypass { rewrite: Option<AddrRewrite> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDecision {
    NotBypassable,
    /// Bind a host socket to the same address with the host-side port.
    Bypass { host_port: u16 },
}

fn loopback_for(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

impl PolicySnapshot {
    /// Decide the fate of a connect(2) destination.
    pub async fn decide_connect(
        &self,
        dest: &SockAddr,
        registry: Option<&RegistryClient>,
    ) -> Result<ConnectDecision> {
        let dest_sa = dest.to_socket_addr();

        if let Some(ip) = self.handler_ip {
            if dest_sa.ip() != ip {
                debug!(dest = %dest_sa, handler_ip = %ip, "destination does not match handler ip");
                return Ok(ConnectDecision::NotBypassable);
            }
        }

        let mut rewrite_port = None;
        let mut rewrite_ip = None;

        if let Some(fwd) = self.forward_ports.get(&dest.port) {
            if dest_sa.ip().is_loopback() {
                info!(dest = %dest_sa, "destination is loopback and bypassed");
                rewrite_port = Some(fwd.host_port);
            } else if let Some(contif) = self.container_interfaces.get(&dest_sa) {
                if contif.container_id == self.container_id {
                    info!(dest = %dest_sa, "destination is this container's interface and bypassed");
                    rewrite_port = Some(fwd.host_port);
                    rewrite_ip = Some(loopback_for(&dest_sa.ip()));
                }
            }
        }

        if rewrite_port.is_none() {
            if self.multinode.enable && is_private_ip(&dest_sa.ip()) {
                if let Some(registry) = registry {
                    if let Some((host, port)) = registry.lookup(&dest_sa).await? {
                        info!(dest = %dest_sa, host = %host, port, "destination bypassed via overlay network");
                        rewrite_ip = Some(host);
                        rewrite_port = Some(port);
                    }
                }
            } else if self.c2c.enable {
                if let Some(contif) = self.container_interfaces.get(&dest_sa) {
                    info!(dest = %dest_sa, "destination is another container's interface and bypassed");
                    rewrite_port = Some(contif.host_port);
                    rewrite_ip = Some(loopback_for(&dest_sa.ip()));
                }
            }
        }

        if let Some(port) = rewrite_port {
            return Ok(ConnectDecision::Bypass {
                rewrite: Some(AddrRewrite {
                    port,
                    ip: rewrite_ip,
                }),
            });
        }

        if self.ignored.contains(&dest_sa.ip()) {
            info!(dest = %dest_sa, "destination is ignored");
            return Ok(ConnectDecision::NotBypassable);
        }

        if self.non_bypassable.contains(&dest_sa.ip()) {
            info!(dest = %dest_sa, "destination is only reachable inside the namespace");
            return Ok(ConnectDecision::NotBypassable);
        }

        // Reachable from the host as-is; substitute the socket without
        // touching the destination.
        Ok(ConnectDecision::Bypass { rewrite: None })
    }

    /// Decide the fate of a bind(2) address.
    pub fn decide_bind(&self, addr: &SockAddr, ignore_bind: bool) -> BindDecision {
        if ignore_bind {
            return BindDecision::NotBypassable;
        }
        match self.forward_ports.get(&addr.port) {
            Some(fwd) => BindDecision::Bypass {
                host_port: fwd.host_port,
            },
            None => {
                debug!(port = addr.port, "port is not a target of port forwarding");
                BindDecision::NotBypassable
            }
        }
    }
}

/// Enumerate the subnets that `--ignore auto` adds: every host interface
/// network plus the private ranges.
pub fn discover_ignored() -> Result<Vec<IpSubnet>> {
    let mut subnets = private_ranges();
    for ifaddr in getifaddrs()? {
        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };
        if let (Some(addr), Some(mask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in()) {
            let prefix_len = u32::from(Ipv4Addr::from(mask.ip())).count_ones() as u8;
            match IpSubnet::new(IpAddr::V4(Ipv4Addr::from(addr.ip())), prefix_len) {
                Ok(subnet) => {
                    debug!(interface = %ifaddr.interface_name, %subnet, "discovered interface subnet");
                    subnets.push(subnet);
                }
                Err(e) => warn!(interface = %ifaddr.interface_name, "skipping interface address: {}", e),
            }
        } else if let (Some(addr), Some(mask)) =
            (address.as_sockaddr_in6(), netmask.as_sockaddr_in6())
        {
            let prefix_len = u128::from(mask.ip()).count_ones() as u8;
            match IpSubnet::new(IpAddr::V6(addr.ip()), prefix_len) {
                Ok(subnet) => {
                    debug!(interface = %ifaddr.interface_name, %subnet, "discovered interface subnet");
                    subnets.push(subnet);
                }
                Err(e) => warn!(interface = %ifaddr.interface_name, "skipping interface address: {}", e),
            }
        }
    }
    Ok(subnets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockbypass_common::parse_publish_flag;

    fn snapshot_with_forward(child: u16, host: u16) -> PolicySnapshot {
        let mut snapshot = PolicySnapshot {
            container_id: "6d9bcda7cebd".to_string(),
            ..Default::default()
        };
        let mapping = parse_publish_flag(&format!("{}:{}", host, child)).unwrap();
        snapshot.forward_ports.insert(child, mapping);
        snapshot
    }

    fn sock_addr(text: &str) -> SockAddr {
        SockAddr::from_socket_addr(text.parse().unwrap())
    }

    #[tokio::test]
    async fn loopback_destination_on_forwarded_port_is_bypassed() {
        let snapshot = snapshot_with_forward(5201, 8080);
        let decision = snapshot
            .decide_connect(&sock_addr("127.0.0.1:5201"), None)
            .await
            .unwrap();
        assert_eq!(
            decision,
            ConnectDecision::Bypass {
                rewrite: Some(AddrRewrite {
                    port: 8080,
                    ip: None
                })
            }
        );
    }

    #[tokio::test]
    async fn own_interface_destination_rewrites_to_loopback() {
        let mut snapshot = snapshot_with_forward(5201, 8080);
        snapshot.container_interfaces.insert(
            "10.4.0.2:5201".parse().unwrap(),
            ContainerInterface {
                container_id: "6d9bcda7cebd".to_string(),
                host_port: 8080,
            },
        );
        let decision = snapshot
            .decide_connect(&sock_addr("10.4.0.2:5201"), None)
            .await
            .unwrap();
        assert_eq!(
            decision,
            ConnectDecision::Bypass {
                rewrite: Some(AddrRewrite {
                    port: 8080,
                    ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                })
            }
        );
    }

    #[tokio::test]
    async fn other_containers_interface_needs_c2c_mode() {
        let mut snapshot = snapshot_with_forward(5201, 8080);
        snapshot.container_interfaces.insert(
            "10.4.0.3:80".parse().unwrap(),
            ContainerInterface {
                container_id: "other".to_string(),
                host_port: 30080,
            },
        );

        // c2c disabled: plain bypass, no rewrite (destination is routable).
        let decision = snapshot
            .decide_connect(&sock_addr("10.4.0.3:80"), None)
            .await
            .unwrap();
        assert_eq!(decision, ConnectDecision::Bypass { rewrite: None });

        // c2c enabled: peer bypass through the host loopback.
        snapshot.c2c.enable = true;
        let decision = snapshot
            .decide_connect(&sock_addr("10.4.0.3:80"), None)
            .await
            .unwrap();
        assert_eq!(
            decision,
            ConnectDecision::Bypass {
                rewrite: Some(AddrRewrite {
                    port: 30080,
                    ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                })
            }
        );
    }

    #[tokio::test]
    async fn non_bypassable_destination_falls_through() {
        let mut snapshot = PolicySnapshot::default();
        snapshot
            .non_bypassable
            .insert("10.4.0.2".parse().unwrap());
        let decision = snapshot
            .decide_connect(&sock_addr("10.4.0.2:80"), None)
            .await
            .unwrap();
        assert_eq!(decision, ConnectDecision::NotBypassable);
    }

    #[tokio::test]
    async fn ignored_destination_falls_through() {
        let mut snapshot = PolicySnapshot::default();
        snapshot.ignored.push("10.0.0.0/8".parse().unwrap());
        let decision = snapshot
            .decide_connect(&sock_addr("10.9.9.9:443"), None)
            .await
            .unwrap();
        assert_eq!(decision, ConnectDecision::NotBypassable);
    }

    #[tokio::test]
    async fn forwarded_port_beats_the_ignore_list() {
        // The default ignore list carries 127.0.0.0/8; a published loopback
        // destination must still be bypassed.
        let mut snapshot = snapshot_with_forward(5201, 8080);
        snapshot.ignored.push("127.0.0.0/8".parse().unwrap());
        let decision = snapshot
            .decide_connect(&sock_addr("127.0.0.1:5201"), None)
            .await
            .unwrap();
        assert!(matches!(decision, ConnectDecision::Bypass { rewrite: Some(_) }));
    }

    #[tokio::test]
    async fn handler_ip_filter_skips_other_destinations() {
        let mut snapshot = snapshot_with_forward(5201, 8080);
        snapshot.handler_ip = Some("10.4.0.9".parse().unwrap());
        let decision = snapshot
            .decide_connect(&sock_addr("127.0.0.1:5201"), None)
            .await
            .unwrap();
        assert_eq!(decision, ConnectDecision::NotBypassable);
    }

    #[test]
    fn bind_respects_ignore_bind() {
        let snapshot = snapshot_with_forward(5201, 8080);
        assert_eq!(
            snapshot.decide_bind(&sock_addr("0.0.0.0:5201"), true),
            BindDecision::NotBypassable
        );
    }

    #[test]
    fn bind_maps_the_child_port_to_the_host_port() {
        let snapshot = snapshot_with_forward(5201, 8080);
        assert_eq!(
            snapshot.decide_bind(&sock_addr("0.0.0.0:5201"), false),
            BindDecision::Bypass { host_port: 8080 }
        );
        assert_eq!(
            snapshot.decide_bind(&sock_addr("0.0.0.0:9999"), false),
            BindDecision::NotBypassable
        );
    }

    #[test]
    fn auto_discovery_includes_private_ranges() {
        let subnets = discover_ignored().unwrap();
        let set = {
            let mut s = SubnetSet::new();
            s.extend(subnets);
            s
        };
        assert!(set.contains(&"10.1.2.3".parse().unwrap()));
        assert!(set.contains(&"192.168.0.1".parse().unwrap()));
    }
}
