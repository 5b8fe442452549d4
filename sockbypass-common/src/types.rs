use crate::error::{BypassError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Well-known name identifying the seccomp fd among the fds attached to a
/// container process state message.
pub const SECCOMP_FD_NAME: &str = "seccompFd";

/// One entry of the forward-port table, keyed by the child-side port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPortMapping {
    pub host_port: u16,
    pub child_port: u16,
    pub protos: Vec<String>,
    pub child_ip: Option<IpAddr>,
}

/// Parse a `-p HOST:CHILD` publish flag into a forward-port mapping.
pub fn parse_publish_flag(s: &str) -> Result<ForwardPortMapping> {
    let (host, child) = s
        .split_once(':')
        .ok_or_else(|| BypassError::Config(format!("invalid publish port format: '{}'", s)))?;
    let host_port: u16 = host
        .parse()
        .map_err(|_| BypassError::Config(format!("not a port number '{}' in '{}'", host, s)))?;
    let child_port: u16 = child
        .parse()
        .map_err(|_| BypassError::Config(format!("not a port number '{}' in '{}'", child, s)))?;
    Ok(ForwardPortMapping {
        host_port,
        child_port,
        protos: vec!["tcp".to_string()],
        child_ip: None,
    })
}

/// A container-side `address:port` published by another (or the same)
/// container, as discovered by the tracer collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInterface {
    pub container_id: String,
    pub host_port: u16,
}

/// Toggles for container-to-container connection handling.
#[derive(Debug, Clone, Default)]
pub struct C2CConnectionConfig {
    pub enable: bool,
    pub tracer_enable: bool,
}

/// Multi-node registry configuration.
#[derive(Debug, Clone, Default)]
pub struct MultinodeConfig {
    pub enable: bool,
    pub etcd_address: String,
    pub host_address: String,
}

/// OCI container process state, received on the control socket alongside the
/// SCM_RIGHTS fds named by `fds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProcessState {
    #[serde(default)]
    pub version: String,
    pub fds: Vec<String>,
    pub pid: i32,
    #[serde(default)]
    pub metadata: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    #[serde(default)]
    pub oci_version: String,
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_publish_flag() {
        let m = parse_publish_flag("8080:5201").unwrap();
        assert_eq!(m.host_port, 8080);
        assert_eq!(m.child_port, 5201);
        assert_eq!(m.protos, vec!["tcp".to_string()]);
        assert!(m.child_ip.is_none());
    }

    #[test]
    fn rejects_malformed_publish_flags() {
        assert!(parse_publish_flag("8080").is_err());
        assert!(parse_publish_flag("eight:80").is_err());
        assert!(parse_publish_flag("8080:eighty").is_err());
        assert!(parse_publish_flag("99999:80").is_err());
    }

    #[test]
    fn parses_container_process_state() {
        let raw = r#"{
            "ociVersion": "1.0.2",
            "fds": ["seccompFd"],
            "pid": 4242,
            "metadata": "sockbypass",
            "state": {
                "ociVersion": "1.0.2",
                "id": "6d9bcda7cebd551ddc9e3173d2139386",
                "status": "running",
                "pid": 4242,
                "bundle": "/run/containers/6d9bcda7cebd"
            }
        }"#;
        let state: ContainerProcessState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.pid, 4242);
        assert_eq!(state.fds, vec![SECCOMP_FD_NAME.to_string()]);
        assert_eq!(state.state.id, "6d9bcda7cebd551ddc9e3173d2139386");
    }

    #[test]
    fn missing_required_state_fields_fail() {
        assert!(serde_json::from_str::<ContainerProcessState>(r#"{"fds": []}"#).is_err());
    }
}
