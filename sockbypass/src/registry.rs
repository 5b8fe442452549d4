/*!
 * Multi-node registry lookup.
 *
 * Read-only client for an etcd-compatible HTTP key-value store. Keys are
 * `<prefix><addr:port>` as seen inside the container network namespace;
 * values are `host:port` strings naming where the published socket actually
 * listens. Key absence means "not registered". Every lookup is bounded by a
 * two-second deadline so a dead registry cannot stall a connect notification
 * forever.
 */

use sockbypass_common::{BypassError, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const REGISTRY_KEY_PREFIX: &str = "sockbypass/multinode/";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RegistryClient {
    endpoint: String,
    prefix: String,
}

impl RegistryClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        RegistryClient {
            endpoint: endpoint.into(),
            prefix: REGISTRY_KEY_PREFIX.to_string(),
        }
    }

    pub fn key_for(&self, addr: &SocketAddr) -> String {
        format!("{}{}", self.prefix, addr)
    }

    /// Resolve the host-side address registered for a container-side
    /// destination. Returns `None` when the key is absent or the registry is
    /// unreachable within the deadline; a present-but-malformed value is a
    /// policy error.
    pub async fn lookup(&self, addr: &SocketAddr) -> Result<Option<(IpAddr, u16)>> {
        let key = self.key_for(addr);
        match tokio::time::timeout(LOOKUP_TIMEOUT, self.get(&key)).await {
            Err(_) => {
                warn!(%key, "registry lookup timed out");
                Ok(None)
            }
            Ok(Err(e)) => {
                warn!(%key, "registry lookup failed: {}", e);
                Ok(None)
            }
            Ok(Ok(None)) => {
                debug!(%key, "destination is not registered");
                Ok(None)
            }
            Ok(Ok(Some(value))) => parse_host_port(&value).map(Some),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut stream = TcpStream::connect(self.endpoint.as_str()).await?;
        let request = format!(
            "GET /v2/keys/{} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            key, self.endpoint
        );
        stream.write_all(request.as_bytes()).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        parse_response(&raw)
    }
}

fn parse_response(raw: &[u8]) -> Result<Option<String>> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| BypassError::Policy(format!("registry response is not UTF-8: {}", e)))?;
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| BypassError::Policy("truncated registry response".to_string()))?;
    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| BypassError::Policy("empty registry response".to_string()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BypassError::Policy(format!("bad status line: {}", status_line)))?;

    match status {
        200 => {
            let value: serde_json::Value = serde_json::from_str(body)
                .map_err(|e| BypassError::Policy(format!("registry response body: {}", e)))?;
            let node_value = value["node"]["value"]
                .as_str()
                .ok_or_else(|| BypassError::Policy("registry response has no node value".to_string()))?;
            Ok(Some(node_value.to_string()))
        }
        404 => Ok(None),
        other => Err(BypassError::Policy(format!(
            "registry returned status {}",
            other
        ))),
    }
}

/// Parse a registered `host:port` value; IPv6 hosts may be bracketed.
pub(crate) fn parse_host_port(value: &str) -> Result<(IpAddr, u16)> {
    if let Ok(sa) = value.parse::<SocketAddr>() {
        return Ok((sa.ip(), sa.port()));
    }
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| BypassError::Policy(format!("invalid address format {:?}", value)))?;
    let host: IpAddr = host
        .parse()
        .map_err(|_| BypassError::Policy(format!("invalid address format {:?}", value)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BypassError::Policy(format!("invalid address format {:?}", value)))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn builds_keys_from_container_side_addresses() {
        let client = RegistryClient::new("127.0.0.1:2379");
        let addr: SocketAddr = "10.4.0.2:80".parse().unwrap();
        assert_eq!(client.key_for(&addr), "sockbypass/multinode/10.4.0.2:80");
    }

    #[test]
    fn parses_host_port_values() {
        assert_eq!(
            parse_host_port("10.0.0.5:8080").unwrap(),
            ("10.0.0.5".parse::<IpAddr>().unwrap(), 8080)
        );
        assert_eq!(
            parse_host_port("[fd00::5]:8080").unwrap(),
            ("fd00::5".parse::<IpAddr>().unwrap(), 8080)
        );
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port("10.0.0.5:notaport").is_err());
    }

    #[test]
    fn parses_registry_responses() {
        let ok = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"node\":{\"key\":\"/k\",\"value\":\"10.0.0.5:8080\"}}";
        assert_eq!(
            parse_response(ok).unwrap(),
            Some("10.0.0.5:8080".to_string())
        );

        let missing = b"HTTP/1.1 404 Not Found\r\n\r\n{\"errorCode\":100}";
        assert_eq!(parse_response(missing).unwrap(), None);

        let broken = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
        assert!(parse_response(broken).is_err());
    }

    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn looks_up_a_registered_destination() {
        let addr = serve_once(
            "HTTP/1.1 200 OK\r\n\r\n{\"node\":{\"value\":\"192.168.10.5:30080\"}}",
        )
        .await;
        let client = RegistryClient::new(addr.to_string());
        let dest: SocketAddr = "10.4.0.2:80".parse().unwrap();
        let resolved = client.lookup(&dest).await.unwrap();
        assert_eq!(
            resolved,
            Some(("192.168.10.5".parse::<IpAddr>().unwrap(), 30080))
        );
    }

    #[tokio::test]
    async fn unregistered_destination_resolves_to_none() {
        let addr = serve_once("HTTP/1.1 404 Not Found\r\n\r\n{}").await;
        let client = RegistryClient::new(addr.to_string());
        let dest: SocketAddr = "10.4.0.2:80".parse().unwrap();
        assert_eq!(client.lookup(&dest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_registered_value_is_a_policy_error() {
        let addr =
            serve_once("HTTP/1.1 200 OK\r\n\r\n{\"node\":{\"value\":\"not-an-address\"}}").await;
        let client = RegistryClient::new(addr.to_string());
        let dest: SocketAddr = "10.4.0.2:80".parse().unwrap();
        assert!(matches!(
            client.lookup(&dest).await,
            Err(BypassError::Policy(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_registry_is_not_fatal() {
        // Nothing listens on this port.
        let client = RegistryClient::new("127.0.0.1:1");
        let dest: SocketAddr = "10.4.0.2:80".parse().unwrap();
        assert_eq!(client.lookup(&dest).await.unwrap(), None);
    }
}
