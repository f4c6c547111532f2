use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time::timeout;

use super::ClientError;

/// Receiver address as given by the caller: `host`, `host:port`, `v4:port`
/// or `[v6]:port`. A bare IPv6 literal is accepted without brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(addr: &str, default_port: u16) -> Result<Self, ClientError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(ClientError::Address("empty receiver address".into()));
        }

        if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::Address(format!("unclosed bracket in {:?}", addr)))?;
            let port = match tail {
                "" => default_port,
                _ => tail
                    .strip_prefix(':')
                    .ok_or_else(|| ClientError::Address(format!("junk after ] in {:?}", addr)))
                    .and_then(|p| parse_port(p, addr))?,
            };
            return Ok(Self::new(host, port));
        }

        match addr.matches(':').count() {
            0 => Ok(Self::new(addr, default_port)),
            1 => {
                let (host, port) = addr.split_once(':').unwrap_or((addr, ""));
                if host.is_empty() {
                    return Err(ClientError::Address(format!("no host in {:?}", addr)));
                }
                Ok(Self::new(host, parse_port(port, addr)?))
            }
            _ => Ok(Self::new(addr, default_port)),
        }
    }

    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Resolves to the first address the resolver returns.
    pub async fn resolve(&self, within: Duration) -> Result<SocketAddr, ClientError> {
        let lookup = lookup_host((self.host.as_str(), self.port));
        let mut addrs = match timeout(within, lookup).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                return Err(ClientError::Connection(format!(
                    "cannot resolve {}: {}",
                    self.host, e
                )))
            }
            Err(_) => {
                return Err(ClientError::Timeout(format!("resolving {}", self.host)));
            }
        };
        addrs
            .next()
            .ok_or_else(|| ClientError::Connection(format!("{} has no addresses", self.host)))
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16, ClientError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ClientError::Address(format!("bad port in {:?}", addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_forms() {
        assert_eq!(
            Endpoint::parse("speaker.local", 5000).unwrap(),
            Endpoint::new("speaker.local", 5000)
        );
        assert_eq!(
            Endpoint::parse("10.0.0.2:7000", 5000).unwrap(),
            Endpoint::new("10.0.0.2", 7000)
        );
        assert_eq!(
            Endpoint::parse("[::1]:7000", 5000).unwrap(),
            Endpoint::new("::1", 7000)
        );
        assert_eq!(Endpoint::parse("[::1]", 5000).unwrap().port, 5000);
        assert_eq!(Endpoint::parse("fe80::1", 5000).unwrap().host, "fe80::1");
    }

    #[test]
    fn bad_addresses() {
        for addr in ["", "host:", "host:99999", ":5000", "[::1", "[::1]x"] {
            assert!(
                matches!(Endpoint::parse(addr, 5000), Err(ClientError::Address(_))),
                "{addr:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn resolves_loopback() {
        let addr = Endpoint::parse("127.0.0.1:6553", 5000)
            .unwrap()
            .resolve(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:6553".parse().unwrap());
    }
}
