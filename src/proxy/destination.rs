//! Destination parsing for CONNECT targets and `Host` headers.

use std::fmt;

use super::error::ProxyError;

/// Port assumed when a target names no port.
pub const DEFAULT_PORT: u16 = 443;

/// Host and port of the real destination behind a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Hostname or IP address, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Destination {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    ///
    /// Examples:
    /// - `api.example.com:443` -> ("api.example.com", 443)
    /// - `api.example.com` -> ("api.example.com", 443) (default port)
    pub fn parse(authority: &str) -> Result<Self, ProxyError> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(ProxyError::InvalidConnect("empty destination".into()));
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                ProxyError::InvalidConnect(format!("Unterminated IPv6 address: {}", authority))
            })?;
            let port = match after {
                "" => DEFAULT_PORT,
                _ => {
                    let port_str = after.strip_prefix(':').ok_or_else(|| {
                        ProxyError::InvalidConnect(format!("Invalid destination: {}", authority))
                    })?;
                    parse_port(port_str)?
                }
            };
            return Self::checked(host, port);
        }

        match authority.rsplit_once(':') {
            Some((host, port_str)) => Self::checked(host, parse_port(port_str)?),
            None => Self::checked(authority, DEFAULT_PORT),
        }
    }

    fn checked(host: &str, port: u16) -> Result<Self, ProxyError> {
        if host.is_empty() || host.contains(['/', ' ', '@']) {
            return Err(ProxyError::InvalidConnect(format!("Invalid host: {:?}", host)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(port_str: &str) -> Result<u16, ProxyError> {
    port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))
}

impl fmt::Display for Destination {
    /// `host:port`, bracketing IPv6 addresses. Always includes the port.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let dest = Destination::parse("api.example.com:443").unwrap();
        assert_eq!(dest.host, "api.example.com");
        assert_eq!(dest.port, 443);
    }

    #[test]
    fn test_parse_host_port_custom_port() {
        let dest = Destination::parse("api.example.com:8448").unwrap();
        assert_eq!(dest.port, 8448);
    }

    #[test]
    fn test_parse_host_port_default() {
        let dest = Destination::parse("api.example.com").unwrap();
        assert_eq!(dest.port, 443);
        assert_eq!(dest.to_string(), "api.example.com:443");
    }

    #[test]
    fn test_parse_host_port_invalid() {
        assert!(Destination::parse("api.example.com:invalid").is_err());
        assert!(Destination::parse("api.example.com:70000").is_err());
        assert!(Destination::parse(":443").is_err());
        assert!(Destination::parse("").is_err());
        assert!(Destination::parse("[::1").is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let dest = Destination::parse("[::1]:8443").unwrap();
        assert_eq!(dest.host, "::1");
        assert_eq!(dest.port, 8443);
        assert_eq!(dest.to_string(), "[::1]:8443");

        let dest = Destination::parse("[::1]").unwrap();
        assert_eq!(dest.port, 443);
    }
}
