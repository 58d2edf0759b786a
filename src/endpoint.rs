//! Endpoint descriptors and address resolution.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;
use std::{fmt, io};

use regex::Regex;

use crate::error::{Error, Result};

/// Anything that names a remote or local endpoint by host and port.
///
/// This is what a framework hands to
/// [`create_communicator_with`](crate::channel::create_communicator_with).
pub trait EndpointDescriptor {
    /// Host name or numeric address.
    fn address(&self) -> &str;

    /// Port number.
    fn port(&self) -> u16;
}

/// A plain host-port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl EndpointDescriptor for Endpoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// A `scheme://host:port` locator, split but not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn uri_regex() -> &'static Regex {
    static URI: OnceLock<Regex> = OnceLock::new();
    URI.get_or_init(|| {
        Regex::new(
            r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?:\[(?P<v6>[0-9A-Fa-f:.]+)\]|(?P<host>[^:/\[\]]+)):(?P<port>\d{1,5})/?$",
        )
        .expect("invalid regex pattern")
    })
}

impl Uri {
    /// Split a URI into its parts.
    ///
    /// IPv6 literals must be enclosed in brackets, e.g. `rdma://[::1]:18515`.
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::Resolution {
            host: uri.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_owned()),
        };

        let caps = uri_regex()
            .captures(uri.trim())
            .ok_or_else(|| malformed("malformed endpoint URI"))?;
        let host = caps
            .name("v6")
            .or_else(|| caps.name("host"))
            .map(|m| m.as_str().to_owned())
            .ok_or_else(|| malformed("missing host"))?;
        let port = caps["port"]
            .parse::<u16>()
            .map_err(|_| malformed("port out of range"))?;

        Ok(Self {
            scheme: caps["scheme"].to_owned(),
            host,
            port,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// A resolved endpoint address.
///
/// Immutable once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    ip: IpAddr,
    port: u16,
}

impl EndpointAddr {
    /// Resolve a host name through the system resolver.
    ///
    /// The first IPv4 result wins; the first result of any family is taken
    /// if there is no IPv4 address. No retries.
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        let resolution = |source| Error::Resolution {
            host: host.to_owned(),
            source,
        };

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(resolution)?
            .collect::<Vec<_>>();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .ok_or_else(|| {
                resolution(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no address associated with host",
                ))
            })?;

        log::debug!("rrcomm: resolved {}:{} to {}", host, port, addr);
        Ok(Self::from(*addr))
    }

    /// Parse and resolve a `scheme://host:port` URI. The scheme is not
    /// interpreted.
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let uri = Uri::parse(uri)?;
        Self::resolve(&uri.host, uri.port)
    }

    /// Resolve the address named by a descriptor.
    pub fn from_descriptor(desc: &dyn EndpointDescriptor) -> Result<Self> {
        Self::resolve(desc.address(), desc.port())
    }

    /// Get the IP address.
    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Get the port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the raw address bytes, in network order.
    pub fn octets(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    /// Get the length of the raw address, i.e., 4 or 16.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self.ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    /// Get the address as a socket address.
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_resolve_numeric() {
        let addr = EndpointAddr::resolve("127.0.0.1", 18515).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port(), 18515);
        assert_eq!(addr.len(), 4);
        assert_eq!(addr.octets(), vec![127, 0, 0, 1]);
        assert_eq!(addr.to_string(), "127.0.0.1:18515");

        let any = EndpointAddr::resolve("0.0.0.0", 18515).unwrap();
        assert!(any.ip().is_unspecified());
    }

    #[test]
    fn test_resolve_name() {
        let addr = EndpointAddr::resolve("localhost", 7).unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_failure() {
        match EndpointAddr::resolve("no-such-host.invalid", 18515) {
            Err(Error::Resolution { host, .. }) => assert_eq!(host, "no-such-host.invalid"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_uri() {
        let uri = Uri::parse("rdma://10.0.0.1:18515").unwrap();
        assert_eq!(uri.scheme, "rdma");
        assert_eq!(uri.host, "10.0.0.1");
        assert_eq!(uri.port, 18515);
        assert_eq!(uri.to_string(), "rdma://10.0.0.1:18515");

        let uri = Uri::parse("rdma://[::1]:9999/").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.to_string(), "rdma://[::1]:9999");

        let addr = EndpointAddr::parse_uri("ib://[::1]:9999").unwrap();
        assert_eq!(addr.len(), 16);
        assert_eq!(addr.to_string(), "[::1]:9999");

        for bad in [
            "10.0.0.1:18515",
            "rdma://10.0.0.1",
            "rdma://10.0.0.1:99999",
            "rdma://:18515",
            "rdma://::1:18515",
        ] {
            assert!(
                matches!(Uri::parse(bad), Err(Error::Resolution { .. })),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_descriptor() {
        let desc = Endpoint::new("127.0.0.1", 1234);
        let addr = EndpointAddr::from_descriptor(&desc).unwrap();
        assert_eq!(addr.port(), 1234);
    }
}
