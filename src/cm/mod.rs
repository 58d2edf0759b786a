//! RDMA connection manager transport.
//!
//! Connections are set up with the synchronous `rdma_cm` endpoint API. Each
//! connection has one RC queue pair with separate send and receive completion
//! queues, all owned by its connection identifier and torn down with it.

mod addrinfo;
mod id;
mod qp;

use std::io;

use self::addrinfo::AddrInfo;
use self::id::CmId;
pub use self::qp::{CmMr, CmQp};
use crate::channel::{create_communicator_with, RdmaChannel};
use crate::config::ChannelConfig;
use crate::endpoint::{EndpointAddr, EndpointDescriptor};
use crate::error::Result;
use crate::rdma::caps::QpCaps;
use crate::transport::{Listener, Provider};

/// Transport over RDMA hardware, driven through `librdmacm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmProvider;

/// A listening RDMA connection manager identifier.
pub struct CmListener {
    id: CmId,
}

impl Listener for CmListener {
    type Qp = CmQp;

    fn accept(&self) -> io::Result<CmQp> {
        let id = self.id.get_request()?;
        id.accept()?;
        id.set_event_nonblocking()?;
        Ok(CmQp::new(id))
    }
}

impl Provider for CmProvider {
    type Qp = CmQp;
    type Listener = CmListener;

    fn listen(&self, addr: &EndpointAddr, caps: &QpCaps, backlog: i32) -> io::Result<CmListener> {
        let info = AddrInfo::get(addr, true)?;
        let id = CmId::create_ep(&info, caps)?;
        id.listen(backlog)?;
        Ok(CmListener { id })
    }

    fn connect(&self, addr: &EndpointAddr, caps: &QpCaps) -> io::Result<CmQp> {
        let info = AddrInfo::get(addr, false)?;
        let id = CmId::create_ep(&info, caps)?;
        id.connect()?;
        id.set_event_nonblocking()?;
        Ok(CmQp::new(id))
    }
}

/// A communicator over RDMA hardware.
pub type CmChannel = RdmaChannel<CmProvider>;

impl RdmaChannel<CmProvider> {
    /// Create an unconnected channel for `host:port` with the default
    /// configuration.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_config(host, port, ChannelConfig::default())
    }

    /// Create an unconnected channel for `host:port`.
    pub fn with_config(host: &str, port: u16, config: ChannelConfig) -> Result<Self> {
        Self::open(CmProvider, host, port, config)
    }

    /// Create an unconnected channel from a `scheme://host:port` URI with the
    /// default configuration.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::open_uri(CmProvider, uri, ChannelConfig::default())
    }
}

/// Create an unconnected hardware channel for the endpoint named by `desc`.
pub fn create_communicator(desc: &dyn EndpointDescriptor) -> Result<CmChannel> {
    create_communicator_with(CmProvider, desc, ChannelConfig::default())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::channel::{ChannelState, Communicator};
    use crate::endpoint::Endpoint;

    #[test]
    fn test_construct() {
        let ch = CmChannel::new("127.0.0.1", 18515).unwrap();
        assert_eq!(ch.state(), ChannelState::Unconnected);
        let ch = CmChannel::from_uri("rdma://127.0.0.1:18516").unwrap();
        assert_eq!(ch.addr().port(), 18516);
        let ch = create_communicator(&Endpoint::new("localhost", 18517)).unwrap();
        assert_eq!(ch.addr().port(), 18517);
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn test_ping() -> anyhow::Result<()> {
        let mut server = CmChannel::new("0.0.0.0", 18515)?;
        server.serve()?;

        let client = thread::spawn(|| -> anyhow::Result<()> {
            let mut client = CmChannel::new("127.0.0.1", 18515)?;
            client.connect()?;
            assert_eq!(client.write(b"PING")?, 4);

            let mut buf = vec![0u8; 4096];
            let n = client.read(&mut buf)?;
            assert_eq!(&buf[..n], &[0xab; 1024][..]);
            client.close()?;
            Ok(())
        });

        let mut conn = server.accept()?;
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf)?;
        assert_eq!(&buf[..n], b"PING");
        assert_eq!(conn.write(&[0xab; 1024])?, 1024);

        client.join().unwrap()?;
        Ok(())
    }
}
