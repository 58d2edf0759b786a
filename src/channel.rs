//! The communicator abstraction and its RDMA implementation.

use std::{fmt, mem};

use crate::config::ChannelConfig;
use crate::endpoint::{EndpointAddr, EndpointDescriptor};
use crate::error::{Error, Result, TransferError};
use crate::rdma::caps::{NegotiatedCaps, QpCaps};
use crate::transfer::TransferEngine;
use crate::transport::{Listener, Provider, QueuePair};

/// A bidirectional point-to-point communication channel.
///
/// A server calls [`serve`](Communicator::serve) once, then
/// [`accept`](Communicator::accept) to obtain a connected channel per client.
/// A client calls [`connect`](Communicator::connect). Connected channels
/// exchange whole messages with [`read`](Communicator::read) and
/// [`write`](Communicator::write); every call blocks until it completes.
pub trait Communicator: Sized {
    /// Bind to the local address and start listening.
    fn serve(&mut self) -> Result<()>;

    /// Wait for an incoming connection and return it as a new channel. This
    /// channel keeps listening.
    fn accept(&mut self) -> Result<Self>;

    /// Connect to the remote address.
    fn connect(&mut self) -> Result<()>;

    /// Tear down the channel. Closing a closed channel does nothing.
    fn close(&mut self) -> Result<()>;

    /// Receive one message into `buf`. Return the number of bytes received.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send `buf` as one message. Return the number of bytes sent.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush pending output. Every write is complete when it returns, so there
    /// is nothing to flush.
    fn sync(&mut self) -> Result<()>;
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Listening,
    Connecting,
    Connected,
    Closed,
    /// The memory of an in-flight transfer could not be reclaimed. The
    /// channel can only be closed.
    Broken,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Unconnected => "unconnected",
            ChannelState::Listening => "listening",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
            ChannelState::Broken => "broken",
        };
        f.write_str(s)
    }
}

enum Link<P: Provider> {
    None,
    Listening(P::Listener),
    Connected { qp: P::Qp, caps: NegotiatedCaps },
}

/// A communicator over one RC queue pair.
///
/// The channel owns its connection: dropping it closes the connection, and
/// nothing else ever destroys the underlying resources.
pub struct RdmaChannel<P: Provider> {
    provider: P,
    addr: EndpointAddr,
    config: ChannelConfig,
    state: ChannelState,
    link: Link<P>,
    engine: TransferEngine,
}

impl<P: Provider> RdmaChannel<P> {
    /// Create an unconnected channel for an already resolved address.
    pub fn with_provider(provider: P, addr: EndpointAddr, config: ChannelConfig) -> Self {
        let engine = TransferEngine::new(&config);
        Self {
            provider,
            addr,
            config,
            state: ChannelState::Unconnected,
            link: Link::None,
            engine,
        }
    }

    /// Resolve `host` and create an unconnected channel for it.
    pub fn open(provider: P, host: &str, port: u16, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let addr = EndpointAddr::resolve(host, port)?;
        Ok(Self::with_provider(provider, addr, config))
    }

    /// Resolve a `scheme://host:port` URI and create an unconnected channel
    /// for it.
    pub fn open_uri(provider: P, uri: &str, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let addr = EndpointAddr::parse_uri(uri)?;
        Ok(Self::with_provider(provider, addr, config))
    }

    /// Get the current lifecycle state.
    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Get the address this channel listens on or connects to.
    #[inline]
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Get the negotiated capabilities of a connected channel.
    pub fn caps(&self) -> Option<&NegotiatedCaps> {
        match &self.link {
            Link::Connected { caps, .. } => Some(caps),
            _ => None,
        }
    }

    fn expect_state(&self, op: &'static str, expected: ChannelState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Query the capabilities of a freshly connected queue pair.
    fn negotiate(&self, qp: &P::Qp) -> std::io::Result<NegotiatedCaps> {
        let actual = qp.query_caps()?;
        Ok(NegotiatedCaps::negotiate(actual, self.config.max_inline_data))
    }

    /// Turn a transfer outcome into the channel's result, marking the
    /// channel broken if its in-flight memory had to be leaked.
    fn settle(&mut self, ret: Result<usize, TransferError>) -> Result<usize> {
        ret.map_err(|e| {
            if e.is_fatal() {
                log::error!("rrcomm: channel to {} is broken: {}", self.addr, e);
                self.state = ChannelState::Broken;
            }
            Error::Transfer(e)
        })
    }
}

impl<P: Provider> Communicator for RdmaChannel<P> {
    fn serve(&mut self) -> Result<()> {
        self.expect_state("serve", ChannelState::Unconnected)?;

        let caps = QpCaps::requested(&self.config);
        let listener = self
            .provider
            .listen(&self.addr, &caps, self.config.backlog)
            .map_err(Error::Bind)?;

        self.link = Link::Listening(listener);
        self.state = ChannelState::Listening;
        log::debug!("rrcomm: listening on {}", self.addr);
        Ok(())
    }

    fn accept(&mut self) -> Result<Self> {
        self.expect_state("accept", ChannelState::Listening)?;
        let Link::Listening(listener) = &self.link else {
            return Err(Error::InvalidState {
                op: "accept",
                state: self.state,
            });
        };

        let qp = listener.accept().map_err(Error::Accept)?;
        let caps = self.negotiate(&qp).map_err(Error::Accept)?;
        log::debug!("rrcomm: accepted connection on {}", self.addr);

        Ok(Self {
            provider: self.provider.clone(),
            addr: self.addr,
            config: self.config.clone(),
            state: ChannelState::Connected,
            link: Link::Connected { qp, caps },
            engine: TransferEngine::new(&self.config),
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.expect_state("connect", ChannelState::Unconnected)?;
        self.state = ChannelState::Connecting;

        let caps = QpCaps::requested(&self.config);
        let established = self
            .provider
            .connect(&self.addr, &caps)
            .and_then(|qp| self.negotiate(&qp).map(|caps| (qp, caps)));
        match established {
            Ok((qp, caps)) => {
                self.link = Link::Connected { qp, caps };
                self.state = ChannelState::Connected;
                log::debug!("rrcomm: connected to {}", self.addr);
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Unconnected;
                Err(Error::Connect(e))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }

        let prev = mem::replace(&mut self.state, ChannelState::Closed);
        let ret = match mem::replace(&mut self.link, Link::None) {
            Link::Connected { mut qp, .. } => qp.disconnect().map_err(Error::Disconnect),
            Link::Listening(_) | Link::None => Ok(()),
        };
        log::debug!("rrcomm: closed {} channel on {}", prev, self.addr);
        ret
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.expect_state("read", ChannelState::Connected)?;
        let ret = match &self.link {
            Link::Connected { qp, .. } => self.engine.read(qp, buf),
            _ => {
                return Err(Error::InvalidState {
                    op: "read",
                    state: self.state,
                })
            }
        };
        self.settle(ret)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.expect_state("write", ChannelState::Connected)?;
        let ret = match &self.link {
            Link::Connected { qp, caps } => self.engine.write(qp, caps, buf),
            _ => {
                return Err(Error::InvalidState {
                    op: "write",
                    state: self.state,
                })
            }
        };
        self.settle(ret)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Provider> Drop for RdmaChannel<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("rrcomm: failed to close channel on {}: {}", self.addr, e);
        }
    }
}

impl<P: Provider> fmt::Debug for RdmaChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaChannel")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("caps", &self.caps())
            .finish()
    }
}

/// Create an unconnected channel for the endpoint named by `desc`.
pub fn create_communicator_with<P: Provider>(
    provider: P,
    desc: &dyn EndpointDescriptor,
    config: ChannelConfig,
) -> Result<RdmaChannel<P>> {
    RdmaChannel::open(provider, desc.address(), desc.port(), config)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::endpoint::Endpoint;
    use crate::loopback::LoopbackFabric;

    fn channel(fabric: &LoopbackFabric, port: u16) -> RdmaChannel<LoopbackFabric> {
        RdmaChannel::open(fabric.clone(), "127.0.0.1", port, ChannelConfig::default()).unwrap()
    }

    #[test]
    fn test_guards_touch_nothing() {
        let fabric = LoopbackFabric::new();
        let mut ch = channel(&fabric, 1);
        let mut buf = [0u8; 4];

        assert!(matches!(
            ch.read(&mut buf),
            Err(Error::InvalidState {
                op: "read",
                state: ChannelState::Unconnected
            })
        ));
        assert!(matches!(ch.write(b"PING"), Err(Error::InvalidState { .. })));
        assert!(matches!(ch.accept(), Err(Error::InvalidState { .. })));
        assert!(ch.caps().is_none());
        assert_eq!(fabric.hardware_ops(), 0);

        ch.serve().unwrap();
        let ops = fabric.hardware_ops();
        assert!(matches!(
            ch.read(&mut buf),
            Err(Error::InvalidState {
                state: ChannelState::Listening,
                ..
            })
        ));
        assert!(matches!(ch.serve(), Err(Error::InvalidState { .. })));
        assert!(matches!(ch.connect(), Err(Error::InvalidState { .. })));
        assert_eq!(fabric.hardware_ops(), ops);
    }

    #[test]
    fn test_connect_refused() {
        let fabric = LoopbackFabric::new();
        let mut ch = channel(&fabric, 2);
        assert!(matches!(ch.connect(), Err(Error::Connect(_))));
        assert_eq!(ch.state(), ChannelState::Unconnected);
    }

    #[test]
    fn test_port_in_use() {
        let fabric = LoopbackFabric::new();
        let mut first = channel(&fabric, 6);
        first.serve().unwrap();

        let mut second = channel(&fabric, 6);
        assert!(matches!(second.serve(), Err(Error::Bind(_))));
        assert_eq!(second.state(), ChannelState::Unconnected);
    }

    #[test]
    fn test_accept_failure_keeps_listening() {
        let fabric = LoopbackFabric::new();
        let mut server = channel(&fabric, 7);
        server.serve().unwrap();

        // A client that gives up leaves a stale request behind.
        let impatient = fabric.clone().with_connect_timeout(Duration::from_millis(10));
        let mut client = RdmaChannel::open(impatient, "127.0.0.1", 7, ChannelConfig::default()).unwrap();
        assert!(matches!(client.connect(), Err(Error::Connect(_))));
        assert_eq!(client.state(), ChannelState::Unconnected);

        assert!(matches!(server.accept(), Err(Error::Accept(_))));
        assert_eq!(server.state(), ChannelState::Listening);

        let client = {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let mut client = channel(&fabric, 7);
                client.connect().unwrap();
                client.write(b"PING").unwrap();
                client
            })
        };
        let mut conn = server.accept().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"PING");
        drop(client.join().unwrap());
    }

    #[test]
    fn test_close_idempotent() {
        let fabric = LoopbackFabric::new();
        let mut ch = channel(&fabric, 3);
        ch.serve().unwrap();
        ch.close().unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        ch.close().unwrap();
        assert!(matches!(
            ch.write(b"x"),
            Err(Error::InvalidState {
                state: ChannelState::Closed,
                ..
            })
        ));

        // The port is free again.
        let mut ch = channel(&fabric, 3);
        ch.serve().unwrap();
    }

    #[test]
    fn test_sync_noop() {
        let fabric = LoopbackFabric::new();
        let mut ch = channel(&fabric, 4);
        ch.sync().unwrap();
        assert_eq!(fabric.hardware_ops(), 0);
    }

    #[test]
    fn test_factory() {
        let fabric = LoopbackFabric::new();
        let ch = create_communicator_with(
            fabric.clone(),
            &Endpoint::new("localhost", 5),
            ChannelConfig::default(),
        )
        .unwrap();
        assert_eq!(ch.addr().port(), 5);
        assert_eq!(ch.state(), ChannelState::Unconnected);

        let err = create_communicator_with(
            fabric,
            &Endpoint::new("no-such-host.invalid", 5),
            ChannelConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }
}
