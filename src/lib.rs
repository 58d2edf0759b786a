//! A point-to-point communicator over RDMA reliable connections.
//!
//! `rrcomm` implements a simple channel abstraction ([`Communicator`]) with
//! listen/accept, connect, whole-message read and write, and close, on top of
//! the RDMA connection manager (`librdmacm`) and verbs (`libibverbs`).
//!
//! Every channel owns exactly one RC queue pair with one outstanding work
//! request per direction. Each read or write registers the user buffer, posts
//! one signaled work request and busy-polls for its completion, so a call
//! returns only once the transfer is complete. Short writes are posted inline
//! when the device supports it.
//!
//! The hardware transport ([`cm::CmProvider`]) is only built when
//! `libibverbs` and `librdmacm` are found. The in-process
//! [`loopback::LoopbackFabric`] transport is always available and behaves
//! like a pair of connected RC queue pairs.
//!
//! # Example
//!
//! ```rust
//! use std::thread;
//! use rrcomm::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = LoopbackFabric::new();
//!
//!     let mut server = RdmaChannel::open(fabric.clone(), "0.0.0.0", 18515, Default::default())?;
//!     server.serve()?;
//!
//!     let client = thread::spawn(move || -> rrcomm::Result<()> {
//!         let mut client = RdmaChannel::open(fabric, "127.0.0.1", 18515, Default::default())?;
//!         client.connect()?;
//!         client.write(b"PING")?;
//!         client.close()
//!     });
//!
//!     let mut conn = server.accept()?;
//!     let mut buf = [0u8; 16];
//!     let n = conn.read(&mut buf)?;
//!     assert_eq!(&buf[..n], b"PING");
//!
//!     client.join().unwrap()?;
//!     Ok(())
//! }
//! ```

#[cfg(rdma_core)]
mod bindings;

#[cfg(rdma_core)]
#[macro_use]
mod utils;

mod rdma;
pub use rdma::caps::{NegotiatedCaps, QpCaps};
pub use rdma::mr::{Permission, Sge};
pub use rdma::type_alias::*;
pub use rdma::wc::{Wc, WcOpcode, WcStatus};

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod loopback;
pub mod transport;

mod transfer;

#[cfg(rdma_core)]
pub mod cm;

pub mod prelude;

pub use channel::{create_communicator_with, ChannelState, Communicator, RdmaChannel};
#[cfg(rdma_core)]
pub use cm::{create_communicator, CmChannel, CmProvider};
pub use config::ChannelConfig;
pub use endpoint::{Endpoint, EndpointAddr, EndpointDescriptor};
pub use error::{Error, Result};
