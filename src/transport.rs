//! The seam between the channel facade and a concrete RDMA transport.
//!
//! [`cm::CmProvider`](crate::cm::CmProvider) drives real hardware through the
//! RDMA connection manager; [`loopback::LoopbackFabric`](crate::loopback::LoopbackFabric)
//! emulates an RC queue pair in-process.

use std::io;

use crate::endpoint::EndpointAddr;
use crate::rdma::caps::QpCaps;
use crate::rdma::mr::{Permission, Sge};
use crate::rdma::type_alias::{LKey, WrId};
use crate::rdma::wc::Wc;

/// A registered memory region.
///
/// Dropping it deregisters the memory.
pub trait MemoryRegion {
    /// Get the local key.
    fn lkey(&self) -> LKey;

    /// Get the start address of the region.
    fn addr(&self) -> *mut u8;

    /// Get the length of the region.
    fn len(&self) -> usize;

    /// Get a scatter-gather entry that covers the whole region.
    ///
    /// Fails with `EINVAL` if the region is longer than a scatter-gather
    /// entry can describe.
    fn sge(&self) -> io::Result<Sge> {
        let length = u32::try_from(self.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(Sge {
            addr: self.addr() as u64,
            length,
            lkey: self.lkey(),
        })
    }
}

/// A connected reliable queue pair with its own send and receive completion
/// queues.
pub trait QueuePair: Send {
    /// Memory region type registered on this queue pair's protection domain.
    type Mr<'a>: MemoryRegion
    where
        Self: 'a;

    /// Query the actual capabilities of the queue pair.
    fn query_caps(&self) -> io::Result<QpCaps>;

    /// Register a memory area.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must stay valid for the lifetime of the returned
    /// region, and must not be accessed in a conflicting way while a work
    /// request referring to it is in flight.
    unsafe fn reg_mr<'a>(&'a self, addr: *mut u8, len: usize, perm: Permission)
        -> io::Result<Self::Mr<'a>>;

    /// Post a signaled send work request. `None` posts a zero-length send.
    ///
    /// # Safety
    ///
    /// The memory referenced by `sge` must stay registered and untouched
    /// until the completion of this work request is polled.
    unsafe fn post_send(&self, sge: Option<Sge>, wr_id: WrId, inline: bool) -> io::Result<()>;

    /// Post a receive work request. `None` posts a zero-length receive.
    ///
    /// # Safety
    ///
    /// The memory referenced by `sge` must stay registered and must not be
    /// accessed until the completion of this work request is polled.
    unsafe fn post_recv(&self, sge: Option<Sge>, wr_id: WrId) -> io::Result<()>;

    /// Non-blockingly poll one completion from the send completion queue.
    fn poll_send(&self) -> io::Result<Option<Wc>>;

    /// Non-blockingly poll one completion from the receive completion queue.
    fn poll_recv(&self) -> io::Result<Option<Wc>>;

    /// Check whether the peer is still there, and make outstanding work
    /// requests fail with a flush error if it is not.
    fn check_peer(&self) -> io::Result<()>;

    /// Disconnect from the peer. Outstanding work requests are flushed.
    fn disconnect(&mut self) -> io::Result<()>;
}

/// A listening endpoint.
pub trait Listener: Send {
    type Qp: QueuePair;

    /// Block until a connection request arrives and accept it.
    fn accept(&self) -> io::Result<Self::Qp>;
}

/// A factory of listening endpoints and connected queue pairs.
pub trait Provider: Clone + Send {
    type Qp: QueuePair;
    type Listener: Listener<Qp = Self::Qp>;

    /// Bind to `addr` and start listening.
    fn listen(&self, addr: &EndpointAddr, caps: &QpCaps, backlog: i32)
        -> io::Result<Self::Listener>;

    /// Connect to the listener at `addr`. Blocks until the connection is
    /// established or rejected.
    fn connect(&self, addr: &EndpointAddr, caps: &QpCaps) -> io::Result<Self::Qp>;
}
