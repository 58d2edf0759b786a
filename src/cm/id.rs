use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use super::addrinfo::AddrInfo;
use crate::bindings::*;
use crate::rdma::caps::QpCaps;
use crate::utils::interop::*;

/// An acknowledged-on-drop connection manager event.
struct CmEvent(NonNull<rdma_cm_event>);

impl_raw_wrapper_traits!(rdma_cm_event, CmEvent);

impl CmEvent {
    fn ty(&self) -> rdma_cm_event_type::Type {
        // SAFETY: the event is valid until acknowledged.
        unsafe { (*self.as_raw()).event }
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        let ret = unsafe { rdma_ack_cm_event(self.as_raw()) };
        if ret != 0 {
            log::error!("rrcomm: cannot ack CM event: {}", io::Error::last_os_error());
        }
    }
}

/// Owned RDMA connection manager identifier, created by `rdma_create_ep`
/// (or `rdma_get_request`) and destroyed by `rdma_destroy_ep`.
///
/// The identifier owns its queue pair and completion queues, if any.
pub(crate) struct CmId(NonNull<rdma_cm_id>);

impl_raw_wrapper_traits!(rdma_cm_id, CmId);

impl CmId {
    /// Create a synchronous endpoint with an RC queue pair of the given
    /// capabilities, on the device's default protection domain. Every send
    /// work request is signaled.
    ///
    /// For a passive `info`, no queue pair is created now; connections
    /// obtained by [`get_request`](Self::get_request) get one instead.
    pub fn create_ep(info: &AddrInfo, caps: &QpCaps) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.cap = ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: caps.max_inline_data,
        };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 1;

        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_create_ep(&mut id, info.as_raw(), ptr::null_mut(), &mut init_attr) };
        from_c_ret_errno(ret)?;
        NonNull::new(id)
            .map(Self)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }

    /// Start listening for connection requests.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(self.as_raw(), backlog) };
        from_c_ret_errno(ret)
    }

    /// Block until a connection request arrives on this listening identifier.
    pub fn get_request(&self) -> io::Result<CmId> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_request(self.as_raw(), &mut id) };
        from_c_ret_errno(ret)?;
        NonNull::new(id)
            .map(Self)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }

    /// Accept the connection request. Blocks until established.
    pub fn accept(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_accept(self.as_raw(), ptr::null_mut()) };
        from_c_ret_errno(ret)
    }

    /// Connect to the resolved remote address. Blocks until established.
    pub fn connect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_connect(self.as_raw(), ptr::null_mut()) };
        from_c_ret_errno(ret)
    }

    /// Disconnect, moving the queue pair to the error state.
    ///
    /// On a non-blocking event channel the disconnect event may not have
    /// arrived yet, which is not an error.
    pub fn disconnect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_disconnect(self.as_raw()) };
        match from_c_ret_errno(ret) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            ret => ret,
        }
    }

    /// Get the queue pair.
    pub fn qp(&self) -> io::Result<*mut ibv_qp> {
        // SAFETY: the identifier is valid.
        let qp = unsafe { (*self.as_raw()).qp };
        if qp.is_null() {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        } else {
            Ok(qp)
        }
    }

    /// Get the protection domain of the queue pair.
    pub fn pd(&self) -> *mut ibv_pd {
        // SAFETY: the identifier is valid.
        unsafe { (*self.as_raw()).pd }
    }

    /// Get the send completion queue.
    pub fn send_cq(&self) -> *mut ibv_cq {
        // SAFETY: the identifier is valid.
        unsafe { (*self.as_raw()).send_cq }
    }

    /// Get the receive completion queue.
    pub fn recv_cq(&self) -> *mut ibv_cq {
        // SAFETY: the identifier is valid.
        unsafe { (*self.as_raw()).recv_cq }
    }

    /// Query the actual capabilities of the queue pair.
    pub fn query_caps(&self) -> io::Result<QpCaps> {
        let qp = self.qp()?;
        // SAFETY: POD types.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };

        // SAFETY: FFI.
        let ret = unsafe {
            ibv_query_qp(
                qp,
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_CAP.0 as i32,
                &mut init_attr,
            )
        };
        from_c_ret(ret)?;

        let cap = init_attr.cap;
        Ok(QpCaps {
            max_send_wr: cap.max_send_wr,
            max_recv_wr: cap.max_recv_wr,
            max_send_sge: cap.max_send_sge,
            max_recv_sge: cap.max_recv_sge,
            max_inline_data: cap.max_inline_data,
        })
    }

    fn event_channel(&self) -> io::Result<*mut rdma_event_channel> {
        // SAFETY: the identifier is valid.
        let channel = unsafe { (*self.as_raw()).channel };
        if channel.is_null() {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        } else {
            Ok(channel)
        }
    }

    /// Make [`poll_event`](Self::poll_event) non-blocking.
    ///
    /// Must only be called after the connection is established, since the
    /// blocking handshake calls read the same channel.
    pub fn set_event_nonblocking(&self) -> io::Result<()> {
        // SAFETY: the channel is valid as long as the identifier is.
        let fd = unsafe { (*self.event_channel()?).fd };

        // SAFETY: FFI.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: FFI.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Fetch and acknowledge the next connection manager event, if any.
    pub fn poll_event(&self) -> io::Result<Option<rdma_cm_event_type::Type>> {
        let channel = self.event_channel()?;
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_cm_event(channel, &mut event) };
        match from_c_ret_errno(ret) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }

        let event = NonNull::new(event)
            .map(CmEvent)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(Some(event.ty()))
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { rdma_destroy_ep(self.as_raw()) };
    }
}
