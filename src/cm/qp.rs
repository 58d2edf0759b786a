use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use super::id::CmId;
use crate::bindings::*;
use crate::rdma::caps::QpCaps;
use crate::rdma::mr::{Permission, Sge};
use crate::rdma::type_alias::{LKey, WrId};
use crate::rdma::wc::{Wc, WcOpcode, WcStatus};
use crate::transport::{MemoryRegion, QueuePair};
use crate::utils::interop::*;

/// Memory region registered on the protection domain of a [`CmQp`].
///
/// The registered memory itself does not belong to this type, but it must
/// outlive it.
pub struct CmMr<'a> {
    mr: NonNull<ibv_mr>,
    _marker: PhantomData<&'a CmQp>,
}

impl MemoryRegion for CmMr<'_> {
    fn lkey(&self) -> LKey {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    fn addr(&self) -> *mut u8 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).addr as *mut u8 }
    }

    fn len(&self) -> usize {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).length }
    }
}

impl Drop for CmMr<'_> {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        let ret = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("rrcomm: cannot dereg MR on drop: {}", e);
        }
    }
}

/// A connected RC queue pair owned by an RDMA CM identifier.
pub struct CmQp {
    id: CmId,
    disconnected: Cell<bool>,
}

impl CmQp {
    pub(crate) fn new(id: CmId) -> Self {
        Self {
            id,
            disconnected: Cell::new(false),
        }
    }

    fn send_err_explanation(ret: i32) -> Option<&'static str> {
        match ret {
            libc::EINVAL => Some("invalid work request"),
            libc::ENOMEM => {
                Some("send queue is full, or not enough resources to complete this operation")
            }
            libc::EFAULT => Some("invalid QP"),
            _ => None,
        }
    }

    fn recv_err_explanation(ret: i32) -> Option<&'static str> {
        match ret {
            libc::EINVAL => Some("invalid work request"),
            libc::ENOMEM => {
                Some("receive queue is full, or not enough resources to complete this operation")
            }
            libc::EFAULT => Some("invalid QP"),
            _ => None,
        }
    }

    fn poll_cq(cq: *mut ibv_cq) -> io::Result<Option<Wc>> {
        let mut wc = <MaybeUninit<ibv_wc>>::uninit();
        // SAFETY: FFI.
        let num = unsafe { ibv_poll_cq(cq, 1, wc.as_mut_ptr()) };
        match num {
            0 => Ok(None),
            1 => {
                // SAFETY: `ibv_poll_cq` returning 1 means `wc` is initialized.
                let wc = unsafe { wc.assume_init() };
                Ok(Some(Wc::new(
                    wc.wr_id,
                    WcStatus::from_raw(wc.status),
                    WcOpcode::from_raw(wc.opcode),
                    wc.byte_len,
                )))
            }
            n => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {}", n),
            )),
        }
    }
}

fn to_ibv_sge(sge: Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

impl QueuePair for CmQp {
    type Mr<'a> = CmMr<'a> where Self: 'a;

    fn query_caps(&self) -> io::Result<QpCaps> {
        self.id.query_caps()
    }

    unsafe fn reg_mr<'a>(&'a self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<CmMr<'a>> {
        let mr = ibv_reg_mr(self.id.pd(), addr as *mut c_void, len, perm.into());
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        Ok(CmMr {
            mr,
            _marker: PhantomData,
        })
    }

    unsafe fn post_send(&self, sge: Option<Sge>, wr_id: WrId, inline: bool) -> io::Result<()> {
        let mut sge = sge.map(to_ibv_sge);

        let mut send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if inline {
            send_flags |= ibv_send_flags::IBV_SEND_INLINE.0;
        }

        let mut wr = ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: sge.as_mut().map_or(ptr::null_mut(), |sge| sge as *mut _),
            num_sge: sge.is_some() as i32,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags,
            ..mem::zeroed()
        };
        let mut bad_wr = ptr::null_mut();
        let ret = ibv_post_send(self.id.qp()?, &mut wr, &mut bad_wr);
        from_c_ret_explained(ret, Self::send_err_explanation)
    }

    unsafe fn post_recv(&self, sge: Option<Sge>, wr_id: WrId) -> io::Result<()> {
        let mut sge = sge.map(to_ibv_sge);
        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: sge.as_mut().map_or(ptr::null_mut(), |sge| sge as *mut _),
            num_sge: sge.is_some() as i32,
        };
        let mut bad_wr = ptr::null_mut();
        let ret = ibv_post_recv(self.id.qp()?, &mut wr, &mut bad_wr);
        from_c_ret_explained(ret, Self::recv_err_explanation)
    }

    fn poll_send(&self) -> io::Result<Option<Wc>> {
        Self::poll_cq(self.id.send_cq())
    }

    fn poll_recv(&self) -> io::Result<Option<Wc>> {
        Self::poll_cq(self.id.recv_cq())
    }

    fn check_peer(&self) -> io::Result<()> {
        if self.disconnected.get() {
            return Ok(());
        }
        while let Some(event) = self.id.poll_event()? {
            match event {
                rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED
                | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => {
                    log::warn!("rrcomm: peer disconnected, flushing outstanding work requests");
                    // Moves the QP to the error state so that the pending
                    // work request completes with a flush error.
                    self.id.disconnect()?;
                    self.disconnected.set(true);
                    return Ok(());
                }
                other => log::debug!("rrcomm: ignoring CM event {}", other),
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) -> io::Result<()> {
        if self.disconnected.replace(true) {
            return Ok(());
        }
        self.id.disconnect()
    }
}
