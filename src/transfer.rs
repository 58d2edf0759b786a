//! Per-call transfers: register, post one work request, busy-poll its
//! completion.

use std::mem;
#[cfg(feature = "warned_spin")]
use std::time::Duration;

use crate::config::ChannelConfig;
use crate::error::{Direction, TransferError};
use crate::rdma::caps::NegotiatedCaps;
use crate::rdma::mr::Permission;
use crate::rdma::type_alias::WrId;
use crate::rdma::wc::Wc;
use crate::transport::{MemoryRegion, QueuePair};

/// Transfer state of one connection.
///
/// Work request IDs start from 1 and increase by one per posted request, so
/// a completion carrying a smaller ID belongs to an earlier call.
#[derive(Debug)]
pub(crate) struct TransferEngine {
    next_wr_id: WrId,
    peer_check_interval: u32,
    #[cfg(feature = "warned_spin")]
    spin_warn: Duration,
}

impl TransferEngine {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            next_wr_id: 1,
            peer_check_interval: config.peer_check_interval.max(1),
            #[cfg(feature = "warned_spin")]
            spin_warn: Duration::from_secs(config.spin_warn_secs),
        }
    }

    fn fresh_wr_id(&mut self) -> WrId {
        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;
        wr_id
    }

    /// Send the whole `buf` as one message. Return the number of bytes sent.
    pub fn write<Q: QueuePair>(
        &mut self,
        qp: &Q,
        caps: &NegotiatedCaps,
        buf: &[u8],
    ) -> Result<usize, TransferError> {
        check_len(Direction::Send, buf.len())?;
        let wr_id = self.fresh_wr_id();
        let inline = caps.inline_for(buf.len());

        // SAFETY: `buf` is borrowed for the whole call, and the region either
        // outlives the completion or is leaked.
        let mr = if buf.is_empty() {
            None
        } else {
            let mr = unsafe { qp.reg_mr(buf.as_ptr() as *mut u8, buf.len(), Permission::EMPTY) }
                .map_err(|source| TransferError::Register {
                    len: buf.len(),
                    source,
                })?;
            Some(mr)
        };

        let sge = mr.as_ref().map(|mr| mr.sge()).transpose();
        let sge = sge.map_err(|e| TransferError::Post(Direction::Send, e))?;

        // SAFETY: same as above.
        let ret = unsafe { qp.post_send(sge, wr_id, inline) };
        ret.map_err(|e| TransferError::Post(Direction::Send, e))?;

        self.wait(qp, Direction::Send, wr_id, mr)?;
        Ok(buf.len())
    }

    /// Receive one message into `buf`. Return the number of bytes received,
    /// which never exceeds `buf.len()`.
    pub fn read<Q: QueuePair>(&mut self, qp: &Q, buf: &mut [u8]) -> Result<usize, TransferError> {
        check_len(Direction::Recv, buf.len())?;
        let wr_id = self.fresh_wr_id();

        // SAFETY: `buf` is mutably borrowed for the whole call, and the region
        // either outlives the completion or is leaked.
        let mr = if buf.is_empty() {
            None
        } else {
            let mr = unsafe { qp.reg_mr(buf.as_mut_ptr(), buf.len(), Permission::LOCAL_WRITE) }
                .map_err(|source| TransferError::Register {
                    len: buf.len(),
                    source,
                })?;
            Some(mr)
        };

        let sge = mr.as_ref().map(|mr| mr.sge()).transpose();
        let sge = sge.map_err(|e| TransferError::Post(Direction::Recv, e))?;

        // SAFETY: same as above.
        let ret = unsafe { qp.post_recv(sge, wr_id) };
        ret.map_err(|e| TransferError::Post(Direction::Recv, e))?;

        let wc = self.wait(qp, Direction::Recv, wr_id, mr)?;
        Ok(wc.bytes().min(buf.len()))
    }

    /// Wait for the completion of `wr_id`, then release `mr`.
    ///
    /// If the completion can never be observed, the work request may still
    /// be in flight and the region is leaked instead.
    fn wait<Q: QueuePair, M>(
        &self,
        qp: &Q,
        dir: Direction,
        wr_id: WrId,
        mr: Option<M>,
    ) -> Result<Wc, TransferError> {
        let ret = self.poll_until(qp, dir, wr_id);
        match &ret {
            Err(e) if e.is_fatal() => {
                if let Some(mr) = mr {
                    log::error!(
                        "rrcomm: leaking memory region of {} wr {} after: {}",
                        dir,
                        wr_id,
                        e
                    );
                    mem::forget(mr);
                }
            }
            _ => drop(mr),
        }
        ret
    }

    fn poll_until<Q: QueuePair>(&self, qp: &Q, dir: Direction, wr_id: WrId) -> Result<Wc, TransferError> {
        let mut empty_polls = 0;
        let mut watch = SpinWatch::new(self);

        loop {
            let wc = match dir {
                Direction::Send => qp.poll_send(),
                Direction::Recv => qp.poll_recv(),
            }
            .map_err(|e| TransferError::Poll(dir, e))?;

            match wc {
                Some(wc) if wc.wr_id() == wr_id => {
                    return match wc.ok() {
                        Ok(_) => Ok(wc),
                        Err(status) => Err(TransferError::Completion(dir, status)),
                    };
                }
                Some(wc) if wc.wr_id() < wr_id => {
                    log::warn!("rrcomm: skipping stale {} completion {:?}", dir, wc);
                    continue;
                }
                Some(wc) => {
                    return Err(TransferError::UnexpectedCompletion {
                        dir,
                        expected: wr_id,
                        got: wc.wr_id(),
                    });
                }
                None => {}
            }

            empty_polls += 1;
            if empty_polls == self.peer_check_interval {
                empty_polls = 0;
                if let Err(e) = qp.check_peer() {
                    log::warn!("rrcomm: peer liveness check failed: {}", e);
                }
            }

            watch.check(dir, wr_id);
            std::hint::spin_loop();
        }
    }
}

/// A message must fit in the 32-bit length of one scatter-gather entry.
fn check_len(dir: Direction, len: usize) -> Result<(), TransferError> {
    if u32::try_from(len).is_err() {
        return Err(TransferError::TooLarge { dir, len });
    }
    Ok(())
}

/// Warns once if a poll spins for too long. Does nothing without the
/// `warned_spin` feature.
struct SpinWatch {
    #[cfg(feature = "warned_spin")]
    start: quanta::Instant,
    #[cfg(feature = "warned_spin")]
    limit: Duration,
    #[cfg(feature = "warned_spin")]
    warned: bool,
}

impl SpinWatch {
    #[cfg(feature = "warned_spin")]
    fn new(engine: &TransferEngine) -> Self {
        Self {
            start: quanta::Instant::now(),
            limit: engine.spin_warn,
            warned: false,
        }
    }

    #[cfg(not(feature = "warned_spin"))]
    fn new(_: &TransferEngine) -> Self {
        Self {}
    }

    #[cfg(feature = "warned_spin")]
    fn check(&mut self, dir: Direction, wr_id: WrId) {
        if self.warned {
            return;
        }
        let elapsed = self.start.elapsed();
        if elapsed > self.limit {
            log::warn!("rrcomm: {} wr {} has been spinning for {:?}", dir, wr_id, elapsed);
            self.warned = true;
        }
    }

    #[cfg(not(feature = "warned_spin"))]
    #[inline(always)]
    fn check(&mut self, _: Direction, _: WrId) {}
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    use super::*;
    use crate::rdma::caps::QpCaps;
    use crate::rdma::mr::Sge;
    use crate::rdma::type_alias::LKey;
    use crate::rdma::wc::{WcOpcode, WcStatus};

    /// Records every call and replays scripted completions.
    #[derive(Default)]
    struct MockQp {
        sends: RefCell<Vec<(Option<Sge>, WrId, bool)>>,
        recvs: RefCell<Vec<(Option<Sge>, WrId)>>,
        send_cq: RefCell<VecDeque<io::Result<Option<Wc>>>>,
        recv_cq: RefCell<VecDeque<io::Result<Option<Wc>>>>,
        registered: Rc<Cell<usize>>,
        deregistered: Rc<Cell<usize>>,
        peer_checks: Cell<usize>,
    }

    // SAFETY: only used on the test thread.
    unsafe impl Send for MockQp {}

    struct MockMr {
        addr: *mut u8,
        len: usize,
        deregistered: Rc<Cell<usize>>,
    }

    impl MemoryRegion for MockMr {
        fn lkey(&self) -> LKey {
            42
        }

        fn addr(&self) -> *mut u8 {
            self.addr
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for MockMr {
        fn drop(&mut self) {
            self.deregistered.set(self.deregistered.get() + 1);
        }
    }

    impl QueuePair for MockQp {
        type Mr<'a> = MockMr;

        fn query_caps(&self) -> io::Result<QpCaps> {
            Ok(QpCaps::requested(&ChannelConfig::default()))
        }

        unsafe fn reg_mr<'a>(&'a self, addr: *mut u8, len: usize, _: Permission) -> io::Result<MockMr> {
            self.registered.set(self.registered.get() + 1);
            Ok(MockMr {
                addr,
                len,
                deregistered: self.deregistered.clone(),
            })
        }

        unsafe fn post_send(&self, sge: Option<Sge>, wr_id: WrId, inline: bool) -> io::Result<()> {
            self.sends.borrow_mut().push((sge, wr_id, inline));
            Ok(())
        }

        unsafe fn post_recv(&self, sge: Option<Sge>, wr_id: WrId) -> io::Result<()> {
            self.recvs.borrow_mut().push((sge, wr_id));
            Ok(())
        }

        fn poll_send(&self) -> io::Result<Option<Wc>> {
            self.send_cq.borrow_mut().pop_front().unwrap_or(Ok(None))
        }

        fn poll_recv(&self) -> io::Result<Option<Wc>> {
            self.recv_cq.borrow_mut().pop_front().unwrap_or(Ok(None))
        }

        fn check_peer(&self) -> io::Result<()> {
            self.peer_checks.set(self.peer_checks.get() + 1);
            Ok(())
        }

        fn disconnect(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn ok_wc(wr_id: WrId, opcode: WcOpcode, len: u32) -> io::Result<Option<Wc>> {
        Ok(Some(Wc::new(wr_id, WcStatus::Success, opcode, len)))
    }

    fn caps(max_inline_data: u32) -> NegotiatedCaps {
        let actual = QpCaps {
            max_inline_data,
            ..QpCaps::requested(&ChannelConfig::default())
        };
        NegotiatedCaps::negotiate(actual, 16)
    }

    #[test]
    fn test_write_inline_decision() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        let small = [7u8; 16];
        let large = [7u8; 17];

        qp.send_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Send, 16));
        qp.send_cq.borrow_mut().push_back(ok_wc(2, WcOpcode::Send, 17));
        qp.send_cq.borrow_mut().push_back(ok_wc(3, WcOpcode::Send, 4));

        assert_eq!(engine.write(&qp, &caps(64), &small).unwrap(), 16);
        assert_eq!(engine.write(&qp, &caps(64), &large).unwrap(), 17);
        assert_eq!(engine.write(&qp, &caps(0), &small[..4]).unwrap(), 4);

        let sends = qp.sends.borrow();
        assert_eq!(sends.iter().map(|s| s.2).collect::<Vec<_>>(), [true, false, false]);
        assert_eq!(sends.iter().map(|s| s.1).collect::<Vec<_>>(), [1, 2, 3]);
        let sge = sends[1].0.unwrap();
        assert_eq!(sge.addr, large.as_ptr() as u64);
        assert_eq!(sge.length, 17);
        assert_eq!(qp.deregistered.get(), 3);
    }

    #[test]
    fn test_zero_length_skips_registration() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());

        qp.send_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Send, 0));
        qp.recv_cq.borrow_mut().push_back(ok_wc(2, WcOpcode::Recv, 0));
        assert_eq!(engine.write(&qp, &caps(64), &[]).unwrap(), 0);
        assert_eq!(engine.read(&qp, &mut []).unwrap(), 0);

        assert_eq!(qp.registered.get(), 0);
        assert_eq!(qp.sends.borrow()[0].0, None);
        assert_eq!(qp.recvs.borrow()[0].0, None);
    }

    #[test]
    fn test_read_returns_byte_len() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        let mut buf = [0u8; 64];

        qp.recv_cq.borrow_mut().push_back(Ok(None));
        qp.recv_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Recv, 4));
        assert_eq!(engine.read(&qp, &mut buf).unwrap(), 4);
        assert_eq!(qp.recvs.borrow()[0].0.unwrap().length, 64);
        assert_eq!(qp.deregistered.get(), 1);
    }

    #[test]
    fn test_error_completion_releases_mr() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        let mut buf = [0u8; 8];

        qp.recv_cq
            .borrow_mut()
            .push_back(Ok(Some(Wc::new(1, WcStatus::WrFlushErr, WcOpcode::Other(0), 0))));
        let err = engine.read(&qp, &mut buf).unwrap_err();
        assert_eq!(err.status(), Some(WcStatus::WrFlushErr));
        assert!(!err.is_fatal());
        assert_eq!(qp.deregistered.get(), 1);
    }

    #[test]
    fn test_poll_failure_leaks_mr() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        let buf = [0u8; 32];

        qp.send_cq
            .borrow_mut()
            .push_back(Err(io::Error::from_raw_os_error(libc::EIO)));
        let err = engine.write(&qp, &caps(64), &buf).unwrap_err();
        assert!(matches!(err, TransferError::Poll(Direction::Send, _)));
        assert_eq!(qp.registered.get(), 1);
        assert_eq!(qp.deregistered.get(), 0);
    }

    #[test]
    fn test_wr_id_checks() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        let buf = [0u8; 32];

        qp.send_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Send, 32));
        engine.write(&qp, &caps(64), &buf).unwrap();

        // A leftover completion of wr 1 is skipped while waiting for wr 2.
        qp.send_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Send, 32));
        qp.send_cq.borrow_mut().push_back(ok_wc(2, WcOpcode::Send, 32));
        engine.write(&qp, &caps(64), &buf).unwrap();

        qp.send_cq.borrow_mut().push_back(ok_wc(9, WcOpcode::Send, 32));
        let err = engine.write(&qp, &caps(64), &buf).unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnexpectedCompletion {
                expected: 3,
                got: 9,
                ..
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(qp.deregistered.get(), 2);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_oversized_buffer_rejected() {
        let qp = MockQp::default();
        let mut engine = TransferEngine::new(&ChannelConfig::default());
        // Zero-filled allocations are mapped lazily, and nothing below
        // touches the memory.
        let mut buf = vec![0u8; (1 << 32) + 4];

        let err = engine.write(&qp, &caps(64), &buf).unwrap_err();
        assert!(matches!(
            err,
            TransferError::TooLarge {
                dir: Direction::Send,
                len,
            } if len == (1 << 32) + 4
        ));
        let err = engine.read(&qp, &mut buf).unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { dir: Direction::Recv, .. }));
        assert!(!err.is_fatal());

        // Nothing was registered or posted, and wr_ids were not consumed.
        assert_eq!(qp.registered.get(), 0);
        assert!(qp.sends.borrow().is_empty());
        assert!(qp.recvs.borrow().is_empty());

        qp.send_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Send, 4));
        assert_eq!(engine.write(&qp, &caps(64), &buf[..4]).unwrap(), 4);
    }

    #[test]
    fn test_sge_rejects_oversized_region() {
        let mr = MockMr {
            addr: std::ptr::null_mut(),
            len: u32::MAX as usize + 1,
            deregistered: Rc::default(),
        };
        let err = mr.sge().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        let mr = MockMr {
            addr: std::ptr::null_mut(),
            len: u32::MAX as usize,
            deregistered: Rc::default(),
        };
        assert_eq!(mr.sge().unwrap().length, u32::MAX);
    }

    #[test]
    fn test_peer_check_interval() {
        let qp = MockQp::default();
        let config = ChannelConfig {
            peer_check_interval: 4,
            ..Default::default()
        };
        let mut engine = TransferEngine::new(&config);
        let mut buf = [0u8; 8];

        for _ in 0..9 {
            qp.recv_cq.borrow_mut().push_back(Ok(None));
        }
        qp.recv_cq.borrow_mut().push_back(ok_wc(1, WcOpcode::Recv, 8));
        engine.read(&qp, &mut buf).unwrap();
        assert_eq!(qp.peer_checks.get(), 2);
    }
}
