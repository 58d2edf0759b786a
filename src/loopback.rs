//! In-process transport that emulates RC queue pairs between threads.
//!
//! Two connected [`LoopbackQp`]s share a wire. A send completes only once the
//! peer has a receive posted and the message has been copied into it, as it
//! would on an RC connection with unlimited RNR retries. Length and protection
//! errors move the wire to the error state, and disconnecting either side
//! flushes every outstanding work request on both sides.
//!
//! Listeners are keyed by port only, so a listener bound to `0.0.0.0:p` is
//! reached by connecting to any address with port `p`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::endpoint::EndpointAddr;
use crate::rdma::caps::QpCaps;
use crate::rdma::mr::{Permission, Sge};
use crate::rdma::type_alias::{LKey, WrId};
use crate::rdma::wc::{Wc, WcOpcode, WcStatus};
use crate::transport::{Listener, MemoryRegion, Provider, QueuePair};

/// A pending connection: the passive end of the wire, and the way to tell the
/// active side that it has been accepted.
struct ConnRequest {
    qp: LoopbackQp,
    accepted: mpsc::Sender<()>,
}

struct FabricInner {
    listeners: Mutex<HashMap<u16, (u64, mpsc::Sender<ConnRequest>)>>,
    max_inline_data: u32,
    ops: AtomicU64,
    next_lkey: AtomicU32,
    next_listener: AtomicU64,
}

impl FabricInner {
    fn count_op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-process RDMA fabric.
///
/// Clones share the same set of listeners.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
    connect_timeout: Option<Duration>,
}

impl LoopbackFabric {
    /// Default maximum inline data size of the emulated device.
    pub const DEFAULT_MAX_INLINE_DATA: u32 = 64;

    pub fn new() -> Self {
        Self::with_max_inline(Self::DEFAULT_MAX_INLINE_DATA)
    }

    /// Create a fabric whose device supports at most `max_inline_data` bytes
    /// of inline data, whatever the connection requests.
    pub fn with_max_inline(max_inline_data: u32) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                listeners: Mutex::new(HashMap::new()),
                max_inline_data,
                ops: AtomicU64::new(0),
                next_lkey: AtomicU32::new(1),
                next_listener: AtomicU64::new(1),
            }),
            connect_timeout: None,
        }
    }

    /// Make connections through this handle give up if they are not accepted
    /// within `timeout`. An abandoned request still sits in the listener's
    /// queue, and accepting it fails.
    ///
    /// Other handles to the same fabric keep waiting forever.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Number of device operations (listen, connect, accept, registration,
    /// post, poll, query) issued on this fabric so far.
    pub fn hardware_ops(&self) -> u64 {
        self.inner.ops.load(Ordering::Relaxed)
    }

    fn device_caps(&self, requested: &QpCaps) -> QpCaps {
        QpCaps {
            max_inline_data: requested.max_inline_data.min(self.inner.max_inline_data),
            ..*requested
        }
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for LoopbackFabric {
    type Qp = LoopbackQp;
    type Listener = LoopbackListener;

    fn listen(&self, addr: &EndpointAddr, caps: &QpCaps, _backlog: i32) -> io::Result<LoopbackListener> {
        self.inner.count_op();

        let mut listeners = lock(&self.inner.listeners);
        if listeners.contains_key(&addr.port()) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }

        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        listeners.insert(addr.port(), (id, tx));
        Ok(LoopbackListener {
            fabric: self.clone(),
            id,
            port: addr.port(),
            caps: self.device_caps(caps),
            requests: rx,
        })
    }

    fn connect(&self, addr: &EndpointAddr, caps: &QpCaps) -> io::Result<LoopbackQp> {
        self.inner.count_op();

        let listener = lock(&self.inner.listeners)
            .get(&addr.port())
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let wire = Arc::new(Mutex::new(Wire::default()));
        let active = LoopbackQp::new(self.clone(), wire.clone(), 0, self.device_caps(caps));
        // The passive side takes the listener's capabilities on accept.
        let passive = LoopbackQp::new(self.clone(), wire, 1, QpCaps::default());

        let (accepted, wait_accept) = mpsc::channel();
        listener
            .send(ConnRequest {
                qp: passive,
                accepted,
            })
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        // The listener going away before accepting drops the sender.
        let refused = || io::Error::from(io::ErrorKind::ConnectionRefused);
        match self.connect_timeout {
            Some(timeout) => wait_accept.recv_timeout(timeout).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
                mpsc::RecvTimeoutError::Disconnected => refused(),
            })?,
            None => wait_accept.recv().map_err(|_| refused())?,
        }
        Ok(active)
    }
}

/// A listener on a [`LoopbackFabric`]. Dropping it frees the port and
/// rejects pending connection requests.
pub struct LoopbackListener {
    fabric: LoopbackFabric,
    id: u64,
    port: u16,
    caps: QpCaps,
    requests: mpsc::Receiver<ConnRequest>,
}

impl Listener for LoopbackListener {
    type Qp = LoopbackQp;

    fn accept(&self) -> io::Result<LoopbackQp> {
        self.fabric.inner.count_op();

        let ConnRequest { mut qp, accepted } = self
            .requests
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        qp.caps = self.caps;
        accepted
            .send(())
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        Ok(qp)
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let mut listeners = lock(&self.fabric.inner.listeners);
        if listeners.get(&self.port).map(|(id, _)| *id) == Some(self.id) {
            listeners.remove(&self.port);
        }
    }
}

struct Message {
    data: Vec<u8>,
    wr_id: WrId,
}

struct PostedRecv {
    sge: Option<Sge>,
    wr_id: WrId,
}

#[derive(Default)]
struct Side {
    mrs: HashMap<LKey, (u64, usize, Permission)>,
    posted_recvs: VecDeque<PostedRecv>,
    inbound: VecDeque<Message>,
    send_cq: VecDeque<Wc>,
    recv_cq: VecDeque<Wc>,
}

impl Side {
    /// Check that `sge` lies within a region registered on this side.
    fn check_sge(&self, sge: &Sge, perm: Permission) -> bool {
        match self.mrs.get(&sge.lkey) {
            Some(&(addr, len, p)) => {
                p.contains(perm)
                    && sge.addr >= addr
                    && sge.addr + sge.length as u64 <= addr + len as u64
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Wire {
    sides: [Side; 2],
    broken: bool,
}

fn flushed(wr_id: WrId) -> Wc {
    Wc::new(wr_id, WcStatus::WrFlushErr, WcOpcode::Other(0), 0)
}

impl Wire {
    /// Move the wire to the error state and flush everything outstanding.
    fn flush(&mut self) {
        self.broken = true;
        for i in 0..2 {
            while let Some(recv) = self.sides[i].posted_recvs.pop_front() {
                self.sides[i].recv_cq.push_back(flushed(recv.wr_id));
            }
            while let Some(msg) = self.sides[i].inbound.pop_front() {
                self.sides[1 - i].send_cq.push_back(flushed(msg.wr_id));
            }
        }
    }

    /// Deliver inbound messages of side `i` into its posted receives.
    fn deliver(&mut self, i: usize) {
        while !self.broken
            && !self.sides[i].posted_recvs.is_empty()
            && !self.sides[i].inbound.is_empty()
        {
            let (Some(recv), Some(msg)) = (
                self.sides[i].posted_recvs.pop_front(),
                self.sides[i].inbound.pop_front(),
            ) else {
                break;
            };

            let capacity = recv.sge.map_or(0, |sge| sge.length as usize);
            if msg.data.len() > capacity {
                self.sides[i]
                    .recv_cq
                    .push_back(Wc::new(recv.wr_id, WcStatus::LocLenErr, WcOpcode::Recv, 0));
                self.sides[1 - i].send_cq.push_back(Wc::new(
                    msg.wr_id,
                    WcStatus::RemInvReqErr,
                    WcOpcode::Send,
                    0,
                ));
                self.flush();
                return;
            }

            if let Some(sge) = recv.sge {
                // SAFETY: the receive buffer is registered, checked to cover
                // the SGE, and not accessed by its owner until the completion
                // is polled under the same lock.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        msg.data.as_ptr(),
                        sge.addr as *mut u8,
                        msg.data.len(),
                    )
                };
            }
            let len = msg.data.len() as u32;
            self.sides[i]
                .recv_cq
                .push_back(Wc::new(recv.wr_id, WcStatus::Success, WcOpcode::Recv, len));
            self.sides[1 - i]
                .send_cq
                .push_back(Wc::new(msg.wr_id, WcStatus::Success, WcOpcode::Send, len));
        }
    }
}

/// One end of an emulated RC connection.
pub struct LoopbackQp {
    fabric: LoopbackFabric,
    wire: Arc<Mutex<Wire>>,
    side: usize,
    caps: QpCaps,
}

impl LoopbackQp {
    fn new(fabric: LoopbackFabric, wire: Arc<Mutex<Wire>>, side: usize, caps: QpCaps) -> Self {
        Self {
            fabric,
            wire,
            side,
            caps,
        }
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        lock(&self.wire)
    }

    fn count_op(&self) {
        self.fabric.inner.count_op();
    }
}

/// Memory region registered on a [`LoopbackQp`].
pub struct LoopbackMr<'a> {
    qp: &'a LoopbackQp,
    lkey: LKey,
    addr: *mut u8,
    len: usize,
}

impl MemoryRegion for LoopbackMr<'_> {
    fn lkey(&self) -> LKey {
        self.lkey
    }

    fn addr(&self) -> *mut u8 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for LoopbackMr<'_> {
    fn drop(&mut self) {
        self.qp.wire().sides[self.qp.side].mrs.remove(&self.lkey);
    }
}

impl QueuePair for LoopbackQp {
    type Mr<'a> = LoopbackMr<'a> where Self: 'a;

    fn query_caps(&self) -> io::Result<QpCaps> {
        self.count_op();
        Ok(self.caps)
    }

    unsafe fn reg_mr<'a>(&'a self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<LoopbackMr<'a>> {
        self.count_op();
        if addr.is_null() || len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let lkey = self.fabric.inner.next_lkey.fetch_add(1, Ordering::Relaxed);
        self.wire().sides[self.side]
            .mrs
            .insert(lkey, (addr as u64, len, perm));
        Ok(LoopbackMr {
            qp: self,
            lkey,
            addr,
            len,
        })
    }

    unsafe fn post_send(&self, sge: Option<Sge>, wr_id: WrId, inline: bool) -> io::Result<()> {
        self.count_op();
        let len = sge.map_or(0, |sge| sge.length);
        if inline && len > self.caps.max_inline_data {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut wire = self.wire();
        let (me, peer) = (self.side, 1 - self.side);
        if wire.broken {
            wire.sides[me].send_cq.push_back(flushed(wr_id));
            return Ok(());
        }

        let data = match sge {
            Some(sge) => {
                if !wire.sides[me].check_sge(&sge, Permission::EMPTY) {
                    wire.sides[me].send_cq.push_back(Wc::new(
                        wr_id,
                        WcStatus::LocProtErr,
                        WcOpcode::Send,
                        0,
                    ));
                    wire.flush();
                    return Ok(());
                }
                // SAFETY: the SGE lies within a registered region, which the
                // caller keeps valid until completion.
                std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize).to_vec()
            }
            None => Vec::new(),
        };

        wire.sides[peer].inbound.push_back(Message { data, wr_id });
        wire.deliver(peer);
        Ok(())
    }

    unsafe fn post_recv(&self, sge: Option<Sge>, wr_id: WrId) -> io::Result<()> {
        self.count_op();

        let mut wire = self.wire();
        let me = self.side;
        if wire.broken {
            wire.sides[me].recv_cq.push_back(flushed(wr_id));
            return Ok(());
        }

        if let Some(sge) = sge {
            if !wire.sides[me].check_sge(&sge, Permission::LOCAL_WRITE) {
                wire.sides[me].recv_cq.push_back(Wc::new(
                    wr_id,
                    WcStatus::LocProtErr,
                    WcOpcode::Recv,
                    0,
                ));
                wire.flush();
                return Ok(());
            }
        }

        wire.sides[me].posted_recvs.push_back(PostedRecv { sge, wr_id });
        wire.deliver(me);
        Ok(())
    }

    fn poll_send(&self) -> io::Result<Option<Wc>> {
        self.count_op();
        Ok(self.wire().sides[self.side].send_cq.pop_front())
    }

    fn poll_recv(&self) -> io::Result<Option<Wc>> {
        self.count_op();
        Ok(self.wire().sides[self.side].recv_cq.pop_front())
    }

    fn check_peer(&self) -> io::Result<()> {
        // Disconnects flush both sides synchronously.
        Ok(())
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.count_op();
        let mut wire = self.wire();
        if !wire.broken {
            wire.flush();
        }
        Ok(())
    }
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        let mut wire = self.wire();
        if !wire.broken {
            wire.flush();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
