//! In-process [`Fabric`] connecting channels inside one process.
//!
//! Behaves like a reliable-connected queue pair pair: sends land in the
//! peer's posted receives in order, remote writes are checked against the
//! target key and bounds, and failures surface as error completions. Every
//! handle is counted in a [`LedgerSnapshot`], which also records the order
//! in which handles were released and any release the real verbs stack would
//! refuse (a protection domain with live regions, an event channel with live
//! identifiers, and so on). Faults can be injected at every creation step.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    backend::{
        CmErrorKind, CmEvent, Completion, CompletionOpcode, CompletionStatus, Fabric,
        MemoryAccess, MemoryRegion, QueueCaps, WC_WR_FLUSH_ERR,
    },
    error::{ChannelError, Result},
};

const WC_LOC_LEN_ERR: u32 = 1;
const WC_LOC_PROT_ERR: u32 = 4;
const WC_REM_ACCESS_ERR: u32 = 10;
const ECONNREFUSED: i32 = 111;
const ETIMEDOUT: i32 = 110;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    EventChannel,
    CmId,
    Pd,
    CompChannel,
    Cq,
    Qp,
    Mr,
}

/// A step that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    CreateEventChannel,
    CreateId,
    /// `resolve_addr` returns an error.
    ResolveAddr,
    /// `resolve_addr` succeeds but never produces an event.
    StallResolution,
    /// Route resolution reports an error event.
    ResolveRoute,
    AllocPd,
    CreateCompChannel,
    CreateCq,
    CreateQp,
    RegisterMemory,
    Connect,
    /// The next remote write completes with a remote access error.
    RemoteWrite,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub created: BTreeMap<ResourceKind, usize>,
    pub released: BTreeMap<ResourceKind, usize>,
    /// Every release, oldest first.
    pub releases: Vec<ResourceKind>,
    /// Releases the hardware stack would have refused.
    pub violations: Vec<String>,
}

impl LedgerSnapshot {
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.created.get(&kind).copied().unwrap_or(0)
    }

    pub fn released(&self, kind: ResourceKind) -> usize {
        self.released.get(&kind).copied().unwrap_or(0)
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.created(kind).saturating_sub(self.released(kind))
    }

    pub fn live_total(&self) -> usize {
        self.created
            .keys()
            .map(|kind| self.live(*kind))
            .sum()
    }
}

struct RemoteRegion {
    addr: u64,
    len: usize,
    access: MemoryAccess,
}

#[derive(Default)]
struct Network {
    ledger: Mutex<LedgerSnapshot>,
    faults: Mutex<Vec<(FaultPoint, usize)>>,
    listeners: Mutex<HashMap<SocketAddr, Weak<IdInner>>>,
    regions: Mutex<HashMap<u32, RemoteRegion>>,
    next_key: AtomicU32,
    next_qp_num: AtomicU32,
}

impl Network {
    fn created(&self, kind: ResourceKind) {
        *self.ledger.lock().created.entry(kind).or_default() += 1;
    }

    fn released(&self, kind: ResourceKind) {
        let mut ledger = self.ledger.lock();
        *ledger.released.entry(kind).or_default() += 1;
        ledger.releases.push(kind);
    }

    fn violation(&self, message: String) {
        log::warn!("loopback release violation: {}", message);
        self.ledger.lock().violations.push(message);
    }

    fn trip(&self, point: FaultPoint) -> bool {
        let mut faults = self.faults.lock();
        let Some(pos) = faults.iter().position(|(armed, _)| *armed == point) else {
            return false;
        };
        if faults[pos].1 == 0 {
            faults.remove(pos);
            true
        } else {
            faults[pos].1 -= 1;
            false
        }
    }

    fn fail(&self, point: FaultPoint, op: &str) -> Result<()> {
        if self.trip(point) {
            return Err(ChannelError::Backend(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

struct EventQueue {
    events: Mutex<VecDeque<CmEvent<LoopbackCmId>>>,
    ready: Condvar,
    live_ids: AtomicUsize,
}

impl EventQueue {
    fn push(&self, event: CmEvent<LoopbackCmId>) {
        self.events.lock().push_back(event);
        self.ready.notify_all();
    }
}

pub struct LoopbackEventChannel {
    queue: Arc<EventQueue>,
    net: Arc<Network>,
}

impl Drop for LoopbackEventChannel {
    fn drop(&mut self) {
        // Undelivered connection requests own identifiers of their own.
        let pending = std::mem::take(&mut *self.queue.events.lock());
        drop(pending);
        let live = self.queue.live_ids.load(Ordering::Acquire);
        if live > 0 {
            self.net
                .violation(format!("event channel destroyed with {live} live identifiers"));
        }
        self.net.released(ResourceKind::EventChannel);
    }
}

#[derive(Default)]
struct IdState {
    remote: Option<SocketAddr>,
    listening: Option<SocketAddr>,
    qp: Option<Arc<QpInner>>,
    peer: Option<Weak<IdInner>>,
    connected: bool,
}

struct IdInner {
    queue: Arc<EventQueue>,
    state: Mutex<IdState>,
}

impl IdInner {
    /// Tears down this side of a link the peer dropped or disconnected.
    /// Posted receives complete with a flush status, as the queue pair
    /// moves to the error state.
    fn peer_gone(&self) {
        let mut state = self.state.lock();
        state.peer = None;
        if let Some(qp) = &state.qp {
            *qp.peer.lock() = None;
            qp.flush_receives();
        }
        if std::mem::take(&mut state.connected) {
            drop(state);
            self.queue.push(CmEvent::Disconnected);
        }
    }
}

pub struct LoopbackCmId {
    inner: Arc<IdInner>,
    net: Arc<Network>,
}

impl Drop for LoopbackCmId {
    fn drop(&mut self) {
        let (listening, peer) = {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.qp = None;
            (state.listening.take(), state.peer.take())
        };
        if let Some(addr) = listening {
            self.net.listeners.lock().remove(&addr);
        }
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            peer.peer_gone();
        }
        self.inner.queue.live_ids.fetch_sub(1, Ordering::AcqRel);
        self.net.released(ResourceKind::CmId);
    }
}

#[derive(Default)]
struct PdInner {
    dependents: AtomicUsize,
}

pub struct LoopbackPd {
    inner: Arc<PdInner>,
    net: Arc<Network>,
}

impl Drop for LoopbackPd {
    fn drop(&mut self) {
        let dependents = self.inner.dependents.load(Ordering::Acquire);
        if dependents > 0 {
            self.net.violation(format!(
                "protection domain destroyed with {dependents} dependents"
            ));
        }
        self.net.released(ResourceKind::Pd);
    }
}

pub struct LoopbackMr {
    addr: u64,
    len: usize,
    key: u32,
    pd: Arc<PdInner>,
    net: Arc<Network>,
}

impl MemoryRegion for LoopbackMr {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }

    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for LoopbackMr {
    fn drop(&mut self) {
        self.net.regions.lock().remove(&self.key);
        self.pd.dependents.fetch_sub(1, Ordering::AcqRel);
        self.net.released(ResourceKind::Mr);
    }
}

#[derive(Default)]
struct CompInner {
    pending: Mutex<usize>,
    ready: Condvar,
    attached_cqs: AtomicUsize,
}

pub struct LoopbackCompChannel {
    inner: Arc<CompInner>,
    net: Arc<Network>,
}

impl Drop for LoopbackCompChannel {
    fn drop(&mut self) {
        let attached = self.inner.attached_cqs.load(Ordering::Acquire);
        if attached > 0 {
            self.net.violation(format!(
                "completion channel destroyed with {attached} attached queues"
            ));
        }
        self.net.released(ResourceKind::CompChannel);
    }
}

struct CqInner {
    entries: Mutex<VecDeque<Completion>>,
    depth: usize,
    armed: AtomicBool,
    overrun: AtomicBool,
    channel: Arc<CompInner>,
    attached_qps: AtomicUsize,
}

impl CqInner {
    fn push(&self, completion: Completion) {
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.depth {
                self.overrun.store(true, Ordering::Release);
                return;
            }
            entries.push_back(completion);
        }
        if self.armed.swap(false, Ordering::AcqRel) {
            *self.channel.pending.lock() += 1;
            self.channel.ready.notify_all();
        }
    }
}

pub struct LoopbackCq {
    inner: Arc<CqInner>,
    net: Arc<Network>,
}

impl Drop for LoopbackCq {
    fn drop(&mut self) {
        let attached = self.inner.attached_qps.load(Ordering::Acquire);
        if attached > 0 {
            self.net.violation(format!(
                "completion queue destroyed with {attached} attached queue pairs"
            ));
        }
        self.inner
            .channel
            .attached_cqs
            .fetch_sub(1, Ordering::AcqRel);
        self.net.released(ResourceKind::Cq);
    }
}

struct PostedRecv {
    wr_id: u64,
    addr: u64,
    len: u32,
}

#[derive(Default)]
struct RecvQueue {
    posted: VecDeque<PostedRecv>,
    /// Sends that arrived with no receive posted, held as an RNR retry would.
    backlog: VecDeque<Vec<u8>>,
}

struct QpInner {
    qp_num: u32,
    caps: QueueCaps,
    cq: Arc<CqInner>,
    recv: Mutex<RecvQueue>,
    peer: Mutex<Option<Weak<QpInner>>>,
}

impl QpInner {
    fn peer(&self) -> Option<Arc<QpInner>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn complete(&self, wr_id: u64, opcode: CompletionOpcode, status: CompletionStatus, len: u32) {
        self.cq.push(Completion {
            wr_id,
            status,
            opcode,
            byte_len: len,
            vendor_err: 0,
        });
    }

    fn flush_receives(&self) {
        let flushed = std::mem::take(&mut self.recv.lock().posted);
        for posted in flushed {
            self.complete(
                posted.wr_id,
                CompletionOpcode::Recv,
                CompletionStatus::Failed(WC_WR_FLUSH_ERR),
                0,
            );
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let posted = {
            let mut recv = self.recv.lock();
            match recv.posted.pop_front() {
                Some(posted) => posted,
                None => {
                    recv.backlog.push_back(payload.to_vec());
                    return;
                }
            }
        };
        self.fill(posted, payload);
    }

    fn fill(&self, posted: PostedRecv, payload: &[u8]) {
        if payload.len() > posted.len as usize {
            self.complete(
                posted.wr_id,
                CompletionOpcode::Recv,
                CompletionStatus::Failed(WC_LOC_LEN_ERR),
                0,
            );
            return;
        }
        // SAFETY: `posted` was checked against a registered region when it
        // was posted, and registrations outlive the queue pair.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                posted.addr as *mut u8,
                payload.len(),
            );
        }
        self.complete(
            posted.wr_id,
            CompletionOpcode::Recv,
            CompletionStatus::Success,
            payload.len() as u32,
        );
    }
}

pub struct LoopbackQp {
    inner: Arc<QpInner>,
    pd: Arc<PdInner>,
    net: Arc<Network>,
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        let peer = self.inner.peer.lock().take();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            *peer.peer.lock() = None;
        }
        self.inner.cq.attached_qps.fetch_sub(1, Ordering::AcqRel);
        self.pd.dependents.fetch_sub(1, Ordering::AcqRel);
        self.net.released(ResourceKind::Qp);
    }
}

#[derive(Clone, Default)]
pub struct LoopbackFabric {
    net: Arc<Network>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.net.ledger.lock().clone()
    }

    /// Fails the next occurrence of `point`.
    pub fn inject(&self, point: FaultPoint) {
        self.inject_after(point, 0);
    }

    /// Lets `skip` occurrences of `point` succeed, then fails one.
    pub fn inject_after(&self, point: FaultPoint, skip: usize) {
        self.net.faults.lock().push((point, skip));
    }

    fn next_key(&self) -> u32 {
        self.net.next_key.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Fabric for LoopbackFabric {
    type EventChannel = LoopbackEventChannel;
    type CmId = LoopbackCmId;
    type Pd = LoopbackPd;
    type Mr = LoopbackMr;
    type CompChannel = LoopbackCompChannel;
    type Cq = LoopbackCq;
    type Qp = LoopbackQp;

    fn create_event_channel(&self) -> Result<LoopbackEventChannel> {
        self.net
            .fail(FaultPoint::CreateEventChannel, "rdma_create_event_channel")?;
        self.net.created(ResourceKind::EventChannel);
        Ok(LoopbackEventChannel {
            queue: Arc::new(EventQueue {
                events: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                live_ids: AtomicUsize::new(0),
            }),
            net: Arc::clone(&self.net),
        })
    }

    fn create_id(&self, channel: &LoopbackEventChannel) -> Result<LoopbackCmId> {
        self.net.fail(FaultPoint::CreateId, "rdma_create_id")?;
        channel.queue.live_ids.fetch_add(1, Ordering::AcqRel);
        self.net.created(ResourceKind::CmId);
        Ok(LoopbackCmId {
            inner: Arc::new(IdInner {
                queue: Arc::clone(&channel.queue),
                state: Mutex::new(IdState::default()),
            }),
            net: Arc::clone(&self.net),
        })
    }

    fn poll_cm_event(
        &self,
        channel: &LoopbackEventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<LoopbackCmId>>> {
        let deadline = Instant::now() + timeout;
        let mut events = channel.queue.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Ok(Some(event));
            }
            if channel
                .queue
                .ready
                .wait_until(&mut events, deadline)
                .timed_out()
            {
                return Ok(events.pop_front());
            }
        }
    }

    fn resolve_addr(
        &self,
        id: &LoopbackCmId,
        _local: Option<IpAddr>,
        remote: SocketAddr,
        _timeout: Duration,
    ) -> Result<()> {
        self.net.fail(FaultPoint::ResolveAddr, "rdma_resolve_addr")?;
        id.inner.state.lock().remote = Some(remote);
        if self.net.trip(FaultPoint::StallResolution) {
            return Ok(());
        }
        id.inner.queue.push(CmEvent::AddrResolved);
        Ok(())
    }

    fn resolve_route(&self, id: &LoopbackCmId, _timeout: Duration) -> Result<()> {
        if self.net.trip(FaultPoint::ResolveRoute) {
            id.inner.queue.push(CmEvent::Error {
                kind: CmErrorKind::Route,
                status: -ETIMEDOUT,
            });
            return Ok(());
        }
        id.inner.queue.push(CmEvent::RouteResolved);
        Ok(())
    }

    fn listen(&self, id: &LoopbackCmId, bind: SocketAddr, _backlog: u32) -> Result<()> {
        let mut listeners = self.net.listeners.lock();
        if listeners
            .get(&bind)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(ChannelError::Backend(format!(
                "rdma_listen: address {bind} in use"
            )));
        }
        listeners.insert(bind, Arc::downgrade(&id.inner));
        id.inner.state.lock().listening = Some(bind);
        Ok(())
    }

    fn connect(&self, id: &LoopbackCmId, qp: &LoopbackQp) -> Result<()> {
        self.net.fail(FaultPoint::Connect, "rdma_connect")?;
        let remote = {
            let state = id.inner.state.lock();
            if !state.qp.as_ref().is_some_and(|own| Arc::ptr_eq(own, &qp.inner)) {
                return Err(ChannelError::Backend(
                    "rdma_connect: queue pair does not belong to identifier".to_string(),
                ));
            }
            state.remote
        };
        let listener = remote
            .and_then(|remote| self.net.listeners.lock().get(&remote).cloned())
            .and_then(|listener| listener.upgrade());
        let Some(listener) = listener else {
            id.inner.queue.push(CmEvent::Error {
                kind: CmErrorKind::Unreachable,
                status: -ECONNREFUSED,
            });
            return Ok(());
        };

        let child = Arc::new(IdInner {
            queue: Arc::clone(&listener.queue),
            state: Mutex::new(IdState {
                peer: Some(Arc::downgrade(&id.inner)),
                ..IdState::default()
            }),
        });
        listener.queue.live_ids.fetch_add(1, Ordering::AcqRel);
        self.net.created(ResourceKind::CmId);
        id.inner.state.lock().peer = Some(Arc::downgrade(&child));
        listener.queue.push(CmEvent::ConnectRequest(LoopbackCmId {
            inner: child,
            net: Arc::clone(&self.net),
        }));
        Ok(())
    }

    /// Links both queue pairs and answers the active side with a connect
    /// response. The passive side is established once the active side
    /// calls [`Fabric::establish`].
    fn accept(&self, id: &LoopbackCmId, qp: &LoopbackQp) -> Result<()> {
        let mut state = id.inner.state.lock();
        let active = state
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChannelError::Backend("rdma_accept: peer is gone".to_string()))?;
        if !state.qp.as_ref().is_some_and(|own| Arc::ptr_eq(own, &qp.inner)) {
            return Err(ChannelError::Backend(
                "rdma_accept: queue pair does not belong to identifier".to_string(),
            ));
        }
        let active_state = active.state.lock();
        let remote_qp = active_state
            .qp
            .clone()
            .ok_or_else(|| ChannelError::Backend("rdma_accept: peer has no queue pair".to_string()))?;

        *qp.inner.peer.lock() = Some(Arc::downgrade(&remote_qp));
        *remote_qp.peer.lock() = Some(Arc::downgrade(&qp.inner));
        state.connected = true;
        drop(active_state);
        drop(state);

        active.queue.push(CmEvent::ConnectResponse);
        Ok(())
    }

    fn establish(&self, id: &LoopbackCmId, qp: &LoopbackQp) -> Result<()> {
        let mut state = id.inner.state.lock();
        let passive = state
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChannelError::Backend("rdma_establish: peer is gone".to_string()))?;
        if qp.inner.peer().is_none() {
            return Err(ChannelError::Backend(
                "rdma_establish: queue pair was not accepted".to_string(),
            ));
        }
        state.connected = true;
        drop(state);

        passive.queue.push(CmEvent::Established);
        Ok(())
    }

    fn reject(&self, id: &LoopbackCmId) -> Result<()> {
        let peer = id.inner.state.lock().peer.take();
        if let Some(active) = peer.and_then(|peer| peer.upgrade()) {
            active.state.lock().peer = None;
            active.queue.push(CmEvent::Error {
                kind: CmErrorKind::Rejected,
                status: -ECONNREFUSED,
            });
        }
        Ok(())
    }

    fn disconnect(&self, id: &LoopbackCmId) -> Result<()> {
        let peer = id.inner.state.lock().peer.clone();
        id.inner.peer_gone();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            peer.peer_gone();
        }
        Ok(())
    }

    fn alloc_pd(&self, _id: &LoopbackCmId) -> Result<LoopbackPd> {
        self.net.fail(FaultPoint::AllocPd, "ibv_alloc_pd")?;
        self.net.created(ResourceKind::Pd);
        Ok(LoopbackPd {
            inner: Arc::new(PdInner::default()),
            net: Arc::clone(&self.net),
        })
    }

    fn create_comp_channel(&self, _id: &LoopbackCmId) -> Result<LoopbackCompChannel> {
        self.net
            .fail(FaultPoint::CreateCompChannel, "ibv_create_comp_channel")?;
        self.net.created(ResourceKind::CompChannel);
        Ok(LoopbackCompChannel {
            inner: Arc::new(CompInner::default()),
            net: Arc::clone(&self.net),
        })
    }

    fn create_cq(
        &self,
        _id: &LoopbackCmId,
        channel: &LoopbackCompChannel,
        depth: u32,
    ) -> Result<LoopbackCq> {
        self.net.fail(FaultPoint::CreateCq, "ibv_create_cq")?;
        channel.inner.attached_cqs.fetch_add(1, Ordering::AcqRel);
        self.net.created(ResourceKind::Cq);
        Ok(LoopbackCq {
            inner: Arc::new(CqInner {
                entries: Mutex::new(VecDeque::with_capacity(depth as usize)),
                depth: depth as usize,
                armed: AtomicBool::new(false),
                overrun: AtomicBool::new(false),
                channel: Arc::clone(&channel.inner),
                attached_qps: AtomicUsize::new(0),
            }),
            net: Arc::clone(&self.net),
        })
    }

    fn create_qp(
        &self,
        id: &LoopbackCmId,
        pd: &LoopbackPd,
        cq: &LoopbackCq,
        caps: QueueCaps,
    ) -> Result<LoopbackQp> {
        self.net.fail(FaultPoint::CreateQp, "rdma_create_qp")?;
        let inner = Arc::new(QpInner {
            qp_num: self.net.next_qp_num.fetch_add(1, Ordering::Relaxed) + 0x100,
            caps,
            cq: Arc::clone(&cq.inner),
            recv: Mutex::new(RecvQueue::default()),
            peer: Mutex::new(None),
        });
        cq.inner.attached_qps.fetch_add(1, Ordering::AcqRel);
        pd.inner.dependents.fetch_add(1, Ordering::AcqRel);
        id.inner.state.lock().qp = Some(Arc::clone(&inner));
        self.net.created(ResourceKind::Qp);
        Ok(LoopbackQp {
            inner,
            pd: Arc::clone(&pd.inner),
            net: Arc::clone(&self.net),
        })
    }

    fn register_memory(
        &self,
        pd: &LoopbackPd,
        addr: u64,
        len: usize,
        access: MemoryAccess,
    ) -> Result<LoopbackMr> {
        self.net.fail(FaultPoint::RegisterMemory, "ibv_reg_mr")?;
        if addr == 0 || len == 0 {
            return Err(ChannelError::Backend(format!(
                "ibv_reg_mr: invalid range addr={addr:#x}, len={len}"
            )));
        }
        let key = self.next_key();
        self.net
            .regions
            .lock()
            .insert(key, RemoteRegion { addr, len, access });
        pd.inner.dependents.fetch_add(1, Ordering::AcqRel);
        self.net.created(ResourceKind::Mr);
        Ok(LoopbackMr {
            addr,
            len,
            key,
            pd: Arc::clone(&pd.inner),
            net: Arc::clone(&self.net),
        })
    }

    fn wait_cq_event(&self, channel: &LoopbackCompChannel, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut pending = channel.inner.pending.lock();
        while *pending == 0 {
            if channel
                .inner
                .ready
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                break;
            }
        }
        if *pending == 0 {
            return Ok(false);
        }
        *pending -= 1;
        Ok(true)
    }

    fn req_notify(&self, cq: &LoopbackCq) -> Result<()> {
        cq.inner.armed.store(true, Ordering::Release);
        Ok(())
    }

    fn poll_cq(&self, cq: &LoopbackCq, out: &mut Vec<Completion>, max: usize) -> Result<usize> {
        if cq.inner.overrun.load(Ordering::Acquire) {
            return Err(ChannelError::Backend(
                "completion queue overrun".to_string(),
            ));
        }
        let mut entries = cq.inner.entries.lock();
        let count = entries.len().min(max);
        out.extend(entries.drain(..count));
        Ok(count)
    }

    fn post_recv(
        &self,
        qp: &LoopbackQp,
        wr_id: u64,
        mr: &LoopbackMr,
        addr: u64,
        len: u32,
    ) -> Result<()> {
        if !mr.contains(addr, len as usize) {
            return Err(ChannelError::Backend(format!(
                "ibv_post_recv: sge {addr:#x}+{len} outside region"
            )));
        }
        let posted = PostedRecv { wr_id, addr, len };
        let backlog = {
            let mut recv = qp.inner.recv.lock();
            match recv.backlog.pop_front() {
                Some(payload) => payload,
                None => {
                    if recv.posted.len() >= qp.inner.caps.max_recv_wr as usize {
                        return Err(ChannelError::Backend(
                            "ibv_post_recv: receive queue full".to_string(),
                        ));
                    }
                    recv.posted.push_back(posted);
                    return Ok(());
                }
            }
        };
        qp.inner.fill(posted, &backlog);
        Ok(())
    }

    fn post_send_inline(&self, qp: &LoopbackQp, wr_id: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > qp.inner.caps.max_inline_data as usize {
            return Err(ChannelError::Backend(format!(
                "ibv_post_send: {} bytes exceed inline limit {}",
                payload.len(),
                qp.inner.caps.max_inline_data
            )));
        }
        let Some(peer) = qp.inner.peer() else {
            qp.inner.complete(
                wr_id,
                CompletionOpcode::Send,
                CompletionStatus::Failed(WC_WR_FLUSH_ERR),
                0,
            );
            return Ok(());
        };
        peer.deliver(payload);
        qp.inner.complete(
            wr_id,
            CompletionOpcode::Send,
            CompletionStatus::Success,
            payload.len() as u32,
        );
        Ok(())
    }

    fn post_write(
        &self,
        qp: &LoopbackQp,
        wr_id: u64,
        mr: &LoopbackMr,
        local_addr: u64,
        len: u32,
        remote_addr: u64,
        rkey: u32,
    ) -> Result<()> {
        let fail = |status: u32| -> Result<()> {
            qp.inner.complete(
                wr_id,
                CompletionOpcode::RdmaWrite,
                CompletionStatus::Failed(status),
                0,
            );
            Ok(())
        };

        if !mr.contains(local_addr, len as usize) {
            return fail(WC_LOC_PROT_ERR);
        }
        if qp.inner.peer().is_none() {
            return fail(WC_WR_FLUSH_ERR);
        }
        if self.net.trip(FaultPoint::RemoteWrite) {
            return fail(WC_REM_ACCESS_ERR);
        }
        let permitted = self.net.regions.lock().get(&rkey).is_some_and(|region| {
            let end = remote_addr.checked_add(len as u64);
            region.access == MemoryAccess::RemoteWrite
                && remote_addr >= region.addr
                && end.is_some_and(|end| end <= region.addr + region.len as u64)
        });
        if !permitted {
            return fail(WC_REM_ACCESS_ERR);
        }
        // SAFETY: both ranges lie inside live registrations checked above.
        unsafe {
            std::ptr::copy(local_addr as *const u8, remote_addr as *mut u8, len as usize);
        }
        Ok(())
    }

    fn qp_num(&self, qp: &LoopbackQp) -> u32 {
        qp.inner.qp_num
    }
}
