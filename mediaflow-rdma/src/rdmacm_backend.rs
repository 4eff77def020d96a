//! [`Fabric`] over librdmacm and libibverbs, through sideway.
//!
//! The event channel and completion channel are switched to non-blocking mode
//! and waited on with `poll(2)`, so every wait is bounded. Queue pairs are
//! built on the verbs side and driven through the connection manager's
//! attributes (`Init` at creation, `RTR`/`RTS` before accept or on the
//! connect response).

use std::{
    io,
    mem::MaybeUninit,
    net::{IpAddr, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    ptr::null_mut,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rdma_mummy_sys::{
    ibv_ack_cq_events, ibv_cq, ibv_get_cq_event, ibv_post_send, ibv_req_notify_cq,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc_opcode, ibv_wr_opcode,
};
use sideway::{
    ibverbs::{
        AccessFlags,
        completion::{
            CompletionChannel, CompletionQueue as _, GenericCompletionQueue,
            PollCompletionQueueError, WorkCompletionOperationType, WorkCompletionStatus,
        },
        memory_region::MemoryRegion as VerbsRegion,
        protection_domain::ProtectionDomain,
        queue_pair::{
            GenericQueuePair, PostSendGuard, QueuePair as _, QueuePairState, QueuePairType,
            SetScatterGatherEntry, WorkRequestFlags,
        },
    },
    rdmacm::communication_manager::{
        ConnectionParameter, EventChannel, EventType, Identifier, PortSpace,
    },
};

use crate::{
    backend::{
        CmErrorKind, CmEvent, Completion, CompletionOpcode, CompletionStatus, Fabric,
        MemoryAccess, MemoryRegion, QueueCaps,
    },
    error::{ChannelError, Result},
};

const CONN_RETRY_COUNT: u8 = 7;
/// 7 means retry forever on receiver-not-ready.
const CONN_RNR_RETRY_COUNT: u8 = 7;

fn backend_error(op: &str, error: impl std::fmt::Display) -> ChannelError {
    ChannelError::Backend(format!("{op} failed: {error}"))
}

/// Waits up to `timeout` for `fd` to become readable.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ret = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
    if ret < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(backend_error("poll", error));
    }
    Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
}

fn conn_param(qp_number: u32) -> ConnectionParameter {
    let mut param = ConnectionParameter::new();
    param
        .setup_qp_number(qp_number)
        .setup_responder_resources(1)
        .setup_initiator_depth(1)
        .setup_retry_count(CONN_RETRY_COUNT)
        .setup_rnr_retry_count(CONN_RNR_RETRY_COUNT);
    param
}

fn access_flags(access: MemoryAccess) -> AccessFlags {
    match access {
        MemoryAccess::Local => AccessFlags::LocalWrite,
        MemoryAccess::RemoteWrite => AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
    }
}

fn translate_event(kind: EventType, status: i32) -> CmEvent<CmId> {
    let error = |kind| CmEvent::Error { kind, status };
    match kind {
        EventType::AddressResolved => CmEvent::AddrResolved,
        EventType::RouteResolved => CmEvent::RouteResolved,
        EventType::ConnectResponse => CmEvent::ConnectResponse,
        EventType::Established => CmEvent::Established,
        EventType::Disconnected => CmEvent::Disconnected,
        EventType::AddressError => error(CmErrorKind::Address),
        EventType::RouteError => error(CmErrorKind::Route),
        EventType::ConnectError => error(CmErrorKind::Connect),
        EventType::Unreachable => error(CmErrorKind::Unreachable),
        EventType::Rejected => error(CmErrorKind::Rejected),
        EventType::DeviceRemoval => error(CmErrorKind::DeviceRemoval),
        other => CmEvent::Other(other as u32),
    }
}

fn translate_opcode(opcode: u32) -> CompletionOpcode {
    match opcode {
        x if x == WorkCompletionOperationType::Send as u32 => CompletionOpcode::Send,
        x if x == WorkCompletionOperationType::Receive as u32 => CompletionOpcode::Recv,
        x if x == ibv_wc_opcode::IBV_WC_RDMA_WRITE as u32 => CompletionOpcode::RdmaWrite,
        other => CompletionOpcode::Other(other),
    }
}

fn translate_status(status: u32) -> CompletionStatus {
    if status == WorkCompletionStatus::Success as u32 {
        CompletionStatus::Success
    } else {
        CompletionStatus::Failed(status)
    }
}

pub struct CmEventChannel {
    channel: Arc<EventChannel>,
}

pub struct CmId {
    id: Arc<Identifier>,
}

impl CmId {
    fn device(&self) -> Result<Arc<sideway::ibverbs::device_context::DeviceContext>> {
        self.id
            .get_device_context()
            .map(|ctx| Arc::clone(&ctx))
            .ok_or_else(|| ChannelError::Backend("cm id is not bound to a device".to_string()))
    }

    fn move_qp(&self, qp: &QueuePair, state: QueuePairState) -> Result<()> {
        let attr = self
            .id
            .get_qp_attr(state)
            .map_err(|error| backend_error("rdma_init_qp_attr", error))?;
        qp.qp
            .lock()
            .modify(&attr)
            .map_err(|error| backend_error("ibv_modify_qp", error))
    }
}

pub struct RegisteredRegion {
    mr: Arc<VerbsRegion>,
    addr: u64,
    len: usize,
}

impl MemoryRegion for RegisteredRegion {
    fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub struct CompletionEvents {
    channel: Arc<CompletionChannel>,
}

pub struct QueuePair {
    qp: Mutex<GenericQueuePair>,
}

// SAFETY: librdmacm and libibverbs objects may be used from any thread.
// Queue-pair posting is serialized by the mutex, and sideway destroys each
// object exactly once when its last handle drops.
unsafe impl Send for CmEventChannel {}
unsafe impl Sync for CmEventChannel {}
unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}
unsafe impl Send for RegisteredRegion {}
unsafe impl Sync for RegisteredRegion {}
unsafe impl Send for CompletionEvents {}
unsafe impl Sync for CompletionEvents {}

/// Hardware fabric. Stateless: everything lives in the handles it returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct RdmaCmFabric;

impl RdmaCmFabric {
    pub fn new() -> Self {
        Self
    }
}

impl Fabric for RdmaCmFabric {
    type EventChannel = CmEventChannel;
    type CmId = CmId;
    type Pd = Arc<ProtectionDomain>;
    type Mr = RegisteredRegion;
    type CompChannel = CompletionEvents;
    type Cq = GenericCompletionQueue;
    type Qp = QueuePair;

    fn create_event_channel(&self) -> Result<CmEventChannel> {
        let channel =
            EventChannel::new().map_err(|error| backend_error("rdma_create_event_channel", error))?;
        channel
            .set_nonblocking(true)
            .map_err(|error| backend_error("fcntl(O_NONBLOCK)", error))?;
        Ok(CmEventChannel { channel })
    }

    fn create_id(&self, channel: &CmEventChannel) -> Result<CmId> {
        let id = channel
            .channel
            .create_id(PortSpace::Tcp)
            .map_err(|error| backend_error("rdma_create_id", error))?;
        Ok(CmId { id })
    }

    fn poll_cm_event(
        &self,
        channel: &CmEventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<CmId>>> {
        if !wait_readable(channel.channel.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let event = channel
            .channel
            .get_cm_event()
            .map_err(|error| backend_error("rdma_get_cm_event", error))?;
        let status = event.status();
        let translated = match event.event_type() {
            EventType::ConnectRequest => match event.cm_id() {
                Some(id) => CmEvent::ConnectRequest(CmId { id }),
                None => CmEvent::Other(EventType::ConnectRequest as u32),
            },
            kind => translate_event(kind, status),
        };
        // Dropping the event acknowledges it.
        drop(event);
        Ok(Some(translated))
    }

    fn resolve_addr(
        &self,
        id: &CmId,
        local: Option<IpAddr>,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        let local = local.map(|ip| SocketAddr::new(ip, 0));
        id.id
            .resolve_addr(local, remote, timeout)
            .map_err(|error| backend_error("rdma_resolve_addr", error))
    }

    fn resolve_route(&self, id: &CmId, timeout: Duration) -> Result<()> {
        id.id
            .resolve_route(timeout)
            .map_err(|error| backend_error("rdma_resolve_route", error))
    }

    fn listen(&self, id: &CmId, bind: SocketAddr, backlog: u32) -> Result<()> {
        id.id
            .bind_addr(bind)
            .map_err(|error| backend_error("rdma_bind_addr", error))?;
        id.id
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(|error| backend_error("rdma_listen", error))
    }

    fn connect(&self, id: &CmId, qp: &QueuePair) -> Result<()> {
        let qp_number = self.qp_num(qp);
        id.id
            .connect(conn_param(qp_number))
            .map_err(|error| backend_error("rdma_connect", error))
    }

    fn accept(&self, id: &CmId, qp: &QueuePair) -> Result<()> {
        id.move_qp(qp, QueuePairState::ReadyToReceive)?;
        id.move_qp(qp, QueuePairState::ReadyToSend)?;
        let qp_number = self.qp_num(qp);
        id.id
            .accept(conn_param(qp_number))
            .map_err(|error| backend_error("rdma_accept", error))
    }

    fn establish(&self, id: &CmId, qp: &QueuePair) -> Result<()> {
        id.move_qp(qp, QueuePairState::ReadyToReceive)?;
        id.move_qp(qp, QueuePairState::ReadyToSend)?;
        id.id
            .establish()
            .map_err(|error| backend_error("rdma_establish", error))
    }

    /// Destroying a request identifier that was never accepted refuses the
    /// connection, and callers drop `id` right after rejecting it.
    fn reject(&self, _id: &CmId) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self, id: &CmId) -> Result<()> {
        id.id
            .disconnect()
            .map_err(|error| backend_error("rdma_disconnect", error))
    }

    fn alloc_pd(&self, id: &CmId) -> Result<Arc<ProtectionDomain>> {
        id.device()?
            .alloc_pd()
            .map_err(|error| backend_error("ibv_alloc_pd", error))
    }

    fn create_comp_channel(&self, id: &CmId) -> Result<CompletionEvents> {
        let channel = CompletionChannel::new(&id.device()?)
            .map_err(|error| backend_error("ibv_create_comp_channel", error))?;
        channel
            .set_nonblocking(true)
            .map_err(|error| backend_error("fcntl(O_NONBLOCK)", error))?;
        Ok(CompletionEvents { channel })
    }

    fn create_cq(
        &self,
        id: &CmId,
        channel: &CompletionEvents,
        depth: u32,
    ) -> Result<GenericCompletionQueue> {
        let device = id.device()?;
        let mut cq_builder = device.create_cq_builder();
        cq_builder
            .setup_cqe(depth)
            .setup_comp_channel(&channel.channel, 0);
        let cq: GenericCompletionQueue = cq_builder
            .build()
            .map_err(|error| backend_error("ibv_create_cq", error))?
            .into();
        Ok(cq)
    }

    fn create_qp(
        &self,
        id: &CmId,
        pd: &Arc<ProtectionDomain>,
        cq: &GenericCompletionQueue,
        caps: QueueCaps,
    ) -> Result<QueuePair> {
        let mut qp_builder = pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::ReliableConnection)
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .setup_max_send_wr(caps.max_send_wr)
            .setup_max_recv_wr(caps.max_recv_wr)
            .setup_max_send_sge(1)
            .setup_max_recv_sge(1)
            .setup_max_inline_data(caps.max_inline_data);
        let qp: GenericQueuePair = qp_builder
            .build()
            .map_err(|error| backend_error("ibv_create_qp", error))?
            .into();
        let qp = QueuePair { qp: Mutex::new(qp) };
        id.move_qp(&qp, QueuePairState::Init)?;
        Ok(qp)
    }

    fn register_memory(
        &self,
        pd: &Arc<ProtectionDomain>,
        addr: u64,
        len: usize,
        access: MemoryAccess,
    ) -> Result<RegisteredRegion> {
        let mr = unsafe { pd.reg_mr(addr as usize, len, access_flags(access)) }.map_err(
            |error| {
                ChannelError::Backend(format!(
                    "ibv_reg_mr failed: addr={addr:#x}, len={len}, error={error}"
                ))
            },
        )?;
        Ok(RegisteredRegion { mr, addr, len })
    }

    fn wait_cq_event(&self, channel: &CompletionEvents, timeout: Duration) -> Result<bool> {
        if !wait_readable(channel.channel.as_raw_fd(), timeout)? {
            return Ok(false);
        }
        let mut cq: *mut ibv_cq = null_mut();
        let mut context = null_mut();
        let ret = unsafe {
            ibv_get_cq_event(
                channel.channel.comp_channel().as_ptr(),
                &raw mut cq,
                &raw mut context,
            )
        };
        if ret != 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(backend_error("ibv_get_cq_event", error));
        }
        unsafe { ibv_ack_cq_events(cq, 1) };
        Ok(true)
    }

    fn req_notify(&self, cq: &GenericCompletionQueue) -> Result<()> {
        let ret = unsafe { ibv_req_notify_cq(cq.cq().as_ptr(), 0) };
        if ret != 0 {
            return Err(backend_error(
                "ibv_req_notify_cq",
                io::Error::from_raw_os_error(ret),
            ));
        }
        Ok(())
    }

    fn poll_cq(
        &self,
        cq: &GenericCompletionQueue,
        out: &mut Vec<Completion>,
        _max: usize,
    ) -> Result<usize> {
        let before = out.len();
        match cq.start_poll() {
            Ok(mut poller) => {
                for wc in &mut poller {
                    out.push(Completion {
                        wr_id: wc.wr_id(),
                        status: translate_status(wc.status()),
                        opcode: translate_opcode(wc.opcode()),
                        byte_len: wc.byte_len(),
                        vendor_err: wc.vendor_err(),
                    });
                }
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => {}
            Err(error) => return Err(backend_error("ibv_poll_cq", error)),
        }
        Ok(out.len() - before)
    }

    fn post_recv(
        &self,
        qp: &QueuePair,
        wr_id: u64,
        mr: &RegisteredRegion,
        addr: u64,
        len: u32,
    ) -> Result<()> {
        let mut qp = qp.qp.lock();
        let mut guard = qp.start_post_recv();
        let wr = guard.construct_wr(wr_id);
        unsafe {
            wr.setup_sge(mr.lkey(), addr, len);
        }
        guard
            .post()
            .map_err(|error| backend_error("ibv_post_recv", error))
    }

    fn post_send_inline(&self, qp: &QueuePair, wr_id: u64, payload: &[u8]) -> Result<()> {
        let mut sge = ibv_sge {
            addr: payload.as_ptr() as u64,
            length: payload.len() as u32,
            lkey: 0,
        };
        let mut wr = unsafe { MaybeUninit::<ibv_send_wr>::zeroed().assume_init() };
        wr.wr_id = wr_id;
        wr.next = null_mut();
        wr.sg_list = &raw mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0 | ibv_send_flags::IBV_SEND_INLINE.0;

        let qp = qp.qp.lock();
        let mut bad: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(qp.qp().as_ptr(), &raw mut wr, &raw mut bad) };
        if ret != 0 {
            return Err(backend_error(
                "ibv_post_send(SEND)",
                io::Error::from_raw_os_error(ret),
            ));
        }
        Ok(())
    }

    fn post_write(
        &self,
        qp: &QueuePair,
        wr_id: u64,
        mr: &RegisteredRegion,
        local_addr: u64,
        len: u32,
        remote_addr: u64,
        rkey: u32,
    ) -> Result<()> {
        let mut qp = qp.qp.lock();
        let mut guard = qp.start_post_send();
        let wr = guard
            .construct_wr(wr_id, WorkRequestFlags::none())
            .setup_write(rkey, remote_addr);
        unsafe {
            wr.setup_sge(mr.lkey(), local_addr, len);
        }
        guard
            .post()
            .map_err(|error| backend_error("ibv_post_send(RDMA_WRITE)", error))
    }

    fn qp_num(&self, qp: &QueuePair) -> u32 {
        qp.qp.lock().qp_number()
    }
}
