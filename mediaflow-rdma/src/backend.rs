//! The RDMA substrate a channel is built on.
//!
//! [`Fabric`] mirrors the connection-manager and verbs primitives one-to-one;
//! a channel never reaches past it. Every handle type releases its resource
//! on drop, so the channel controls teardown order purely by the order in
//! which it drops handles.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use crate::error::Result;

/// Access granted to a registered region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryAccess {
    /// Local read/write only (control records, transmit sources).
    Local,
    /// Local write plus remote write (receive destinations).
    RemoteWrite,
}

/// Connection-manager error event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmErrorKind {
    Address,
    Route,
    Connect,
    Unreachable,
    Rejected,
    DeviceRemoval,
}

#[derive(Debug)]
pub enum CmEvent<Id> {
    AddrResolved,
    RouteResolved,
    /// A peer wants to connect. Carries the new identifier for that peer.
    ConnectRequest(Id),
    /// The peer accepted; the active side finishes with [`Fabric::establish`].
    ConnectResponse,
    Established,
    Disconnected,
    Error { kind: CmErrorKind, status: i32 },
    /// Anything the state machine does not act on.
    Other(u32),
}

/// `IBV_WC_WR_FLUSH_ERR`: the queue pair left the ready states.
pub const WC_WR_FLUSH_ERR: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Raw provider status code (`ibv_wc_status`).
    Failed(u32),
}

impl CompletionStatus {
    /// Work requests flushed after the connection went down.
    pub fn is_flush(self) -> bool {
        self == Self::Failed(WC_WR_FLUSH_ERR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOpcode {
    Send,
    RdmaWrite,
    Recv,
    Other(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
    pub vendor_err: u32,
}

/// Queue-pair capabilities requested at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline_data: u32,
}

pub trait MemoryRegion: Send + Sync {
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
    fn addr(&self) -> u64;
    fn len(&self) -> usize;

    fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr() && end <= self.addr() + self.len() as u64
    }
}

pub trait Fabric: Send + Sync + 'static {
    type EventChannel: Send + Sync;
    type CmId: Send + Sync;
    type Pd: Send + Sync;
    type Mr: MemoryRegion;
    type CompChannel: Send + Sync;
    type Cq: Send + Sync;
    type Qp: Send + Sync;

    // Connection manager.
    fn create_event_channel(&self) -> Result<Self::EventChannel>;
    fn create_id(&self, channel: &Self::EventChannel) -> Result<Self::CmId>;
    /// Waits up to `timeout` for the next event; `Ok(None)` on timeout.
    fn poll_cm_event(
        &self,
        channel: &Self::EventChannel,
        timeout: Duration,
    ) -> Result<Option<CmEvent<Self::CmId>>>;
    fn resolve_addr(
        &self,
        id: &Self::CmId,
        local: Option<IpAddr>,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<()>;
    fn resolve_route(&self, id: &Self::CmId, timeout: Duration) -> Result<()>;
    fn listen(&self, id: &Self::CmId, bind: SocketAddr, backlog: u32) -> Result<()>;
    /// Sends a connect request carrying the number of `qp`.
    fn connect(&self, id: &Self::CmId, qp: &Self::Qp) -> Result<()>;
    /// Moves `qp` to ready-to-send and accepts the request on `id`.
    fn accept(&self, id: &Self::CmId, qp: &Self::Qp) -> Result<()>;
    /// Active side, on [`CmEvent::ConnectResponse`]: readies `qp` and
    /// completes the handshake.
    fn establish(&self, id: &Self::CmId, qp: &Self::Qp) -> Result<()>;
    fn reject(&self, id: &Self::CmId) -> Result<()>;
    fn disconnect(&self, id: &Self::CmId) -> Result<()>;

    // Verbs resources, created on the device the identifier resolved to.
    fn alloc_pd(&self, id: &Self::CmId) -> Result<Self::Pd>;
    fn create_comp_channel(&self, id: &Self::CmId) -> Result<Self::CompChannel>;
    fn create_cq(&self, id: &Self::CmId, channel: &Self::CompChannel, depth: u32)
    -> Result<Self::Cq>;
    fn create_qp(
        &self,
        id: &Self::CmId,
        pd: &Self::Pd,
        cq: &Self::Cq,
        caps: QueueCaps,
    ) -> Result<Self::Qp>;
    fn register_memory(
        &self,
        pd: &Self::Pd,
        addr: u64,
        len: usize,
        access: MemoryAccess,
    ) -> Result<Self::Mr>;

    // Completions.
    /// Waits up to `timeout` for a completion event, acknowledging it.
    /// Returns whether an event arrived.
    fn wait_cq_event(&self, channel: &Self::CompChannel, timeout: Duration) -> Result<bool>;
    fn req_notify(&self, cq: &Self::Cq) -> Result<()>;
    /// Appends drained completions to `out`; returns how many were added.
    /// `max` is a hint, backends that drain the queue in one pass ignore it.
    fn poll_cq(&self, cq: &Self::Cq, out: &mut Vec<Completion>, max: usize) -> Result<usize>;

    // Work requests.
    fn post_recv(&self, qp: &Self::Qp, wr_id: u64, mr: &Self::Mr, addr: u64, len: u32)
    -> Result<()>;
    /// Signaled inline send; `payload` is copied before returning.
    fn post_send_inline(&self, qp: &Self::Qp, wr_id: u64, payload: &[u8]) -> Result<()>;
    /// Unsignaled remote write. A failure still produces an error completion.
    #[allow(clippy::too_many_arguments)]
    fn post_write(
        &self,
        qp: &Self::Qp,
        wr_id: u64,
        mr: &Self::Mr,
        local_addr: u64,
        len: u32,
        remote_addr: u64,
        rkey: u32,
    ) -> Result<()>;
    fn qp_num(&self, qp: &Self::Qp) -> u32;
}
