use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    api::{BufferRef, BufferSpec, ChannelConfig, ChannelTuning, Endpoint, NotifyFn, Role},
    backend::{Fabric, MemoryRegion},
    connection::{self, ConnectionState},
    control_protocol::WireMessage,
    error::{ChannelError, Result},
    event_loop::WorkRequest,
    registration::Registrations,
    slots::{SlotStatus, SlotTable, WriteTarget},
    stats::{ChannelStats, StatsSnapshot},
};

const LISTEN_BACKLOG: u32 = 1;

/// What the application can conclude from the channel's current condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Still establishing.
    Connecting,
    Healthy,
    /// A completion failed; the channel will make no further progress.
    Faulted,
    /// Establishment failed.
    Failed,
    /// The peer disconnected or the channel was torn down.
    Closed,
}

/// What teardown released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub threads_spawned: usize,
    pub threads_joined: usize,
    pub regions_registered: usize,
    pub regions_released: usize,
}

/// RDMA-facing handles. Field order is release order.
pub(crate) struct Resources<F: Fabric> {
    pub(crate) qp: Option<F::Qp>,
    pub(crate) cq: Option<F::Cq>,
    pub(crate) comp_channel: Option<F::CompChannel>,
    pub(crate) registrations: Option<Registrations<F>>,
    pub(crate) pd: Option<F::Pd>,
    /// Identifier carrying the connection: the active id, or the one
    /// accepted from the listener.
    pub(crate) conn_id: Option<F::CmId>,
    pub(crate) listen_id: Option<F::CmId>,
    pub(crate) event_channel: Option<F::EventChannel>,
}

impl<F: Fabric> Default for Resources<F> {
    fn default() -> Self {
        Self {
            qp: None,
            cq: None,
            comp_channel: None,
            registrations: None,
            pd: None,
            conn_id: None,
            listen_id: None,
            event_channel: None,
        }
    }
}

impl<F: Fabric> Resources<F> {
    /// Releases every handle that exists, in dependency order. Returns the
    /// number of registered regions released.
    fn release(&mut self, fabric: &F, name: &str) -> usize {
        if let (Some(id), true) = (&self.conn_id, self.qp.is_some()) {
            if let Err(error) = fabric.disconnect(id) {
                log::debug!("disconnect during teardown failed: name={}, error={}", name, error);
            }
        }

        let regions = self.release_connection(name);
        drop(self.listen_id.take());
        if self.event_channel.take().is_some() {
            log::debug!("event channel destroyed: name={}", name);
        }
        regions
    }

    /// Releases the handles built for one connection, down to its
    /// identifier, keeping the listener and the event channel.
    pub(crate) fn release_connection(&mut self, name: &str) -> usize {
        if self.qp.take().is_some() {
            log::debug!("queue pair destroyed: name={}", name);
        }
        if self.cq.take().is_some() {
            log::debug!("completion queue destroyed: name={}", name);
        }
        if self.comp_channel.take().is_some() {
            log::debug!("completion channel destroyed: name={}", name);
        }
        let regions = self
            .registrations
            .take()
            .map(|registrations| registrations.region_count())
            .unwrap_or(0);
        if regions > 0 {
            log::debug!("memory deregistered: name={}, regions={}", name, regions);
        }
        if self.pd.take().is_some() {
            log::debug!("protection domain released: name={}", name);
        }
        drop(self.conn_id.take());
        regions
    }
}

/// State shared by the application-facing handle and both background threads.
pub(crate) struct ChannelShared<F: Fabric> {
    pub(crate) fabric: F,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) endpoint: Endpoint,
    pub(crate) buffers: Vec<BufferSpec>,
    pub(crate) notify: Option<NotifyFn>,
    pub(crate) tuning: ChannelTuning,
    pub(crate) slots: SlotTable,
    pub(crate) resources: RwLock<Resources<F>>,
    pub(crate) stats: ChannelStats,
    state: AtomicU8,
    connected: AtomicBool,
    faulted: AtomicBool,
    pub(crate) cm_stop: AtomicBool,
    pub(crate) event_stop: AtomicBool,
    pub(crate) event_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) threads_spawned: AtomicUsize,
    pub(crate) regions_registered: AtomicUsize,
    /// Regions released before teardown, by a refused connect request.
    pub(crate) regions_released: AtomicUsize,
}

impl<F: Fabric> ChannelShared<F> {
    fn new(fabric: F, config: ChannelConfig) -> Self {
        let slots = SlotTable::new(config.role, &config.buffers);
        Self {
            fabric,
            name: config.name,
            role: config.role,
            endpoint: config.endpoint,
            buffers: config.buffers,
            notify: config.notify,
            tuning: config.tuning,
            slots,
            resources: RwLock::new(Resources::default()),
            stats: ChannelStats::default(),
            state: AtomicU8::new(ConnectionState::Init as u8),
            connected: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            cm_stop: AtomicBool::new(false),
            event_stop: AtomicBool::new(false),
            event_thread: Mutex::new(None),
            threads_spawned: AtomicUsize::new(0),
            regions_registered: AtomicUsize::new(0),
            regions_released: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            log::debug!(
                "connection state: name={}, from={:?}, to={:?}",
                self.name,
                previous,
                state
            );
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Announces slot `index` to the producer under generation `seq`.
    pub(crate) fn post_credit(&self, resources: &Resources<F>, index: usize, seq: u32) -> Result<()> {
        let (Some(qp), Some(registrations)) = (&resources.qp, &resources.registrations) else {
            return Err(ChannelError::NotConnected);
        };
        let (Some(mr), Some(capacity)) = (registrations.slot(index), self.slots.capacity(index))
        else {
            return Err(ChannelError::BufferNotHeld { index });
        };
        let message = WireMessage::BufferDone {
            slot: index as u16,
            seq,
            remote_addr: mr.addr(),
            rkey: mr.rkey(),
            capacity: capacity as u32,
        };
        self.fabric
            .post_send_inline(qp, WorkRequest::Credit(index).wr_id(), &message.encode())
            .map_err(|error| ChannelError::Transport(error.to_string()))?;
        self.stats.credits_sent();
        Ok(())
    }

    /// Writes `len` bytes of slot `index` into the consumer's buffer and
    /// announces them.
    fn post_frame(
        &self,
        resources: &Resources<F>,
        index: usize,
        target: WriteTarget,
    ) -> Result<()> {
        let (Some(qp), Some(registrations)) = (&resources.qp, &resources.registrations) else {
            return Err(ChannelError::NotConnected);
        };
        let Some(mr) = registrations.slot(index) else {
            return Err(ChannelError::BufferNotHeld { index });
        };
        if target.len > 0 {
            self.fabric
                .post_write(
                    qp,
                    WorkRequest::Write(index).wr_id(),
                    mr,
                    mr.addr(),
                    target.len,
                    target.remote_addr,
                    target.rkey,
                )
                .map_err(|error| ChannelError::Transport(error.to_string()))?;
        }
        let message = WireMessage::BufferReady {
            slot: index as u16,
            seq: target.seq,
            len: target.len,
        };
        self.fabric
            .post_send_inline(qp, WorkRequest::Ready(index).wr_id(), &message.encode())
            .map_err(|error| ChannelError::Transport(error.to_string()))?;
        Ok(())
    }
}

/// A zero-copy, credit-based buffer channel to one peer.
///
/// `create` returns as soon as the connection attempt is under way; the
/// channel becomes usable once [`RdmaChannel::is_connected`] turns true.
/// Dropping the channel tears it down exactly like [`RdmaChannel::free`].
pub struct RdmaChannel<F: Fabric> {
    shared: Arc<ChannelShared<F>>,
    cm_thread: Option<JoinHandle<()>>,
    report: Option<TeardownReport>,
}

impl<F: Fabric> RdmaChannel<F> {
    pub fn create(fabric: F, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        log::debug!("create channel: {:?}", config);

        let mut channel = Self {
            shared: Arc::new(ChannelShared::new(fabric, config)),
            cm_thread: None,
            report: None,
        };
        // Any early return drops `channel`, which unwinds what was built.
        channel.open_endpoint()?;
        channel.spawn_connection_manager()?;
        Ok(channel)
    }

    fn open_endpoint(&self) -> Result<()> {
        let shared = &self.shared;
        let fabric = &shared.fabric;
        let mut guard = shared.resources.write();
        let resources = &mut *guard;

        let event_channel = fabric.create_event_channel().map_err(|error| {
            log::error!("create event channel failed: name={}, error={}", shared.name, error);
            ChannelError::Allocation(error.to_string())
        })?;
        let event_channel = resources.event_channel.insert(event_channel);
        let id = fabric.create_id(event_channel).map_err(|error| {
            log::error!("create cm id failed: name={}, error={}", shared.name, error);
            ChannelError::Allocation(error.to_string())
        })?;

        match shared.endpoint {
            Endpoint::Listen { bind } => {
                let id = resources.listen_id.insert(id);
                fabric.listen(id, bind, LISTEN_BACKLOG).map_err(|error| {
                    log::error!(
                        "listen failed: name={}, bind={}, error={}",
                        shared.name,
                        bind,
                        error
                    );
                    ChannelError::Transport(error.to_string())
                })?;
                shared.set_state(ConnectionState::Listening);
                log::info!("listening: name={}, role={}, bind={}", shared.name, shared.role, bind);
            }
            Endpoint::Connect { local, remote } => {
                let id = resources.conn_id.insert(id);
                fabric
                    .resolve_addr(id, local, remote, shared.tuning.addr_resolve_timeout)
                    .map_err(|error| {
                        log::error!(
                            "resolve address failed: name={}, remote={}, error={}",
                            shared.name,
                            remote,
                            error
                        );
                        ChannelError::AddressResolution(error.to_string())
                    })?;
                shared.set_state(ConnectionState::AddrResolving);
                log::info!(
                    "connecting: name={}, role={}, remote={}",
                    shared.name,
                    shared.role,
                    remote
                );
            }
        }
        Ok(())
    }

    fn spawn_connection_manager(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("mfrdma-cm-{}", self.shared.name))
            .spawn(move || connection::run(shared))
            .map_err(|error| {
                log::error!(
                    "spawn connection thread failed: name={}, error={}",
                    self.shared.name,
                    error
                );
                ChannelError::Threading(error.to_string())
            })?;
        self.shared.threads_spawned.fetch_add(1, Ordering::Relaxed);
        self.cm_thread = Some(handle);
        Ok(())
    }

    /// Takes the lowest-indexed slot that is ready for the application, or
    /// `None` if there is none or the channel is not connected.
    pub fn acquire(&self) -> Option<BufferRef> {
        if !self.shared.is_connected() {
            return None;
        }
        self.shared.slots.acquire()
    }

    /// Hands a slot back. On the receiver this returns the credit to the
    /// producer; on the transmitter it writes `buffer.len()` bytes to the
    /// consumer and announces them. Nothing changes on error.
    pub fn release(&self, buffer: BufferRef) -> Result<()> {
        let shared = &self.shared;
        if !shared.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let index = shared.slots.find(&buffer)?;
        let resources = shared.resources.read();

        match shared.role {
            Role::Receiver => {
                let (previous, seq) = shared.slots.begin_receiver_release(index)?;
                if let Err(error) = shared.post_credit(&resources, index, seq) {
                    shared.slots.revert_receiver_release(index, previous);
                    log::error!(
                        "post credit failed: name={}, slot={}, error={}",
                        shared.name,
                        index,
                        error
                    );
                    return Err(error);
                }
            }
            Role::Transmitter => {
                let target = shared.slots.begin_transmitter_release(index, buffer.len())?;
                if let Err(error) = shared.post_frame(&resources, index, target) {
                    shared.slots.revert_transmitter_release(index);
                    log::error!(
                        "post frame failed: name={}, slot={}, len={}, error={}",
                        shared.name,
                        index,
                        buffer.len(),
                        error
                    );
                    return Err(error);
                }
                shared.stats.buffers_sent();
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// A closed or failed connection outranks a completion fault.
    pub fn health(&self) -> ChannelHealth {
        match self.shared.state() {
            ConnectionState::Error => ChannelHealth::Failed,
            ConnectionState::Closed => ChannelHealth::Closed,
            _ if self.shared.is_faulted() => ChannelHealth::Faulted,
            ConnectionState::Established => ChannelHealth::Healthy,
            _ => ChannelHealth::Connecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn slot_status(&self, index: usize) -> Option<SlotStatus> {
        self.shared.slots.status(index)
    }

    /// Stops both background threads and releases every RDMA resource.
    /// Caller memory is left untouched.
    pub fn free(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        if let Some(report) = self.report {
            return report;
        }
        let shared = &self.shared;
        let started_at = Instant::now();
        shared.cm_stop.store(true, Ordering::Release);
        shared.event_stop.store(true, Ordering::Release);

        let mut threads_joined = 0;
        let event_thread = shared.event_thread.lock().take();
        threads_joined += join_thread(&shared.name, "event", event_thread);
        threads_joined += join_thread(&shared.name, "connection", self.cm_thread.take());
        // The connection thread may have spawned the event thread after the
        // first check.
        let late_event_thread = shared.event_thread.lock().take();
        threads_joined += join_thread(&shared.name, "event", late_event_thread);

        let regions_released = shared.resources.write().release(&shared.fabric, &shared.name)
            + shared.regions_released.load(Ordering::Relaxed);
        shared.set_connected(false);
        if shared.state() != ConnectionState::Error {
            shared.set_state(ConnectionState::Closed);
        }

        let report = TeardownReport {
            threads_spawned: shared.threads_spawned.load(Ordering::Relaxed),
            threads_joined,
            regions_registered: shared.regions_registered.load(Ordering::Relaxed),
            regions_released,
        };
        log::info!(
            "channel freed: name={}, threads_joined={}, regions_released={}, elapsed_ms={:.3}",
            shared.name,
            report.threads_joined,
            report.regions_released,
            started_at.elapsed().as_secs_f64() * 1000.0
        );
        self.report = Some(report);
        report
    }
}

impl<F: Fabric> Drop for RdmaChannel<F> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn join_thread(name: &str, kind: &str, handle: Option<JoinHandle<()>>) -> usize {
    let Some(handle) = handle else {
        return 0;
    };
    if handle.join().is_err() {
        log::error!("{} thread panicked: name={}", kind, name);
    }
    1
}
