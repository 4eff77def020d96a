//! Connection establishment, driven by its own thread.
//!
//! ```text
//! active:   Init → AddrResolving → RouteResolving → ResourcesReady → Connecting → Established
//! passive:  Init → Listening ─────────────────────→ ResourcesReady → Connecting → Established
//!                       any resolving/connecting state → Error
//!                                             Established → Closed (peer disconnect)
//! ```
//!
//! There is no retry: `Error` is terminal and the channel must be recreated.

use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::Instant,
};

use crate::{
    api::Role,
    backend::{CmEvent, Fabric, QueueCaps},
    channel::{ChannelShared, Resources},
    control_protocol::MESSAGE_BYTES,
    error::{ChannelError, Result},
    event_loop,
    registration::Registrations,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    AddrResolving = 1,
    RouteResolving = 2,
    /// Passive endpoint waiting for its peer.
    Listening = 3,
    ResourcesReady = 4,
    Connecting = 5,
    Established = 6,
    Error = 7,
    /// The peer disconnected or the channel was torn down.
    Closed = 8,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::AddrResolving,
            2 => Self::RouteResolving,
            3 => Self::Listening,
            4 => Self::ResourcesReady,
            5 => Self::Connecting,
            6 => Self::Established,
            7 => Self::Error,
            _ => Self::Closed,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }
}

/// Queue sizing for `slots` slots. Every slot can have one control send and,
/// on the transmitter, one unsignaled write outstanding; every slot has one
/// control receive posted.
pub(crate) fn queue_caps(slots: usize) -> QueueCaps {
    let slots = slots as u32;
    QueueCaps {
        max_send_wr: slots * 2,
        max_recv_wr: slots,
        max_inline_data: MESSAGE_BYTES as u32,
    }
}

pub(crate) fn cq_depth(caps: QueueCaps) -> u32 {
    (caps.max_send_wr + caps.max_recv_wr) * 2
}

enum Step {
    Continue,
    Stop,
}

/// Connection thread body. Polls the event channel in bounded slices so it
/// notices the stop flag and resolution deadlines.
pub(crate) fn run<F: Fabric>(shared: Arc<ChannelShared<F>>) {
    let mut phase = (shared.state(), Instant::now());

    while !shared.cm_stop.load(Ordering::Acquire) {
        let state = shared.state();
        if state.is_terminal() {
            break;
        }
        if state != phase.0 {
            phase = (state, Instant::now());
        }
        let limit = match state {
            ConnectionState::AddrResolving => Some(shared.tuning.addr_resolve_timeout),
            ConnectionState::RouteResolving => Some(shared.tuning.route_resolve_timeout),
            _ => None,
        };
        if limit.is_some_and(|limit| phase.1.elapsed() >= limit) {
            log::error!(
                "resolution timed out: name={}, state={:?}",
                shared.name,
                state
            );
            shared.set_state(ConnectionState::Error);
            break;
        }

        let event = {
            let resources = shared.resources.read();
            let Some(channel) = resources.event_channel.as_ref() else {
                break;
            };
            shared
                .fabric
                .poll_cm_event(channel, shared.tuning.cm_poll_interval)
        };
        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(error) => {
                log::error!("poll cm event failed: name={}, error={}", shared.name, error);
                shared.set_state(ConnectionState::Error);
                break;
            }
        };

        match handle_event(&shared, state, event) {
            Ok(Step::Continue) => {}
            Ok(Step::Stop) => break,
            Err(error) => {
                log::error!(
                    "connection failed: name={}, state={:?}, error={}",
                    shared.name,
                    state,
                    error
                );
                shared.set_state(ConnectionState::Error);
                break;
            }
        }
    }
    log::debug!(
        "connection thread exiting: name={}, state={:?}",
        shared.name,
        shared.state()
    );
}

fn handle_event<F: Fabric>(
    shared: &Arc<ChannelShared<F>>,
    state: ConnectionState,
    event: CmEvent<F::CmId>,
) -> Result<Step> {
    let fabric = &shared.fabric;
    match (state, event) {
        (ConnectionState::AddrResolving, CmEvent::AddrResolved) => {
            let resources = shared.resources.read();
            let id = resources.conn_id.as_ref().ok_or(ChannelError::NotConnected)?;
            fabric
                .resolve_route(id, shared.tuning.route_resolve_timeout)
                .map_err(|error| ChannelError::AddressResolution(error.to_string()))?;
            drop(resources);
            shared.set_state(ConnectionState::RouteResolving);
            Ok(Step::Continue)
        }
        (ConnectionState::RouteResolving, CmEvent::RouteResolved) => {
            setup_resources(shared, None)?;
            let resources = shared.resources.read();
            let (Some(id), Some(qp)) = (&resources.conn_id, &resources.qp) else {
                return Err(ChannelError::NotConnected);
            };
            fabric
                .connect(id, qp)
                .map_err(|error| ChannelError::Transport(error.to_string()))?;
            drop(resources);
            shared.set_state(ConnectionState::Connecting);
            Ok(Step::Continue)
        }
        (ConnectionState::Listening, CmEvent::ConnectRequest(id)) => {
            log::info!("connect request received: name={}", shared.name);
            let accepted = setup_resources(shared, Some(id)).and_then(|()| {
                let resources = shared.resources.read();
                let (Some(id), Some(qp)) = (&resources.conn_id, &resources.qp) else {
                    return Err(ChannelError::NotConnected);
                };
                fabric
                    .accept(id, qp)
                    .map_err(|error| ChannelError::Transport(error.to_string()))
            });
            if let Err(error) = accepted {
                refuse_request(shared);
                return Err(error);
            }
            shared.set_state(ConnectionState::Connecting);
            Ok(Step::Continue)
        }
        (_, CmEvent::ConnectRequest(id)) => {
            log::warn!(
                "rejecting extra connect request: name={}, state={:?}",
                shared.name,
                state
            );
            if let Err(error) = fabric.reject(&id) {
                log::warn!("reject failed: name={}, error={}", shared.name, error);
            }
            Ok(Step::Continue)
        }
        (ConnectionState::Connecting, CmEvent::ConnectResponse) => {
            {
                let resources = shared.resources.read();
                let (Some(id), Some(qp)) = (&resources.conn_id, &resources.qp) else {
                    return Err(ChannelError::NotConnected);
                };
                fabric
                    .establish(id, qp)
                    .map_err(|error| ChannelError::Transport(error.to_string()))?;
            }
            on_established(shared)?;
            Ok(Step::Continue)
        }
        (ConnectionState::Connecting, CmEvent::Established) => {
            on_established(shared)?;
            Ok(Step::Continue)
        }
        (ConnectionState::Established, CmEvent::Disconnected) => {
            log::info!("peer disconnected: name={}", shared.name);
            shared.set_connected(false);
            shared.set_state(ConnectionState::Closed);
            Ok(Step::Stop)
        }
        (_, CmEvent::Error { kind, status }) => {
            log::error!(
                "cm error event: name={}, state={:?}, kind={:?}, status={}",
                shared.name,
                state,
                kind,
                status
            );
            shared.set_state(ConnectionState::Error);
            Ok(Step::Stop)
        }
        (_, CmEvent::Disconnected) => {
            log::error!(
                "disconnected before establishment: name={}, state={:?}",
                shared.name,
                state
            );
            shared.set_state(ConnectionState::Error);
            Ok(Step::Stop)
        }
        (state, event) => {
            log::debug!(
                "ignoring cm event: name={}, state={:?}, event={}",
                shared.name,
                state,
                event_name(&event)
            );
            Ok(Step::Continue)
        }
    }
}

fn event_name<Id>(event: &CmEvent<Id>) -> String {
    match event {
        CmEvent::AddrResolved => "addr_resolved".to_string(),
        CmEvent::RouteResolved => "route_resolved".to_string(),
        CmEvent::ConnectRequest(_) => "connect_request".to_string(),
        CmEvent::ConnectResponse => "connect_response".to_string(),
        CmEvent::Established => "established".to_string(),
        CmEvent::Disconnected => "disconnected".to_string(),
        CmEvent::Error { kind, .. } => format!("error({kind:?})"),
        CmEvent::Other(raw) => format!("other({raw})"),
    }
}

/// Refuses the pending request after a failed accept and drops everything
/// built for it, so the peer sees a rejection.
fn refuse_request<F: Fabric>(shared: &ChannelShared<F>) {
    let mut resources = shared.resources.write();
    if let Some(id) = resources.conn_id.as_ref() {
        if let Err(error) = shared.fabric.reject(id) {
            log::warn!("reject failed: name={}, error={}", shared.name, error);
        }
    }
    let regions = resources.release_connection(&shared.name);
    shared.regions_released.fetch_add(regions, Ordering::Relaxed);
    log::info!(
        "connect request refused: name={}, regions_released={}",
        shared.name,
        regions
    );
}

/// Builds the verbs resources on the connection identifier and posts one
/// control receive per slot. Each handle is stored as soon as it exists so
/// teardown finds it whatever fails next.
fn setup_resources<F: Fabric>(shared: &ChannelShared<F>, accepted: Option<F::CmId>) -> Result<()> {
    let fabric = &shared.fabric;
    let name = shared.name.as_str();
    let mut guard = shared.resources.write();
    let resources: &mut Resources<F> = &mut guard;
    if let Some(id) = accepted {
        resources.conn_id = Some(id);
    }
    let id = resources.conn_id.as_ref().ok_or(ChannelError::NotConnected)?;
    let alloc = |what: &'static str, error: ChannelError| {
        log::error!("{} failed: name={}, error={}", what, name, error);
        ChannelError::Allocation(format!("{what}: {error}"))
    };

    let caps = queue_caps(shared.slots.len());
    let pd = &*resources
        .pd
        .insert(fabric.alloc_pd(id).map_err(|error| alloc("alloc pd", error))?);
    let comp_channel = &*resources.comp_channel.insert(
        fabric
            .create_comp_channel(id)
            .map_err(|error| alloc("create completion channel", error))?,
    );
    let cq = &*resources.cq.insert(
        fabric
            .create_cq(id, comp_channel, cq_depth(caps))
            .map_err(|error| alloc("create completion queue", error))?,
    );
    let qp = &*resources
        .qp
        .insert(fabric.create_qp(id, pd, cq, caps).map_err(|error| alloc("create queue pair", error))?);

    let registrations = &*resources.registrations.insert(Registrations::register_all(
        fabric,
        pd,
        shared.role,
        &shared.buffers,
    )?);
    shared
        .regions_registered
        .store(registrations.region_count(), Ordering::Relaxed);

    for index in 0..registrations.slot_count() {
        registrations
            .post_control_recv(fabric, qp, index)
            .map_err(|error| alloc("post control receive", error))?;
    }

    shared.set_state(ConnectionState::ResourcesReady);
    log::debug!(
        "resources ready: name={}, qp_num={}, slots={}, max_send_wr={}, max_recv_wr={}",
        name,
        fabric.qp_num(qp),
        registrations.slot_count(),
        caps.max_send_wr,
        caps.max_recv_wr
    );
    Ok(())
}

/// Seeds credits on the receiver, starts the completion thread, then
/// publishes `connected`.
fn on_established<F: Fabric>(shared: &Arc<ChannelShared<F>>) -> Result<()> {
    if shared.role == Role::Receiver {
        let resources = shared.resources.read();
        for index in 0..shared.slots.len() {
            let previous = shared.slots.seq(index).unwrap_or(0);
            let Some(seq) = shared.slots.grant_credit(index) else {
                continue;
            };
            if let Err(error) = shared.post_credit(&resources, index, seq) {
                shared.slots.revoke_credit(index, previous);
                return Err(error);
            }
        }
    }

    if shared.cm_stop.load(Ordering::Acquire) {
        return Ok(());
    }
    let event_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("mfrdma-ev-{}", shared.name))
        .spawn(move || event_loop::run(event_shared))
        .map_err(|error| ChannelError::Threading(error.to_string()))?;
    shared.threads_spawned.fetch_add(1, Ordering::Relaxed);
    *shared.event_thread.lock() = Some(handle);

    shared.set_connected(true);
    shared.set_state(ConnectionState::Established);
    log::info!(
        "connection established: name={}, role={}, slots={}",
        shared.name,
        shared.role,
        shared.slots.len()
    );
    Ok(())
}
