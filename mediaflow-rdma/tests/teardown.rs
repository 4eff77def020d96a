mod common;

use std::{net::SocketAddr, time::Duration};

use common::{SlotMemory, localhost, wait_until};
use mediaflow_rdma::{
    ChannelConfig, ChannelError, ChannelHealth, ChannelTuning, ConnectionState, Endpoint,
    ErrorKind, FaultPoint, LoopbackFabric, RdmaChannel, ResourceKind, Role,
};

const SLOTS: usize = 3;

fn fast_tuning() -> ChannelTuning {
    ChannelTuning {
        addr_resolve_timeout: Duration::from_millis(100),
        route_resolve_timeout: Duration::from_millis(100),
        cm_poll_interval: Duration::from_millis(10),
        cq_wait_interval: Duration::from_millis(10),
        low_latency: false,
    }
}

fn connector(remote: SocketAddr, memory: &mut SlotMemory) -> ChannelConfig {
    ChannelConfig::new(
        "connector",
        Role::Transmitter,
        Endpoint::Connect {
            local: None,
            remote,
        },
        memory.specs(),
    )
    .with_tuning(fast_tuning())
}

fn listener(bind: SocketAddr, memory: &mut SlotMemory) -> ChannelConfig {
    ChannelConfig::new(
        "listener",
        Role::Receiver,
        Endpoint::Listen { bind },
        memory.specs(),
    )
    .with_tuning(fast_tuning())
}

fn assert_clean(fabric: &LoopbackFabric, case: &str) {
    let ledger = fabric.ledger();
    assert_eq!(ledger.live_total(), 0, "{case}: leaked {ledger:?}");
    assert!(
        ledger.violations.is_empty(),
        "{case}: {:?}",
        ledger.violations
    );
}

#[test]
fn failures_while_opening_return_errors_and_release_everything() {
    let cases = [
        (FaultPoint::CreateEventChannel, ErrorKind::Allocation),
        (FaultPoint::CreateId, ErrorKind::Allocation),
        (FaultPoint::ResolveAddr, ErrorKind::Transport),
    ];
    for (point, kind) in cases {
        let fabric = LoopbackFabric::new();
        fabric.inject(point);
        let mut memory = SlotMemory::new(SLOTS, 256);
        let err = RdmaChannel::create(fabric.clone(), connector(localhost(19_000), &mut memory))
            .err()
            .unwrap_or_else(|| panic!("{point:?}: create succeeded"));
        assert_eq!(err.kind(), kind, "{point:?}: {err}");
        assert_clean(&fabric, &format!("{point:?}"));
    }
}

#[test]
fn listen_on_busy_address_fails_cleanly() {
    let fabric = LoopbackFabric::new();
    let bind = localhost(19_001);
    let mut first_memory = SlotMemory::new(SLOTS, 256);
    let mut second_memory = SlotMemory::new(SLOTS, 256);
    let first = RdmaChannel::create(fabric.clone(), listener(bind, &mut first_memory))
        .expect("first listener");
    let err = RdmaChannel::create(fabric.clone(), listener(bind, &mut second_memory))
        .err()
        .expect("address in use");
    assert!(matches!(err, ChannelError::Transport(_)), "{err}");
    assert_eq!(first.state(), ConnectionState::Listening);
    drop(first);
    assert_clean(&fabric, "busy address");
}

/// Failures on the connecting side, all before the peer is contacted.
#[test]
fn connector_failures_end_in_error_and_release_everything() {
    let cases = [
        (FaultPoint::StallResolution, 0),
        (FaultPoint::ResolveRoute, 0),
        (FaultPoint::AllocPd, 0),
        (FaultPoint::CreateCompChannel, 0),
        (FaultPoint::CreateCq, 0),
        (FaultPoint::CreateQp, 0),
        (FaultPoint::RegisterMemory, 0),
        // Third slot registration: the two before it must be undone.
        (FaultPoint::RegisterMemory, 2),
        // Control region registration.
        (FaultPoint::RegisterMemory, SLOTS),
        (FaultPoint::Connect, 0),
    ];
    for (point, skip) in cases {
        let case = format!("{point:?} after {skip}");
        let fabric = LoopbackFabric::new();
        fabric.inject_after(point, skip);
        let mut memory = SlotMemory::new(SLOTS, 256);
        let channel = RdmaChannel::create(fabric.clone(), connector(localhost(19_002), &mut memory))
            .unwrap_or_else(|err| panic!("{case}: create failed: {err}"));
        wait_until(&case, || channel.state() == ConnectionState::Error);
        assert_eq!(channel.health(), ChannelHealth::Failed, "{case}");
        assert!(!channel.is_connected(), "{case}");
        assert!(channel.acquire().is_none(), "{case}");

        let report = channel.free();
        assert_eq!(report.threads_spawned, 1, "{case}");
        assert_eq!(report.threads_joined, 1, "{case}");
        assert_eq!(report.regions_released, report.regions_registered, "{case}");
        assert_clean(&fabric, &case);
    }
}

#[test]
fn unreachable_peer_ends_in_error() {
    let fabric = LoopbackFabric::new();
    let mut memory = SlotMemory::new(SLOTS, 256);
    let channel = RdmaChannel::create(fabric.clone(), connector(localhost(19_003), &mut memory))
        .expect("create");
    wait_until("connect error", || channel.state() == ConnectionState::Error);
    let report = channel.free();
    assert_eq!(report.regions_released, SLOTS + 1);
    assert_clean(&fabric, "unreachable");
}

/// Failures on the listening side, after the connector has been accepted
/// into resource setup. The connector sets up first, so its own attempts
/// are skipped. The refused connector sees a rejection.
#[test]
fn listener_failures_end_in_error_and_release_everything() {
    let cases = [
        (FaultPoint::AllocPd, 1),
        (FaultPoint::CreateCompChannel, 1),
        (FaultPoint::CreateCq, 1),
        (FaultPoint::CreateQp, 1),
        (FaultPoint::RegisterMemory, SLOTS + 2),
    ];
    for (offset, (point, skip)) in cases.into_iter().enumerate() {
        let case = format!("listener {point:?}");
        let fabric = LoopbackFabric::new();
        fabric.inject_after(point, skip);
        let bind = localhost(19_010 + offset as u16);
        let mut rx_memory = SlotMemory::new(SLOTS, 256);
        let mut tx_memory = SlotMemory::new(SLOTS, 256);
        let rx = RdmaChannel::create(fabric.clone(), listener(bind, &mut rx_memory))
            .expect("create listener");
        let tx = RdmaChannel::create(fabric.clone(), connector(bind, &mut tx_memory))
            .expect("create connector");

        wait_until(&case, || rx.state() == ConnectionState::Error);
        assert!(!rx.is_connected(), "{case}");
        wait_until(&case, || tx.state() == ConnectionState::Error);
        assert!(!tx.is_connected(), "{case}");
        assert_eq!(tx.health(), ChannelHealth::Failed, "{case}");

        let rx_report = rx.free();
        assert_eq!(rx_report.regions_registered, 0, "{case}");
        assert_eq!(rx_report.regions_released, 0, "{case}");
        let tx_report = tx.free();
        assert_eq!(tx_report.regions_released, SLOTS + 1, "{case}");
        assert_clean(&fabric, &case);
    }
}

#[test]
fn release_order_follows_dependencies() {
    let fabric = LoopbackFabric::new();
    fabric.inject(FaultPoint::Connect);
    let mut memory = SlotMemory::new(SLOTS, 256);
    let channel = RdmaChannel::create(fabric.clone(), connector(localhost(19_020), &mut memory))
        .expect("create");
    wait_until("connect failure", || channel.state() == ConnectionState::Error);
    let report = channel.free();
    assert_eq!(report.regions_released, SLOTS + 1);

    let ledger = fabric.ledger();
    let mut expected = vec![
        ResourceKind::Qp,
        ResourceKind::Cq,
        ResourceKind::CompChannel,
    ];
    expected.extend(std::iter::repeat_n(ResourceKind::Mr, SLOTS + 1));
    expected.extend([
        ResourceKind::Pd,
        ResourceKind::CmId,
        ResourceKind::EventChannel,
    ]);
    assert_eq!(ledger.releases, expected);
    assert_clean(&fabric, "release order");
}

#[test]
fn established_pair_releases_in_dependency_order() {
    let fabric = LoopbackFabric::new();
    let bind = localhost(19_021);
    let mut rx_memory = SlotMemory::new(SLOTS, 256);
    let mut tx_memory = SlotMemory::new(SLOTS, 256);
    let rx = RdmaChannel::create(fabric.clone(), listener(bind, &mut rx_memory))
        .expect("create listener");
    let tx = RdmaChannel::create(fabric.clone(), connector(bind, &mut tx_memory))
        .expect("create connector");
    wait_until("connected", || rx.is_connected() && tx.is_connected());

    let tx_report = tx.free();
    assert_eq!(tx_report.threads_spawned, 2);
    assert_eq!(tx_report.threads_joined, 2);
    let before = fabric.ledger().releases.len();

    let rx_report = rx.free();
    assert_eq!(rx_report.threads_joined, 2);
    assert_eq!(rx_report.regions_released, SLOTS + 1);

    // The listener holds two identifiers: the accepted one and the listening one.
    let ledger = fabric.ledger();
    let mut expected = vec![
        ResourceKind::Qp,
        ResourceKind::Cq,
        ResourceKind::CompChannel,
    ];
    expected.extend(std::iter::repeat_n(ResourceKind::Mr, SLOTS + 1));
    expected.extend([
        ResourceKind::Pd,
        ResourceKind::CmId,
        ResourceKind::CmId,
        ResourceKind::EventChannel,
    ]);
    assert_eq!(ledger.releases[before..], expected[..]);
    assert_clean(&fabric, "established pair");
}

#[test]
fn free_is_idempotent_with_drop() {
    let fabric = LoopbackFabric::new();
    let mut memory = SlotMemory::new(SLOTS, 256);
    let channel = RdmaChannel::create(fabric.clone(), listener(localhost(19_022), &mut memory))
        .expect("create");
    assert_eq!(channel.state(), ConnectionState::Listening);
    let report = channel.free();
    assert_eq!(report.threads_joined, 1);
    assert_eq!(report.regions_released, 0);
    assert_clean(&fabric, "listener only");
}
