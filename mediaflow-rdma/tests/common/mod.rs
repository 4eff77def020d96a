#![allow(dead_code)]

use std::{
    net::{Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use mediaflow_rdma::{
    BufferSpec,
    backend::{
        CmErrorKind, CmEvent, CompletionOpcode, CompletionStatus, Fabric, MemoryAccess,
        MemoryRegion, QueueCaps,
    },
    control_protocol::{MESSAGE_BYTES, WireMessage},
    loopback::{
        LoopbackCmId, LoopbackCompChannel, LoopbackCq, LoopbackEventChannel, LoopbackFabric,
        LoopbackMr, LoopbackPd, LoopbackQp,
    },
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Caller-owned slot memory. Must outlive every channel it is handed to.
pub struct SlotMemory {
    buffers: Vec<Vec<u8>>,
}

impl SlotMemory {
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            buffers: vec![vec![0_u8; capacity]; count],
        }
    }

    pub fn specs(&mut self) -> Vec<BufferSpec> {
        self.buffers
            .iter_mut()
            .map(|buf| unsafe { BufferSpec::from_raw(buf.as_mut_ptr(), buf.len()) })
            .collect()
    }
}

/// Polls `check` until it yields a value or [`WAIT`] elapses.
pub fn wait_for<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

pub fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    wait_for(what, || check().then_some(()));
}

pub fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed.wrapping_mul(31) + i) as u8).collect()
}

/// A protocol peer driven directly through the fabric, for feeding a
/// channel records it would never produce itself.
///
/// Field order is release order.
pub struct RawPeer {
    fabric: LoopbackFabric,
    qp: LoopbackQp,
    cq: LoopbackCq,
    _comp_channel: LoopbackCompChannel,
    control_mr: LoopbackMr,
    source_mr: LoopbackMr,
    _pd: LoopbackPd,
    id: LoopbackCmId,
    events: LoopbackEventChannel,
    control: Vec<u8>,
    source: Vec<u8>,
    records: usize,
}

fn describe<Id>(event: &CmEvent<Id>) -> String {
    match event {
        CmEvent::Error { kind, status } => format!("error {kind:?} status={status}"),
        CmEvent::AddrResolved => "addr_resolved".to_string(),
        CmEvent::RouteResolved => "route_resolved".to_string(),
        CmEvent::ConnectRequest(_) => "connect_request".to_string(),
        CmEvent::ConnectResponse => "connect_response".to_string(),
        CmEvent::Established => "established".to_string(),
        CmEvent::Disconnected => "disconnected".to_string(),
        CmEvent::Other(raw) => format!("other({raw})"),
    }
}

impl RawPeer {
    /// Connects to `remote` with `records` control receives posted.
    /// Returns the last event seen if establishment fails.
    pub fn connect(fabric: &LoopbackFabric, remote: SocketAddr, records: usize) -> Result<Self, String> {
        let events = fabric.create_event_channel().map_err(|e| e.to_string())?;
        let id = fabric.create_id(&events).map_err(|e| e.to_string())?;
        fabric
            .resolve_addr(&id, None, remote, WAIT)
            .map_err(|e| e.to_string())?;
        expect_event(fabric, &events, "addr_resolved")?;
        fabric.resolve_route(&id, WAIT).map_err(|e| e.to_string())?;
        expect_event(fabric, &events, "route_resolved")?;

        let caps = QueueCaps {
            max_send_wr: records as u32 * 2,
            max_recv_wr: records as u32,
            max_inline_data: MESSAGE_BYTES as u32,
        };
        let pd = fabric.alloc_pd(&id).map_err(|e| e.to_string())?;
        let comp_channel = fabric.create_comp_channel(&id).map_err(|e| e.to_string())?;
        let cq = fabric
            .create_cq(&id, &comp_channel, 64)
            .map_err(|e| e.to_string())?;
        let qp = fabric
            .create_qp(&id, &pd, &cq, caps)
            .map_err(|e| e.to_string())?;

        let mut control = vec![0_u8; records * MESSAGE_BYTES];
        let control_mr = fabric
            .register_memory(
                &pd,
                control.as_mut_ptr() as u64,
                control.len(),
                MemoryAccess::Local,
            )
            .map_err(|e| e.to_string())?;
        let mut source = vec![0_u8; 4096];
        let source_mr = fabric
            .register_memory(
                &pd,
                source.as_mut_ptr() as u64,
                source.len(),
                MemoryAccess::Local,
            )
            .map_err(|e| e.to_string())?;
        for region in 0..records {
            fabric
                .post_recv(
                    &qp,
                    region as u64,
                    &control_mr,
                    control_mr.addr() + (region * MESSAGE_BYTES) as u64,
                    MESSAGE_BYTES as u32,
                )
                .map_err(|e| e.to_string())?;
        }

        fabric.connect(&id, &qp).map_err(|e| e.to_string())?;
        expect_event(fabric, &events, "connect_response")?;
        fabric.establish(&id, &qp).map_err(|e| e.to_string())?;

        Ok(Self {
            fabric: fabric.clone(),
            qp,
            cq,
            _comp_channel: comp_channel,
            control_mr,
            source_mr,
            _pd: pd,
            id,
            events,
            control,
            source,
            records,
        })
    }

    pub fn send(&self, message: &WireMessage) {
        self.send_raw(&message.encode());
    }

    pub fn send_raw(&self, record: &[u8]) {
        self.fabric
            .post_send_inline(&self.qp, u64::MAX >> 8, record)
            .expect("post send");
    }

    /// Writes `payload` into the consumer's buffer described by `credit`.
    pub fn write(&mut self, credit: &WireMessage, payload: &[u8]) {
        let WireMessage::BufferDone {
            remote_addr, rkey, ..
        } = *credit
        else {
            panic!("not a credit: {credit:?}");
        };
        self.source[..payload.len()].copy_from_slice(payload);
        self.fabric
            .post_write(
                &self.qp,
                1 << 60,
                &self.source_mr,
                self.source_mr.addr(),
                payload.len() as u32,
                remote_addr,
                rkey,
            )
            .expect("post write");
    }

    /// Collects `count` control records, re-posting each receive.
    pub fn receive(&self, count: usize) -> Vec<WireMessage> {
        let mut received = Vec::with_capacity(count);
        let mut completions = Vec::new();
        wait_until("control records", || {
            completions.clear();
            self.fabric
                .poll_cq(&self.cq, &mut completions, 16)
                .expect("poll cq");
            for completion in &completions {
                assert_eq!(completion.status, CompletionStatus::Success);
                if completion.opcode != CompletionOpcode::Recv {
                    continue;
                }
                let region = completion.wr_id as usize;
                assert!(region < self.records);
                let start = region * MESSAGE_BYTES;
                let message = WireMessage::decode(&self.control[start..start + MESSAGE_BYTES])
                    .expect("well-formed record");
                received.push(message);
                self.fabric
                    .post_recv(
                        &self.qp,
                        region as u64,
                        &self.control_mr,
                        self.control_mr.addr() + start as u64,
                        MESSAGE_BYTES as u32,
                    )
                    .expect("re-post receive");
            }
            received.len() >= count
        });
        received
    }

    pub fn disconnect(&self) {
        self.fabric.disconnect(&self.id).expect("disconnect");
    }

    pub fn next_event(&self) -> Option<String> {
        self.fabric
            .poll_cm_event(&self.events, Duration::from_millis(100))
            .expect("poll cm event")
            .map(|event| describe(&event))
    }
}

fn expect_event(
    fabric: &LoopbackFabric,
    events: &LoopbackEventChannel,
    expected: &str,
) -> Result<(), String> {
    match fabric.poll_cm_event(events, WAIT) {
        Ok(Some(event)) => {
            let seen = describe(&event);
            if seen == expected {
                Ok(())
            } else {
                Err(seen)
            }
        }
        Ok(None) => Err(format!("no event while waiting for {expected}")),
        Err(error) => Err(error.to_string()),
    }
}

pub fn is_rejection(outcome: &str) -> bool {
    outcome.starts_with(&format!("error {:?}", CmErrorKind::Rejected))
}
