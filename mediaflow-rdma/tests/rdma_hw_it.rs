#![cfg(feature = "rdma")]

use std::{
    env,
    net::{IpAddr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use mediaflow_rdma::{
    BufferSpec, ChannelConfig, Endpoint, RdmaChannel, RdmaCmFabric, Role,
};

const ENV_ADDR: &str = "MEDIAFLOW_RDMA_IT_ADDR";
const ENV_PORT: &str = "MEDIAFLOW_RDMA_IT_PORT";
const SLOTS: usize = 4;
const CAPACITY: usize = 1 << 20;
const FRAMES: usize = 1000;
const WAIT: Duration = Duration::from_secs(10);

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn specs(buffers: &mut [Vec<u8>]) -> Vec<BufferSpec> {
    buffers
        .iter_mut()
        .map(|buf| unsafe { BufferSpec::from_raw(buf.as_mut_ptr(), buf.len()) })
        .collect()
}

fn wait_for<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

#[test]
#[ignore = "requires an RDMA device; set MEDIAFLOW_RDMA_IT_ADDR"]
fn it_rdma_frames_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let Some(addr) = read_env(ENV_ADDR) else {
        eprintln!("skip: {ENV_ADDR} is not set");
        return Ok(());
    };
    let ip: IpAddr = addr.parse()?;
    let port = read_env(ENV_PORT)
        .map(|value| value.parse::<u16>())
        .transpose()?
        .unwrap_or(18_600);
    let bind = SocketAddr::new(ip, port);
    mediaflow_rdma::init_logging();

    let mut rx_buffers = vec![vec![0_u8; CAPACITY]; SLOTS];
    let mut tx_buffers = vec![vec![0_u8; CAPACITY]; SLOTS];
    let rx = RdmaChannel::create(
        RdmaCmFabric::new(),
        ChannelConfig::new(
            "it-rx",
            Role::Receiver,
            Endpoint::Listen { bind },
            specs(&mut rx_buffers),
        ),
    )?;
    let tx = RdmaChannel::create(
        RdmaCmFabric::new(),
        ChannelConfig::new(
            "it-tx",
            Role::Transmitter,
            Endpoint::Connect {
                local: Some(ip),
                remote: bind,
            },
            specs(&mut tx_buffers),
        ),
    )?;

    let started_at = Instant::now();
    for frame in 0..FRAMES {
        let buf = wait_for("writable slot", || tx.acquire());
        let len = 4096 + frame;
        let out = unsafe { buf.as_mut_slice() };
        out[..len].fill(frame as u8);
        tx.release(buf.with_len(len))?;

        let received = wait_for("ready slot", || rx.acquire());
        assert_eq!(received.len(), len);
        assert!(unsafe { received.as_slice() }.iter().all(|b| *b == frame as u8));
        rx.release(received)?;
    }
    let elapsed = started_at.elapsed();
    eprintln!(
        "{FRAMES} frames in {:.3} ms ({:.1} us/frame)",
        elapsed.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1e6 / FRAMES as f64
    );

    let tx_report = tx.free();
    let rx_report = rx.free();
    assert_eq!(tx_report.threads_joined, tx_report.threads_spawned);
    assert_eq!(rx_report.regions_released, rx_report.regions_registered);
    Ok(())
}
