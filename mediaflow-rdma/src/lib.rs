//! Zero-copy, credit-based buffer exchange between two hosts over RDMA.
//!
//! A [`RdmaChannel`] in the receiver role owns destination buffers and hands
//! one credit per buffer to its peer. The transmitter writes a frame straight
//! into a credited buffer and announces it; the receiver consumes it and
//! returns the credit. See [`control_protocol`] for the wire format.

mod api;
pub mod backend;
mod channel;
mod connection;
pub mod control_protocol;
mod error;
mod event_loop;
mod logging;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
#[cfg(feature = "rdma")]
mod rdmacm_backend;
mod registration;
mod slots;
mod stats;

pub use api::{
    BufferRef, BufferSpec, ChannelConfig, ChannelTuning, Endpoint, MAX_BUFFERS, NotifyFn, Role,
};
pub use channel::{ChannelHealth, RdmaChannel, TeardownReport};
pub use connection::ConnectionState;
pub use error::{ChannelError, ErrorKind, Result};
#[cfg(any(test, feature = "loopback"))]
pub use loopback::{FaultPoint, LedgerSnapshot, LoopbackFabric, ResourceKind};
#[cfg(feature = "rdma")]
pub use rdmacm_backend::RdmaCmFabric;
pub use slots::SlotStatus;
pub use stats::StatsSnapshot;

pub fn init_logging() {
    logging::ensure_initialized();
}
