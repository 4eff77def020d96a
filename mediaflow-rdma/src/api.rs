use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use crate::error::{ChannelError, Result};

/// Upper bound on slots per channel; slot indices travel as `u16` on the wire.
pub const MAX_BUFFERS: usize = 1024;

pub const ADDR_RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const ROUTE_RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const CM_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const CQ_WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Which side of the buffer exchange this channel plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Consumer: owns the destination buffers, grants credits, receives frames.
    Receiver,
    /// Producer: writes frames into the peer's buffers once credited.
    Transmitter,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Receiver => "rx",
            Role::Transmitter => "tx",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the connection is established. Independent of [`Role`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Bind to `bind` and accept exactly one peer.
    Listen { bind: SocketAddr },
    /// Resolve `remote` (optionally from `local`) and connect to it.
    Connect {
        local: Option<IpAddr>,
        remote: SocketAddr,
    },
}

/// Caller-owned memory handed to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSpec {
    addr: u64,
    capacity: usize,
}

impl BufferSpec {
    /// # Safety
    ///
    /// `ptr..ptr + capacity` must stay valid, writable and unaliased by Rust
    /// references for as long as the channel it is handed to exists. The
    /// fabric writes into it directly. It must also satisfy the provider's
    /// DMA alignment requirements.
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize) -> Self {
        Self {
            addr: ptr as u64,
            capacity,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A slot handed out by [`crate::RdmaChannel::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRef {
    index: usize,
    addr: u64,
    capacity: usize,
    len: usize,
}

impl BufferRef {
    pub(crate) fn new(index: usize, addr: u64, capacity: usize, len: usize) -> Self {
        Self {
            index,
            addr,
            capacity,
            len,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid payload bytes. On a received buffer this is what the producer
    /// wrote; on a transmit buffer it is what will be written on release.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the number of bytes a transmit release will write.
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// # Safety
    ///
    /// The buffer must currently be held by the application (acquired and
    /// not yet released) and the channel must still exist.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// # Safety
    ///
    /// Same contract as [`BufferRef::as_slice`]; no other reference to the
    /// buffer may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.capacity) }
    }
}

/// Invoked by the completion thread whenever a slot becomes acquirable.
/// Errors are logged and counted; they never stop the channel.
pub type NotifyFn = Arc<dyn Fn(&BufferRef) -> Result<()> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelTuning {
    pub addr_resolve_timeout: Duration,
    pub route_resolve_timeout: Duration,
    pub cm_poll_interval: Duration,
    pub cq_wait_interval: Duration,
    /// Busy-poll the completion queue instead of sleeping on notifications.
    pub low_latency: bool,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            addr_resolve_timeout: ADDR_RESOLVE_TIMEOUT,
            route_resolve_timeout: ROUTE_RESOLVE_TIMEOUT,
            cm_poll_interval: CM_POLL_INTERVAL,
            cq_wait_interval: CQ_WAIT_INTERVAL,
            low_latency: false,
        }
    }
}

#[derive(Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub role: Role,
    pub endpoint: Endpoint,
    pub buffers: Vec<BufferSpec>,
    pub notify: Option<NotifyFn>,
    pub tuning: ChannelTuning,
}

impl ChannelConfig {
    pub fn new(
        name: impl Into<String>,
        role: Role,
        endpoint: Endpoint,
        buffers: Vec<BufferSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            endpoint,
            buffers,
            notify: None,
            tuning: ChannelTuning::default(),
        }
    }

    pub fn with_notify<N>(mut self, notify: N) -> Self
    where
        N: Fn(&BufferRef) -> Result<()> + Send + Sync + 'static,
    {
        self.notify = Some(Arc::new(notify));
        self
    }

    pub fn with_tuning(mut self, tuning: ChannelTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ChannelError::InvalidArgument("name is empty"));
        }
        if self.buffers.is_empty() {
            return Err(ChannelError::InvalidArgument("at least one buffer is required"));
        }
        if self.buffers.len() > MAX_BUFFERS {
            return Err(ChannelError::InvalidArgument("too many buffers"));
        }
        for buffer in &self.buffers {
            if buffer.addr == 0 {
                return Err(ChannelError::InvalidArgument("buffer address must be non-null"));
            }
            if buffer.capacity == 0 {
                return Err(ChannelError::InvalidArgument("buffer capacity must be non-zero"));
            }
            if buffer.capacity > u32::MAX as usize {
                return Err(ChannelError::InvalidArgument(
                    "buffer capacity exceeds the 32-bit wire length",
                ));
            }
        }
        match self.endpoint {
            Endpoint::Listen { bind } if bind.port() == 0 => {
                Err(ChannelError::InvalidArgument("listen port must be non-zero"))
            }
            Endpoint::Connect { remote, .. } if remote.port() == 0 => {
                Err(ChannelError::InvalidArgument("remote port must be non-zero"))
            }
            Endpoint::Connect { remote, .. } if remote.ip().is_unspecified() => {
                Err(ChannelError::InvalidArgument("remote address is unspecified"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("buffers", &self.buffers.len())
            .field("notify", &self.notify.is_some())
            .field("tuning", &self.tuning)
            .finish()
    }
}
