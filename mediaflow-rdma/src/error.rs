use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Coarse classification of [`ChannelError`], matching how the caller is
/// expected to react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource exhaustion while building the channel. The channel was unwound.
    Allocation,
    /// A background thread could not be spawned. The channel was unwound.
    Threading,
    /// The call was not valid for the current channel or buffer state. Nothing
    /// was changed.
    Usage,
    /// The fabric reported a failure. The channel must be freed and recreated.
    Transport,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("thread spawn failed: {0}")]
    Threading(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("buffer {index} is not held by the application")]
    BufferNotHeld { index: usize },
    #[error("buffer does not belong to this channel: index={index}, addr={addr:#x}")]
    UnknownBuffer { index: usize, addr: u64 },
    #[error("payload of {len} bytes exceeds capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("address resolution failed: {0}")]
    AddressResolution(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Allocation(_) | ChannelError::Backend(_) => ErrorKind::Allocation,
            ChannelError::Threading(_) => ErrorKind::Threading,
            ChannelError::InvalidArgument(_)
            | ChannelError::NotConnected
            | ChannelError::BufferNotHeld { .. }
            | ChannelError::UnknownBuffer { .. }
            | ChannelError::PayloadTooLarge { .. } => ErrorKind::Usage,
            ChannelError::AddressResolution(_) | ChannelError::Transport(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// Negative status code for callers bridging to a C-style API.
    pub fn status_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Allocation => -12,
            ErrorKind::Threading => -11,
            ErrorKind::Usage => -22,
            ErrorKind::Transport => -5,
        }
    }
}
