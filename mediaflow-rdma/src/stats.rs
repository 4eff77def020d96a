use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a channel's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames that became ready on the receiver.
    pub buffers_received: u64,
    /// Frames written to the peer by the transmitter.
    pub buffers_sent: u64,
    pub credits_sent: u64,
    pub credits_received: u64,
    /// Records discarded by the codec (magic, version, type, length).
    pub protocol_violations: u64,
    /// Well-formed records refused by the slot table.
    pub rejected_messages: u64,
    pub callback_failures: u64,
    pub completions: u64,
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    buffers_received: AtomicU64,
    buffers_sent: AtomicU64,
    credits_sent: AtomicU64,
    credits_received: AtomicU64,
    protocol_violations: AtomicU64,
    rejected_messages: AtomicU64,
    callback_failures: AtomicU64,
    completions: AtomicU64,
}

macro_rules! counter {
    ($($name:ident),* $(,)?) => {
        impl ChannelStats {
            $(
                pub fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter!(
    buffers_received,
    buffers_sent,
    credits_sent,
    credits_received,
    protocol_violations,
    rejected_messages,
    callback_failures,
);

impl ChannelStats {
    pub fn add_completions(&self, count: usize) {
        self.completions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            buffers_received: self.buffers_received.load(Ordering::Relaxed),
            buffers_sent: self.buffers_sent.load(Ordering::Relaxed),
            credits_sent: self.credits_sent.load(Ordering::Relaxed),
            credits_received: self.credits_received.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
        }
    }
}
