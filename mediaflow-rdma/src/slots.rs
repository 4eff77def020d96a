//! Per-slot ownership state.
//!
//! Every slot has exactly one owner at a time: the application, the local
//! completion thread, or the peer. Ownership moves only through a
//! compare-and-swap on the slot word, and each arrow has a single driving
//! side:
//!
//! ```text
//! receiver:     Free ──READY──▶ Ready ──acquire──▶ InConsumption ──release──▶ Free
//! transmitter:  AwaitingCredit ──DONE──▶ Writable ──acquire──▶ InProduction ──release──▶ AwaitingCredit
//! ```
//!
//! Status and credit generation share one atomic word, so a release that
//! frees a slot publishes its new generation in the same step: a Free slot
//! never carries the generation that was just consumed. The remaining fields
//! (payload length, remote target) are written before the swap that
//! publishes them and read after the load that observes it. Incoming records
//! are applied by the completion thread only.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

use crate::{
    api::{BufferRef, BufferSpec, Role},
    error::{ChannelError, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    /// Receiver: credited to the peer, waiting for data.
    Free = 0,
    /// Receiver: holds a frame, acquirable.
    Ready = 1,
    /// Receiver: held by the application.
    InConsumption = 2,
    /// Transmitter: waiting for the peer to hand the slot back.
    AwaitingCredit = 3,
    /// Transmitter: credited, acquirable.
    Writable = 4,
    /// Transmitter: held by the application.
    InProduction = 5,
}

impl SlotStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Ready,
            2 => Self::InConsumption,
            3 => Self::AwaitingCredit,
            4 => Self::Writable,
            _ => Self::InProduction,
        }
    }
}

/// Why an incoming control record was not applied.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SlotRejection {
    #[error("slot {slot} out of range (count={count})")]
    OutOfRange { slot: usize, count: usize },
    #[error("message is not valid for the {role} role")]
    WrongRole { role: Role },
    #[error("slot {slot} is {status:?}")]
    WrongState { slot: usize, status: SlotStatus },
    #[error("slot {slot} expected sequence {expected}, got {got}")]
    StaleSequence { slot: usize, expected: u32, got: u32 },
    #[error("slot {slot} announced {len} bytes, capacity is {capacity}")]
    Oversized {
        slot: usize,
        len: usize,
        capacity: usize,
    },
}

/// Where a transmit release writes its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteTarget {
    pub remote_addr: u64,
    pub rkey: u32,
    pub seq: u32,
    pub len: u32,
}

/// Credit generations wrap and never take the value zero, so a zeroed
/// record can never match.
pub fn next_seq(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Status in the low byte, generation in the high half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotWord {
    status: SlotStatus,
    seq: u32,
}

impl SlotWord {
    fn new(status: SlotStatus, seq: u32) -> Self {
        Self { status, seq }
    }

    fn pack(self) -> u64 {
        (u64::from(self.seq) << 32) | self.status as u64
    }

    fn unpack(raw: u64) -> Self {
        Self {
            status: SlotStatus::from_u8(raw as u8),
            seq: (raw >> 32) as u32,
        }
    }
}

struct Slot {
    addr: u64,
    capacity: usize,
    word: AtomicU64,
    len: AtomicU32,
    remote_addr: AtomicU64,
    rkey: AtomicU32,
    remote_capacity: AtomicU32,
}

impl Slot {
    fn load(&self) -> SlotWord {
        SlotWord::unpack(self.word.load(Ordering::Acquire))
    }

    fn status(&self) -> SlotStatus {
        self.load().status
    }

    fn swap(&self, from: SlotWord, to: SlotWord) -> bool {
        self.word
            .compare_exchange(from.pack(), to.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves the status, keeping whatever generation the slot carries.
    fn transition(&self, from: SlotStatus, to: SlotStatus) -> Option<u32> {
        let mut current = self.load();
        while current.status == from {
            match self.word.compare_exchange(
                current.pack(),
                SlotWord::new(to, current.seq).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current.seq),
                Err(raw) => current = SlotWord::unpack(raw),
            }
        }
        None
    }

    /// Replaces the generation, keeping the status.
    fn set_seq(&self, seq: u32) {
        let mut current = self.load();
        while let Err(raw) = self.word.compare_exchange(
            current.pack(),
            SlotWord::new(current.status, seq).pack(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            current = SlotWord::unpack(raw);
        }
    }
}

pub struct SlotTable {
    role: Role,
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(role: Role, buffers: &[BufferSpec]) -> Self {
        let initial = match role {
            Role::Receiver => SlotStatus::Free,
            Role::Transmitter => SlotStatus::AwaitingCredit,
        };
        let slots = buffers
            .iter()
            .map(|buffer| Slot {
                addr: buffer.addr(),
                capacity: buffer.capacity(),
                word: AtomicU64::new(SlotWord::new(initial, 0).pack()),
                len: AtomicU32::new(0),
                remote_addr: AtomicU64::new(0),
                rkey: AtomicU32::new(0),
                remote_capacity: AtomicU32::new(0),
            })
            .collect();
        Self { role, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn status(&self, index: usize) -> Option<SlotStatus> {
        self.slots.get(index).map(Slot::status)
    }

    pub fn capacity(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.capacity)
    }

    /// Hands out the lowest-indexed acquirable slot.
    pub fn acquire(&self) -> Option<BufferRef> {
        let (from, to) = match self.role {
            Role::Receiver => (SlotStatus::Ready, SlotStatus::InConsumption),
            Role::Transmitter => (SlotStatus::Writable, SlotStatus::InProduction),
        };
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.transition(from, to)?;
            let len = match self.role {
                Role::Receiver => slot.len.load(Ordering::Relaxed) as usize,
                Role::Transmitter => slot
                    .capacity
                    .min(slot.remote_capacity.load(Ordering::Relaxed) as usize),
            };
            Some(BufferRef::new(index, slot.addr, slot.capacity, len))
        })
    }

    /// Maps a buffer handed back by the application to its slot index.
    pub fn find(&self, buffer: &BufferRef) -> Result<usize> {
        match self.slots.get(buffer.index()) {
            Some(slot) if slot.addr == buffer.addr() => Ok(buffer.index()),
            _ => Err(ChannelError::UnknownBuffer {
                index: buffer.index(),
                addr: buffer.addr(),
            }),
        }
    }

    /// Bumps the credit generation of a receiver slot and returns it.
    pub fn grant_credit(&self, index: usize) -> Option<u32> {
        let slot = self.slots.get(index)?;
        let seq = next_seq(slot.load().seq);
        slot.set_seq(seq);
        Some(seq)
    }

    /// Restores a generation after the credit carrying it failed to post.
    pub fn revoke_credit(&self, index: usize, previous: u32) {
        if let Some(slot) = self.slots.get(index) {
            slot.set_seq(previous);
        }
    }

    pub fn seq(&self, index: usize) -> Option<u32> {
        self.slots.get(index).map(|slot| slot.load().seq)
    }

    /// Receiver release: `InConsumption → Free` under the next generation.
    /// Returns the generation to restore via
    /// [`SlotTable::revert_receiver_release`] if the credit cannot be
    /// posted, and the new generation to announce.
    pub fn begin_receiver_release(&self, index: usize) -> Result<(u32, u32)> {
        let slot = self.held_slot(index, SlotStatus::InConsumption)?;
        let current = slot.load();
        if current.status != SlotStatus::InConsumption {
            return Err(ChannelError::BufferNotHeld { index });
        }
        let seq = next_seq(current.seq);
        if !slot.swap(current, SlotWord::new(SlotStatus::Free, seq)) {
            return Err(ChannelError::BufferNotHeld { index });
        }
        Ok((current.seq, seq))
    }

    pub fn revert_receiver_release(&self, index: usize, previous: u32) {
        if let Some(slot) = self.slots.get(index) {
            slot.swap(
                SlotWord::new(SlotStatus::Free, next_seq(previous)),
                SlotWord::new(SlotStatus::InConsumption, previous),
            );
        }
    }

    /// Transmitter release: `InProduction → AwaitingCredit`, returning where
    /// the payload goes. Nothing changes unless the slot is held and `len`
    /// fits both ends.
    pub fn begin_transmitter_release(&self, index: usize, len: usize) -> Result<WriteTarget> {
        let slot = self.held_slot(index, SlotStatus::InProduction)?;
        let remote_capacity = slot.remote_capacity.load(Ordering::Relaxed) as usize;
        let capacity = slot.capacity.min(remote_capacity);
        if len > capacity {
            return Err(ChannelError::PayloadTooLarge { len, capacity });
        }
        let seq = slot
            .transition(SlotStatus::InProduction, SlotStatus::AwaitingCredit)
            .ok_or(ChannelError::BufferNotHeld { index })?;
        Ok(WriteTarget {
            remote_addr: slot.remote_addr.load(Ordering::Relaxed),
            rkey: slot.rkey.load(Ordering::Relaxed),
            seq,
            len: len as u32,
        })
    }

    pub fn revert_transmitter_release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.transition(SlotStatus::AwaitingCredit, SlotStatus::InProduction);
        }
    }

    /// Applies a BUFFER_READY on the receiver: `Free → Ready`.
    pub fn on_buffer_ready(
        &self,
        index: usize,
        seq: u32,
        len: u32,
    ) -> std::result::Result<BufferRef, SlotRejection> {
        let slot = self.incoming_slot(index, Role::Receiver)?;
        let current = slot.load();
        if current.status != SlotStatus::Free {
            return Err(SlotRejection::WrongState {
                slot: index,
                status: current.status,
            });
        }
        if seq != current.seq {
            return Err(SlotRejection::StaleSequence {
                slot: index,
                expected: current.seq,
                got: seq,
            });
        }
        if len as usize > slot.capacity {
            return Err(SlotRejection::Oversized {
                slot: index,
                len: len as usize,
                capacity: slot.capacity,
            });
        }
        slot.len.store(len, Ordering::Relaxed);
        if !slot.swap(current, SlotWord::new(SlotStatus::Ready, seq)) {
            let now = slot.load();
            return Err(if now.status == SlotStatus::Free {
                SlotRejection::StaleSequence {
                    slot: index,
                    expected: now.seq,
                    got: seq,
                }
            } else {
                SlotRejection::WrongState {
                    slot: index,
                    status: now.status,
                }
            });
        }
        Ok(BufferRef::new(index, slot.addr, slot.capacity, len as usize))
    }

    /// Applies a BUFFER_DONE on the transmitter: `AwaitingCredit → Writable`.
    pub fn on_buffer_done(
        &self,
        index: usize,
        seq: u32,
        remote_addr: u64,
        rkey: u32,
        remote_capacity: u32,
    ) -> std::result::Result<BufferRef, SlotRejection> {
        let slot = self.incoming_slot(index, Role::Transmitter)?;
        let current = slot.load();
        if current.status != SlotStatus::AwaitingCredit {
            return Err(SlotRejection::WrongState {
                slot: index,
                status: current.status,
            });
        }
        let expected = next_seq(current.seq);
        if seq != expected {
            return Err(SlotRejection::StaleSequence {
                slot: index,
                expected,
                got: seq,
            });
        }
        slot.remote_addr.store(remote_addr, Ordering::Relaxed);
        slot.rkey.store(rkey, Ordering::Relaxed);
        slot.remote_capacity
            .store(remote_capacity, Ordering::Relaxed);
        if !slot.swap(current, SlotWord::new(SlotStatus::Writable, seq)) {
            return Err(SlotRejection::WrongState {
                slot: index,
                status: slot.status(),
            });
        }
        let len = slot.capacity.min(remote_capacity as usize);
        Ok(BufferRef::new(index, slot.addr, slot.capacity, len))
    }

    fn held_slot(&self, index: usize, held: SlotStatus) -> Result<&Slot> {
        let slot = self
            .slots
            .get(index)
            .ok_or(ChannelError::BufferNotHeld { index })?;
        if slot.status() != held {
            return Err(ChannelError::BufferNotHeld { index });
        }
        Ok(slot)
    }

    fn incoming_slot(&self, index: usize, role: Role) -> std::result::Result<&Slot, SlotRejection> {
        if self.role != role {
            return Err(SlotRejection::WrongRole { role: self.role });
        }
        self.slots.get(index).ok_or(SlotRejection::OutOfRange {
            slot: index,
            count: self.slots.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SlotRejection, SlotStatus, SlotTable, next_seq};
    use crate::{
        api::{BufferSpec, Role},
        error::ChannelError,
    };

    fn specs(count: usize, capacity: usize) -> Vec<BufferSpec> {
        (0..count)
            .map(|idx| unsafe {
                BufferSpec::from_raw((0x1000 + idx * capacity) as *mut u8, capacity)
            })
            .collect()
    }

    fn credited_receiver(count: usize) -> SlotTable {
        let table = SlotTable::new(Role::Receiver, &specs(count, 1024));
        for idx in 0..count {
            assert_eq!(table.grant_credit(idx), Some(1));
        }
        table
    }

    #[test]
    fn sequence_skips_zero_on_wrap() {
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(41), 42);
        assert_eq!(next_seq(u32::MAX), 1);
    }

    #[test]
    fn receiver_cycle() {
        let table = credited_receiver(3);
        assert!(table.acquire().is_none());

        let ready = table.on_buffer_ready(1, 1, 200).expect("ready");
        assert_eq!(ready.index(), 1);
        assert_eq!(table.status(1), Some(SlotStatus::Ready));

        let held = table.acquire().expect("acquire");
        assert_eq!(held.index(), 1);
        assert_eq!(held.len(), 200);
        assert_eq!(table.status(1), Some(SlotStatus::InConsumption));
        assert!(table.acquire().is_none());

        let (previous, seq) = table.begin_receiver_release(1).expect("release");
        assert_eq!((previous, seq), (1, 2));
        assert_eq!(table.status(1), Some(SlotStatus::Free));

        assert_eq!(
            table.on_buffer_ready(1, 1, 10),
            Err(SlotRejection::StaleSequence {
                slot: 1,
                expected: 2,
                got: 1
            })
        );
        assert!(table.on_buffer_ready(1, 2, 10).is_ok());
    }

    #[test]
    fn acquire_returns_lowest_ready_slot() {
        let table = credited_receiver(4);
        table.on_buffer_ready(3, 1, 1).expect("ready 3");
        table.on_buffer_ready(0, 1, 1).expect("ready 0");
        table.on_buffer_ready(2, 1, 1).expect("ready 2");

        let order: Vec<usize> = std::iter::from_fn(|| table.acquire().map(|b| b.index())).collect();
        assert_eq!(order, vec![0, 2, 3]);
    }

    #[test]
    fn rejected_messages_leave_state_untouched() {
        let table = credited_receiver(2);
        assert_eq!(
            table.on_buffer_ready(2, 1, 1),
            Err(SlotRejection::OutOfRange { slot: 2, count: 2 })
        );

        table.on_buffer_ready(0, 1, 5).expect("ready");
        assert_eq!(
            table.on_buffer_ready(0, 1, 7),
            Err(SlotRejection::WrongState {
                slot: 0,
                status: SlotStatus::Ready
            })
        );
        assert_eq!(table.acquire().map(|b| b.len()), Some(5));

        assert_eq!(
            table.on_buffer_ready(1, 1, 4096),
            Err(SlotRejection::Oversized {
                slot: 1,
                len: 4096,
                capacity: 1024
            })
        );
        assert_eq!(table.status(1), Some(SlotStatus::Free));

        assert_eq!(
            table.on_buffer_done(1, 2, 0x9000, 7, 1024),
            Err(SlotRejection::WrongRole {
                role: Role::Receiver
            })
        );
    }

    #[test]
    fn release_requires_held_slot() {
        let table = credited_receiver(2);
        assert_eq!(
            table.begin_receiver_release(0),
            Err(ChannelError::BufferNotHeld { index: 0 })
        );
        assert_eq!(
            table.begin_receiver_release(9),
            Err(ChannelError::BufferNotHeld { index: 9 })
        );
        assert_eq!(table.seq(0), Some(1));
    }

    #[test]
    fn receiver_release_revert_restores_state() {
        let table = credited_receiver(1);
        table.on_buffer_ready(0, 1, 3).expect("ready");
        table.acquire().expect("acquire");
        let (previous, _) = table.begin_receiver_release(0).expect("release");
        table.revert_receiver_release(0, previous);
        assert_eq!(table.status(0), Some(SlotStatus::InConsumption));
        assert_eq!(table.seq(0), Some(1));
    }

    #[test]
    fn replayed_ready_never_lands_while_slot_is_released() {
        use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

        let table = credited_receiver(1);
        let consumed = AtomicU32::new(0);
        let done = AtomicBool::new(false);
        let accepted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut seq = 1;
                for _ in 0..20_000 {
                    if table.on_buffer_ready(0, seq, 64).is_err() {
                        break;
                    }
                    table.acquire().expect("acquire");
                    let (previous, next) = table.begin_receiver_release(0).expect("release");
                    consumed.store(previous, Ordering::Release);
                    seq = next;
                }
                done.store(true, Ordering::Release);
            });
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let stale = consumed.load(Ordering::Acquire);
                    if stale != 0 && table.on_buffer_ready(0, stale, 64).is_ok() {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        });

        assert_eq!(accepted.load(Ordering::Relaxed), 0);
        assert_eq!(table.status(0), Some(SlotStatus::Free));
        assert_eq!(table.seq(0), Some(20_001));
    }

    #[test]
    fn transmitter_cycle() {
        let table = SlotTable::new(Role::Transmitter, &specs(2, 2048));
        assert!(table.acquire().is_none());

        assert_eq!(
            table.on_buffer_done(0, 2, 0x9000, 7, 1024),
            Err(SlotRejection::StaleSequence {
                slot: 0,
                expected: 1,
                got: 2
            })
        );
        let writable = table.on_buffer_done(0, 1, 0x9000, 7, 1024).expect("done");
        assert_eq!(writable.len(), 1024);
        assert_eq!(table.status(0), Some(SlotStatus::Writable));

        let held = table.acquire().expect("acquire");
        assert_eq!(held.index(), 0);
        assert_eq!(held.capacity(), 2048);

        assert_eq!(
            table.begin_transmitter_release(0, 1025),
            Err(ChannelError::PayloadTooLarge {
                len: 1025,
                capacity: 1024
            })
        );
        assert_eq!(table.status(0), Some(SlotStatus::InProduction));

        let target = table.begin_transmitter_release(0, 512).expect("release");
        assert_eq!(target.remote_addr, 0x9000);
        assert_eq!(target.rkey, 7);
        assert_eq!(target.seq, 1);
        assert_eq!(target.len, 512);
        assert_eq!(table.status(0), Some(SlotStatus::AwaitingCredit));

        table.revert_transmitter_release(0);
        assert_eq!(table.status(0), Some(SlotStatus::InProduction));
    }

    #[test]
    fn find_checks_index_and_address() {
        let table = credited_receiver(2);
        table.on_buffer_ready(1, 1, 1).expect("ready");
        let buffer = table.acquire().expect("acquire");
        assert_eq!(table.find(&buffer), Ok(1));

        let forged = crate::api::BufferRef::new(1, 0xdead, 1024, 0);
        assert_eq!(
            table.find(&forged),
            Err(ChannelError::UnknownBuffer {
                index: 1,
                addr: 0xdead
            })
        );
    }
}
