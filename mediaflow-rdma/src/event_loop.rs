//! Completion processing thread.
//!
//! Waits on the completion channel (or busy-polls in low-latency mode),
//! re-arms, then drains the queue until empty. Receive completions carry
//! control records and drive the slot table. Notifications run after the
//! resource lock is released. A flushed completion means the link went down
//! and stops the thread quietly; any other failed completion stops it and
//! marks the channel faulted.

use std::{
    sync::{Arc, atomic::Ordering},
    thread,
};

use crate::{
    api::{BufferRef, Role},
    backend::{Completion, CompletionStatus, Fabric},
    channel::{ChannelShared, Resources},
    control_protocol::{MESSAGE_BYTES, WireMessage},
    error::{ChannelError, Result},
    slots::SlotRejection,
};

const POLL_BATCH: usize = 32;
const KIND_SHIFT: u32 = 56;
const INDEX_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Work request identity. Receives use the bare region index so the tag for
/// them is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkRequest {
    Recv(usize),
    Credit(usize),
    Ready(usize),
    Write(usize),
}

impl WorkRequest {
    pub(crate) fn wr_id(self) -> u64 {
        let (kind, index) = match self {
            WorkRequest::Recv(index) => (0_u64, index),
            WorkRequest::Credit(index) => (1, index),
            WorkRequest::Ready(index) => (2, index),
            WorkRequest::Write(index) => (3, index),
        };
        (kind << KIND_SHIFT) | (index as u64 & INDEX_MASK)
    }

    pub(crate) fn from_wr_id(wr_id: u64) -> Option<Self> {
        let index = (wr_id & INDEX_MASK) as usize;
        match wr_id >> KIND_SHIFT {
            0 => Some(WorkRequest::Recv(index)),
            1 => Some(WorkRequest::Credit(index)),
            2 => Some(WorkRequest::Ready(index)),
            3 => Some(WorkRequest::Write(index)),
            _ => None,
        }
    }
}

/// What a single completion asks of the loop.
enum Handled {
    Done,
    Notify(BufferRef),
    LinkDown,
}

pub(crate) fn run<F: Fabric>(shared: Arc<ChannelShared<F>>) {
    log::debug!(
        "completion thread started: name={}, low_latency={}",
        shared.name,
        shared.tuning.low_latency
    );
    if let Err(error) = process(&shared) {
        shared.mark_faulted();
        log::error!(
            "completion thread stopped: name={}, error={}",
            shared.name,
            error
        );
        return;
    }
    log::debug!("completion thread exiting: name={}", shared.name);
}

fn process<F: Fabric>(shared: &ChannelShared<F>) -> Result<()> {
    let fabric = &shared.fabric;
    let low_latency = shared.tuning.low_latency;
    let mut completions = Vec::with_capacity(POLL_BATCH);

    if !low_latency {
        let resources = shared.resources.read();
        let cq = resources.cq.as_ref().ok_or(ChannelError::NotConnected)?;
        fabric.req_notify(cq).map_err(transport)?;
    }
    // Completions queued before the first arm never raise an event.
    let mut drain_first = true;
    let mut ready = Vec::new();

    while !shared.event_stop.load(Ordering::Acquire) {
        let resources = shared.resources.read();
        let (Some(cq), Some(comp_channel)) = (&resources.cq, &resources.comp_channel) else {
            return Err(ChannelError::NotConnected);
        };

        if !low_latency && !std::mem::take(&mut drain_first) {
            if !fabric
                .wait_cq_event(comp_channel, shared.tuning.cq_wait_interval)
                .map_err(transport)?
            {
                continue;
            }
            fabric.req_notify(cq).map_err(transport)?;
        }

        let mut drained = 0;
        let mut link_down = false;
        'drain: loop {
            completions.clear();
            let polled = fabric
                .poll_cq(cq, &mut completions, POLL_BATCH)
                .map_err(transport)?;
            if polled == 0 {
                break;
            }
            drained += polled;
            shared.stats.add_completions(polled);
            for completion in &completions {
                match handle_completion(shared, &resources, completion)? {
                    Handled::Done => {}
                    Handled::Notify(buffer) => ready.push(buffer),
                    Handled::LinkDown => {
                        link_down = true;
                        break 'drain;
                    }
                }
            }
        }
        drop(resources);

        for buffer in ready.drain(..) {
            notify(shared, &buffer);
        }
        if link_down {
            log::info!(
                "completion thread stopping, link is down: name={}",
                shared.name
            );
            return Ok(());
        }
        if low_latency && drained == 0 {
            thread::yield_now();
        }
    }
    Ok(())
}

fn notify<F: Fabric>(shared: &ChannelShared<F>, buffer: &BufferRef) {
    let Some(notify) = &shared.notify else {
        return;
    };
    if let Err(error) = notify(buffer) {
        shared.stats.callback_failures();
        log::warn!(
            "notify callback failed: name={}, slot={}, error={}",
            shared.name,
            buffer.index(),
            error
        );
    }
}

fn transport(error: ChannelError) -> ChannelError {
    ChannelError::Transport(error.to_string())
}

fn handle_completion<F: Fabric>(
    shared: &ChannelShared<F>,
    resources: &Resources<F>,
    completion: &Completion,
) -> Result<Handled> {
    if completion.status.is_flush() {
        log::debug!(
            "work request flushed: name={}, opcode={:?}, wr_id={:#x}",
            shared.name,
            completion.opcode,
            completion.wr_id
        );
        return Ok(Handled::LinkDown);
    }
    if let CompletionStatus::Failed(status) = completion.status {
        let qp_num = resources
            .qp
            .as_ref()
            .map_or(0, |qp| shared.fabric.qp_num(qp));
        log::error!(
            "work completion failed: name={}, opcode={:?}, status={}, vendor_err={:#x}, qp_num={}, wr_id={:#x}",
            shared.name,
            completion.opcode,
            status,
            completion.vendor_err,
            qp_num,
            completion.wr_id
        );
        return Err(ChannelError::Transport(format!(
            "{:?} completion failed with status {}",
            completion.opcode, status
        )));
    }

    match WorkRequest::from_wr_id(completion.wr_id) {
        Some(WorkRequest::Recv(region)) => on_receive(shared, resources, region, completion.byte_len),
        Some(_) => Ok(Handled::Done),
        None => {
            log::warn!(
                "completion with unknown wr_id: name={}, wr_id={:#x}",
                shared.name,
                completion.wr_id
            );
            Ok(Handled::Done)
        }
    }
}

/// Copies the record out of `region`, re-posts the receive for it, then
/// applies the record. A buffer that became acquirable is handed back for
/// notification.
fn on_receive<F: Fabric>(
    shared: &ChannelShared<F>,
    resources: &Resources<F>,
    region: usize,
    byte_len: u32,
) -> Result<Handled> {
    let (Some(qp), Some(registrations)) = (&resources.qp, &resources.registrations) else {
        return Err(ChannelError::NotConnected);
    };
    let record = registrations
        .region()
        .read_record(region)
        .ok_or_else(|| ChannelError::Transport(format!("receive for unknown region {region}")))?;
    registrations
        .post_control_recv(&shared.fabric, qp, region)
        .map_err(transport)?;

    let len = (byte_len as usize).min(MESSAGE_BYTES);
    let message = match WireMessage::decode(&record[..len]) {
        Ok(message) => message,
        Err(violation) => {
            shared.stats.protocol_violations();
            log::warn!(
                "discarding control record: name={}, region={}, reason={}",
                shared.name,
                region,
                violation
            );
            return Ok(Handled::Done);
        }
    };

    let applied = match (shared.role, message) {
        (Role::Receiver, WireMessage::BufferReady { slot, seq, len }) => shared
            .slots
            .on_buffer_ready(slot as usize, seq, len)
            .inspect(|_| shared.stats.buffers_received()),
        (
            Role::Transmitter,
            WireMessage::BufferDone {
                slot,
                seq,
                remote_addr,
                rkey,
                capacity,
            },
        ) => shared
            .slots
            .on_buffer_done(slot as usize, seq, remote_addr, rkey, capacity)
            .inspect(|_| shared.stats.credits_received()),
        (role, _) => Err(SlotRejection::WrongRole { role }),
    };

    match applied {
        Ok(buffer) => return Ok(Handled::Notify(buffer)),
        Err(rejection) => {
            shared.stats.rejected_messages();
            log::warn!(
                "rejected {}: name={}, slot={}, reason={}",
                message.kind(),
                shared.name,
                message.slot(),
                rejection
            );
        }
    }
    Ok(Handled::Done)
}
