use std::ptr::NonNull;

use crate::{
    api::{BufferSpec, Role},
    backend::{Fabric, MemoryAccess},
    control_protocol::MESSAGE_BYTES,
    error::{ChannelError, Result},
    event_loop::WorkRequest,
};

/// One receive record per slot, indexed by slot number.
pub struct ControlRegion {
    ptr: NonNull<u8>,
    records: usize,
}

// SAFETY: the region is plain bytes. The fabric writes a record only while
// the matching receive is posted, and the completion thread reads it only
// after the completion for that receive has been polled.
unsafe impl Send for ControlRegion {}
unsafe impl Sync for ControlRegion {}

impl ControlRegion {
    pub fn new(records: usize) -> Self {
        let boxed = vec![0_u8; records * MESSAGE_BYTES].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        Self {
            // Box::into_raw never yields null; a zero-length box yields a dangling pointer.
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            records,
        }
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.records * MESSAGE_BYTES
    }

    pub fn record_addr(&self, index: usize) -> Option<u64> {
        (index < self.records).then(|| self.addr() + (index * MESSAGE_BYTES) as u64)
    }

    /// Copies out the record at `index`. Only call once the receive posted
    /// for that record has completed.
    pub fn read_record(&self, index: usize) -> Option<[u8; MESSAGE_BYTES]> {
        if index >= self.records {
            return None;
        }
        let mut record = [0_u8; MESSAGE_BYTES];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(index * MESSAGE_BYTES),
                record.as_mut_ptr(),
                MESSAGE_BYTES,
            );
        }
        Some(record)
    }
}

impl Drop for ControlRegion {
    fn drop(&mut self) {
        if self.records == 0 {
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len());
        unsafe {
            drop(Box::from_raw(slice));
        }
    }
}

/// Registered handles for every slot plus the control region. Field order is
/// drop order: all registrations go before the control memory they cover.
pub struct Registrations<F: Fabric> {
    slots: Vec<F::Mr>,
    control: F::Mr,
    region: ControlRegion,
}

impl<F: Fabric> Registrations<F> {
    /// Registers every slot and the control region, or nothing.
    pub fn register_all(
        fabric: &F,
        pd: &F::Pd,
        role: Role,
        buffers: &[BufferSpec],
    ) -> Result<Self> {
        let access = match role {
            Role::Receiver => MemoryAccess::RemoteWrite,
            Role::Transmitter => MemoryAccess::Local,
        };

        let mut slots = Vec::with_capacity(buffers.len());
        for (index, buffer) in buffers.iter().enumerate() {
            let mr = fabric
                .register_memory(pd, buffer.addr(), buffer.capacity(), access)
                .map_err(|error| {
                    log::error!(
                        "register slot failed: index={}, addr={:#x}, len={}, registered={}, error={}",
                        index,
                        buffer.addr(),
                        buffer.capacity(),
                        slots.len(),
                        error
                    );
                    ChannelError::Allocation(format!("register slot {index}: {error}"))
                })?;
            slots.push(mr);
        }

        let region = ControlRegion::new(buffers.len());
        let control = fabric
            .register_memory(pd, region.addr(), region.len(), MemoryAccess::Local)
            .map_err(|error| {
                log::error!(
                    "register control region failed: len={}, error={}",
                    region.len(),
                    error
                );
                ChannelError::Allocation(format!("register control region: {error}"))
            })?;

        log::debug!(
            "memory registered: slots={}, access={:?}, control_bytes={}",
            slots.len(),
            access,
            region.len()
        );
        Ok(Self {
            slots,
            control,
            region,
        })
    }

    pub fn slot(&self, index: usize) -> Option<&F::Mr> {
        self.slots.get(index)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn region(&self) -> &ControlRegion {
        &self.region
    }

    /// Posts the receive for `index`'s control record.
    pub fn post_control_recv(&self, fabric: &F, qp: &F::Qp, index: usize) -> Result<()> {
        let addr = self
            .region
            .record_addr(index)
            .ok_or(ChannelError::InvalidArgument("control record out of range"))?;
        fabric.post_recv(
            qp,
            WorkRequest::Recv(index).wr_id(),
            &self.control,
            addr,
            MESSAGE_BYTES as u32,
        )
    }

    /// Number of regions this set holds registered, control region included.
    pub fn region_count(&self) -> usize {
        self.slots.len() + 1
    }
}
