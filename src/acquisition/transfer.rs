// src/acquisition/transfer.rs
//! Transfer slots and the resumable device × slot cursor of the acquisition loop

use crate::hal::TransferRequest;
use std::sync::Arc;

/// Liveness of one transfer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Submitted to the driver, completion outstanding
    Pending,
    /// Completion observed, not yet resubmitted
    Completed,
    /// Buffer and completion event released
    Recycled,
}

/// One in-flight read: receive buffer and completion event, acquired and released together
#[derive(Debug)]
pub struct TransferSlot {
    request: Option<Arc<TransferRequest>>,
    state: SlotState,
}

impl TransferSlot {
    pub fn new(transfer_bytes: usize) -> Self {
        Self {
            request: Some(Arc::new(TransferRequest::new(transfer_bytes))),
            state: SlotState::Completed,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Request backing this slot; `None` once recycled
    pub fn request(&self) -> Option<&Arc<TransferRequest>> {
        self.request.as_ref()
    }

    /// Clear the completion state ahead of a (re)submission
    pub fn rearm(&mut self) {
        if let Some(request) = &self.request {
            request.rearm();
            self.state = SlotState::Pending;
        }
    }

    pub fn mark_completed(&mut self) {
        if self.state == SlotState::Pending {
            self.state = SlotState::Completed;
        }
    }

    /// Drop the buffer and event; returns false if already released
    pub fn recycle(&mut self) -> bool {
        self.state = SlotState::Recycled;
        self.request.take().is_some()
    }
}

/// The `Q` slots of one device
#[derive(Debug)]
pub struct DevicePipeline {
    slots: Vec<TransferSlot>,
    transfer_bytes: usize,
}

impl DevicePipeline {
    pub fn new(queue_depth: usize, transfer_bytes: usize) -> Self {
        Self {
            slots: (0..queue_depth).map(|_| TransferSlot::new(transfer_bytes)).collect(),
            transfer_bytes,
        }
    }

    /// Exact size of a complete transfer
    pub fn transfer_bytes(&self) -> usize {
        self.transfer_bytes
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&TransferSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut TransferSlot> {
        self.slots.get_mut(index)
    }

    /// Slots still holding their resources
    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.state != SlotState::Recycled).count()
    }
}

/// One step of a cleanup sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStep {
    pub device: usize,
    pub slot: usize,
    /// First time the sweep reaches this device
    pub first_visit: bool,
}

/// Position of the acquisition loop in its slot-major, device-minor walk
///
/// The loop advances the cursor as it services each (device, slot) pair. Teardown
/// resumes from wherever the cursor stopped and visits every pair exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCursor {
    devices: usize,
    depth: usize,
    device: usize,
    slot: usize,
}

impl SlotCursor {
    pub fn new(devices: usize, depth: usize) -> Self {
        Self {
            devices,
            depth,
            device: 0,
            slot: 0,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Move to the next device; after the last device wrap to the next slot index
    ///
    /// Returns true when the walk wrapped from the last slot back to slot 0.
    pub fn advance(&mut self) -> bool {
        if self.devices == 0 || self.depth == 0 {
            return false;
        }
        self.device += 1;
        if self.device < self.devices {
            return false;
        }
        self.device = 0;
        self.slot += 1;
        if self.slot < self.depth {
            return false;
        }
        self.slot = 0;
        true
    }

    /// Position a later stage (device start, initial submission) at `device`, slot 0
    pub fn seek(&mut self, device: usize, slot: usize) {
        self.device = device.min(self.devices.saturating_sub(1));
        self.slot = slot.min(self.depth.saturating_sub(1));
    }

    /// Every (device, slot) pair exactly once, starting at the cursor and wrapping
    pub fn sweep(&self) -> impl Iterator<Item = SweepStep> {
        let Self {
            devices,
            depth,
            device,
            slot,
        } = *self;
        (0..depth).flat_map(move |pass| {
            (0..devices).map(move |offset| SweepStep {
                device: (device + offset) % devices,
                slot: (slot + pass) % depth,
                first_visit: pass == 0,
            })
        })
    }
}
