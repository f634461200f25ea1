// src/acquisition/mod.rs
//! Multi-device acquisition: sessions, transfer pipeline, reassembly and buffering

pub mod engine;
pub mod reassembler;
pub mod session;
pub mod transfer;
pub mod windowed_buffer;

pub use engine::{AcquisitionEngine, AcquisitionStats, EngineState, StreamSegment};
pub use reassembler::{reassemble, ScanLayout, ScanReassembler};
pub use session::{open_and_init, plan_call_sequence, CallSequence, DeviceSession};
pub use transfer::{DevicePipeline, SlotCursor, SlotState, SweepStep, TransferSlot};
pub use windowed_buffer::WindowedBuffer;
