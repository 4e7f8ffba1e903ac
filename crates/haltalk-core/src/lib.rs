//! Haltalk Core - wire framing, protocol constants, and the HAL pin/signal model
//!
//! This crate provides the foundational types for the Haltalk messaging layer:
//! - Wire framing with a continuation-character prefix and message reassembly
//! - The protocol constant table shared with the machine-control backend
//! - Pin/signal records and the handle-indexed shadow table with
//!   full/incremental update semantics

pub mod frame;
pub mod hal;
pub mod proto;

pub use frame::{Frame, FrameError, Message, MessageAssembler};
pub use hal::{HalValue, Pin, PinChange, ShadowTable, Signal, SignalChange, TableError};
