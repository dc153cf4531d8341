//! Hardware-independent core library for sleepsense
//!
//! This crate contains the concurrency and resource-management backbone of
//! the sleepsense wearable: per-sensor periodic scheduling, shared-bus
//! arbitration, the audio capture queue that bridges interrupt context into
//! tasks, SpO2 fusion, and the flash-backed append log with chunked upload.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod capture;
pub mod config;
pub mod sensors;
pub mod storage;

/// Milliseconds since boot, truncated to the 32-bit timestamp used by samples
/// and log records.
pub fn now_ms() -> u32 {
    embassy_time::Instant::now().as_millis() as u32
}
