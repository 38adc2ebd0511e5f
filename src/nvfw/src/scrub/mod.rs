// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements the Address Range Scrub engine.
//!
//! Two wakeup sources drive the engine: a software interrupt line over which
//! external callers post functions into the exchange block, and a one-shot
//! down-counter that paces the scan itself. A scan never blocks; each wakeup
//! probes at most one block and defers the rest to the next down-counter
//! firing. All progress and results live in the exchange block, published
//! with a store fence ahead of the status pair so external pollers never see
//! a half-written state.

pub mod engine;
pub mod event_handler;
pub mod exchange;
pub mod metrics;
pub mod port;

use crate::logger::{IncMetric, error};
use crate::scrub::metrics::METRICS;

pub use self::engine::{ArsEngine, ScrubRegion};
pub use self::exchange::ArsExchange;
pub use self::port::{MemScrubPort, ScrubPort};

/// Bytes per cache line, the fault localization granule.
pub const CACHE_LINE_SIZE: u64 = 64;
/// Cache lines per scrub block.
pub const LINES_PER_BLOCK: u64 = 64;
/// Bytes probed per down-counter period, one page.
pub const SCRUB_BLOCK_SIZE: u64 = CACHE_LINE_SIZE * LINES_PER_BLOCK;
/// Down-counter period between block probes, in microseconds. Long enough
/// for an in-flight fault signal to resolve, short enough to be negligible.
pub const SCAN_INTERVAL_US: u64 = 4;

/// Scrub engine errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ScrubError {
    /// System memory access failed: {0}
    Memory(#[from] vm_memory::GuestMemoryError),
    /// Shared region table error: {0}
    Smem(#[from] smem_tables::SmemError),
    /// Shared region signature missing at {0:#x}
    BadSignature(u64),
    /// Exchange block escapes the shared region
    ExchangeBounds,
    /// Software interrupt line error: {0}
    EventFd(std::io::Error),
    /// Down-counter error: {0}
    Timer(std::io::Error),
}

pub(crate) fn report_scrub_event_fail(err: ScrubError) {
    error!("ars: {err}");
    METRICS.event_fails.inc();
}
