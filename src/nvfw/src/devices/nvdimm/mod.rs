// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements the NVDIMM persistence command engine.

pub mod device;
pub mod metrics;
pub mod regs;

pub use self::device::{DimmIndex, NvdimmCtrl, NvdimmIdentity, RegisterAccess};

/// Nominal duration of one polling tick.
pub const POLL_TICK_MS: u64 = 100;
/// How long a workflow waits for the controller to go idle before starting.
pub const IDLE_TIMEOUT_MS: u64 = 1_000;
/// Upper bound on the module-reported restore timeout.
pub const MAX_RESTORE_TIMEOUT_MS: u64 = 60_000;
/// Upper bound on the module-reported arm timeout.
pub const MAX_ARM_TIMEOUT_MS: u64 = 60_000;
/// Upper bound on the module-reported abort timeout.
pub const MAX_ABORT_TIMEOUT_MS: u64 = 10_000;

/// Register transport failure.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum TransportError {
    /// Register read failed (dimm {0}, register {1:#04x})
    Read(DimmIndex, u8),
    /// Register write failed (dimm {0}, register {1:#04x})
    Write(DimmIndex, u8),
}

/// NVDIMM workflow errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum NvdimmError {
    /// Register transport failure: {0}
    Transport(#[from] TransportError),
    /// Controller did not go idle within {IDLE_TIMEOUT_MS} ms
    NotIdle,
    /// Restore finished without success (status {0:#04x})
    RestoreFailed(u8),
    /// Arm finished without success (status {0:#04x})
    ArmFailed(u8),
    /// Abort finished without success (status {0:#04x})
    AbortFailed(u8),
}
