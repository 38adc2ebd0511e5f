// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! NVDIMM module control-register map.
//!
//! Byte-wide registers reached over the module transport, following the JEDEC
//! byte-addressable energy-backed interface conventions: identity bytes at the
//! bottom of the page, one write-one-to-clear status register per workflow,
//! two-byte timeout fields and a single command register the engine strobes.

use bitflags::bitflags;

/// JEDEC vendor id, low byte.
pub const VENDOR_ID0: u8 = 0x00;
/// JEDEC vendor id, high byte.
pub const VENDOR_ID1: u8 = 0x01;
/// Controller device id, low byte.
pub const DEVICE_ID0: u8 = 0x02;
/// Controller device id, high byte.
pub const DEVICE_ID1: u8 = 0x03;
/// Controller revision.
pub const REVISION_ID: u8 = 0x04;
/// Module serial number, four bytes starting here.
pub const SERIAL0: u8 = 0x08;

/// Live operation status, read-only.
pub const MODULE_STATUS: u8 = 0x10;
/// Restore completion status, write-one-to-clear.
pub const RESTORE_STATUS: u8 = 0x14;
/// Arm completion status, write-one-to-clear.
pub const ARM_STATUS: u8 = 0x15;
/// Abort completion status, write-one-to-clear.
pub const ABORT_STATUS: u8 = 0x16;

/// Module restore timeout, low byte.
pub const RESTORE_TIMEOUT0: u8 = 0x18;
/// Module restore timeout, high byte.
pub const RESTORE_TIMEOUT1: u8 = 0x19;
/// Module arm timeout, low byte.
pub const ARM_TIMEOUT0: u8 = 0x1A;
/// Module arm timeout, high byte.
pub const ARM_TIMEOUT1: u8 = 0x1B;
/// Module abort timeout, low byte.
pub const ABORT_TIMEOUT0: u8 = 0x1C;
/// Module abort timeout, high byte.
pub const ABORT_TIMEOUT1: u8 = 0x1D;

/// Workflow command register, write-only strobes.
pub const FUNC_CMD: u8 = 0x40;

/// Timeout high-byte flag selecting 1 s units instead of 100 ms units.
pub const TIMEOUT_UNIT_SECONDS: u8 = 1 << 7;

bitflags! {
    /// Bits of the MODULE_STATUS register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleStatus: u8 {
        /// Some controller operation is in flight; commands are ignored.
        const OP_IN_PROGRESS = 1 << 0;
        /// A restore is running.
        const RESTORE_IN_PROGRESS = 1 << 1;
        /// An arm is running.
        const ARM_IN_PROGRESS = 1 << 2;
        /// An abort is running.
        const ABORT_IN_PROGRESS = 1 << 3;
    }
}

bitflags! {
    /// Bits of the FUNC_CMD register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuncCmd: u8 {
        /// Begin restoring module contents from the energy-backed image.
        const START_RESTORE = 1 << 0;
        /// Arm the module to save its contents on power loss.
        const START_ARM = 1 << 1;
        /// Abort the operation in flight.
        const ABORT = 1 << 2;
    }
}

bitflags! {
    /// Bits of the per-workflow completion status registers.
    ///
    /// RESTORE_STATUS, ARM_STATUS and ABORT_STATUS share this layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkflowStatus: u8 {
        /// The last workflow of this kind completed successfully.
        const SUCCESS = 1 << 0;
        /// The last workflow of this kind failed.
        const ERROR = 1 << 1;
    }
}

/// Decodes a two-register timeout field into milliseconds.
///
/// The low seven bits of the high byte extend the low byte to a 15 bit value;
/// the top bit of the high byte selects the unit.
pub fn decode_timeout_ms(lo: u8, hi: u8) -> u64 {
    let raw = (u64::from(hi & !TIMEOUT_UNIT_SECONDS) << 8) | u64::from(lo);
    if hi & TIMEOUT_UNIT_SECONDS != 0 {
        raw * 1000
    } else {
        raw * 100
    }
}
