// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address Range Scrub exchange block.
//!
//! The last kilobyte of the shared region carries a mailbox through which the
//! host OS submits scrub requests and the firmware publishes results. The
//! field layout and the status encodings mirror the ACPI ARS method family so
//! that an OSPM-side driver can forward the payloads unmodified:
//! https://uefi.org/specs/ACPI/6.5/09_ACPI_Defined_Devices_and_Device_Specific_Objects.html#address-range-scrubbing-ars

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Query the scrub capabilities of the platform.
pub const FUNC_QUERY_CAPS: u32 = 1;
/// Start a scrub over a physical address range.
pub const FUNC_START_ARS: u32 = 2;
/// Read back scan progress and the error records found so far.
pub const FUNC_QUERY_STATUS: u32 = 3;
/// Clear an uncorrectable error range by zero-filling it.
pub const FUNC_CLEAR_ERROR: u32 = 4;
/// Translate a system physical address to a device handle and DPA.
pub const FUNC_TRANSLATE_SPA: u32 = 5;

/// Command status published in [`ArsExchangeHdr::status`].
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArsStatus {
    Success = 0,
    UnknownFunction = 1,
    InvalidParams = 2,
    HardwareError = 3,
    Busy = 6,
}

/// Scan state published in [`ArsExchangeHdr::extended_status`].
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// No scrub has been performed since boot.
    NoArs = 0,
    /// A scrub is running; outputs other than the restart cursor are unstable.
    InProgress = 1,
    /// The last scrub covered the whole requested range.
    Complete = 2,
    /// The last scrub stopped early; partial results are valid.
    PrematurelyStopped = 3,
}

impl ScanState {
    /// Decodes the halfword form. Unknown encodings read as `NoArs`; the
    /// firmware never writes one, so they can only come from a scribbled
    /// block, which a fresh start request repairs.
    pub fn from_raw(raw: u16) -> ScanState {
        match raw {
            1 => ScanState::InProgress,
            2 => ScanState::Complete,
            3 => ScanState::PrematurelyStopped,
            _ => ScanState::NoArs,
        }
    }
}

/// Start request type bit: scrub volatile regions.
pub const ARS_TYPE_VOLATILE: u16 = 1 << 0;
/// Start request type bit: scrub persistent regions.
pub const ARS_TYPE_PERSISTENT: u16 = 1 << 1;

/// Status report flag: the record array overflowed.
pub const ARS_FLAG_OVERFLOW: u16 = 1 << 0;

/// Capacity of the error record array.
pub const MAX_ARS_RECORDS: usize = 32;

/// Offset of the status report within the exchange block.
///
/// The report sits at a fixed spot right behind the header so that readers
/// can poll scan progress without negotiating a buffer location.
pub const ARS_REPORT_OFFSET: usize = size_of::<ArsExchangeHdr>();

/// Offset of the request/result scratch area within the exchange block.
///
/// Inputs and the small outputs live here, behind the report, so that a
/// Query-Capabilities or Translate-SPA served mid-scan cannot clobber the
/// live report.
pub const ARS_AUX_OFFSET: usize = ARS_REPORT_OFFSET + size_of::<ArsStatusReport>();

/// Fixed header at the base of the exchange block.
///
/// `extended_status` is the publication point of the whole block: the
/// firmware writes every other output byte first and this halfword last.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArsExchangeHdr {
    pub function: U32,
    pub status: U16,
    pub extended_status: U16,
    pub output_length: U32,
}

/// Query-Capabilities output payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArsCapabilities {
    pub max_query_size: U32,
    pub clear_unit: U32,
}

/// Start-ARS input payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArsStartRequest {
    pub start_pa: U64,
    pub start_len: U64,
    pub ars_type: U16,
}

/// One uncorrectable error range found by a scrub.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArsRecord {
    pub handle: U32,
    pub reserved: U32,
    pub pa: U64,
    pub len: U64,
}

/// Query-Status output payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArsStatusReport {
    pub start_pa: U64,
    pub start_len: U64,
    pub restart_pa: U64,
    pub restart_len: U64,
    pub ars_type: U16,
    pub flags: U16,
    pub record_count: U32,
    pub records: [ArsRecord; MAX_ARS_RECORDS],
}

/// Clear-Error input payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ClearErrorRequest {
    pub pa: U64,
    pub len: U64,
}

/// Clear-Error output payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ClearErrorResult {
    pub cleared_length: U64,
}

/// Translate-SPA input payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TranslateSpaRequest {
    pub pa: U64,
}

/// Translate-SPA output payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TranslateSpaResult {
    pub translated_len: U64,
    pub handle: U32,
    pub reserved: U32,
    pub dpa: U64,
}
