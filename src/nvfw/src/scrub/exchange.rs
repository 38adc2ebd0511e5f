// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The ARS exchange block within the shared region.
//!
//! External callers and the engine communicate exclusively through this
//! block; there is no lock. The protocol holds because of two rules:
//! callers only ring the doorbell after their request bytes are in place,
//! and the engine makes every output visible before the status pair via
//! [`ArsExchange::publish`]. `post_*` are the caller-side helpers, used by
//! the demo front-end and the tests; everything else is the engine side.

use std::mem::offset_of;
use std::sync::atomic::{Ordering, fence};

use smem_tables::ars::{
    ARS_AUX_OFFSET, ARS_REPORT_OFFSET, ArsExchangeHdr, ArsStartRequest, ArsStatus,
    ArsStatusReport, ClearErrorRequest, FUNC_CLEAR_ERROR, FUNC_START_ARS, FUNC_TRANSLATE_SPA,
    ScanState, TranslateSpaRequest,
};
use smem_tables::{ARS_EXCHANGE_OFFSET, SMEM_SIZE, SmemHeader};
use vm_memory::{Address, Bytes, GuestAddress};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::ScrubError;
use crate::mem::SysMemory;
use crate::utils::usize_to_u64;

const FUNCTION_OFFSET: usize = offset_of!(ArsExchangeHdr, function);
const STATUS_OFFSET: usize = offset_of!(ArsExchangeHdr, status);
const OUTPUT_LENGTH_OFFSET: usize = offset_of!(ArsExchangeHdr, output_length);

/// View of the exchange block at its fixed offset in the shared region.
#[derive(Debug, Clone)]
pub struct ArsExchange {
    mem: SysMemory,
    base: GuestAddress,
}

impl ArsExchange {
    /// Opens the exchange block of the shared region at `smem_base`.
    ///
    /// The region must already be populated; the signature is the only
    /// validity check any reader gets.
    pub fn new(mem: SysMemory, smem_base: GuestAddress) -> Result<Self, ScrubError> {
        let header = SmemHeader::read_from_mem(&mem, smem_base)?;
        if !header.is_valid() {
            return Err(ScrubError::BadSignature(smem_base.raw_value()));
        }
        let base = smem_base
            .checked_add(usize_to_u64(ARS_EXCHANGE_OFFSET))
            .ok_or(ScrubError::ExchangeBounds)?;
        Ok(Self { mem, base })
    }

    /// Zeroes the whole exchange block.
    ///
    /// Runs once when scrub capability is brought up; leaves the block in
    /// the boot state (`NoArs`, no records).
    pub fn reset(&self) -> Result<(), ScrubError> {
        let zeros = [0u8; SMEM_SIZE - ARS_EXCHANGE_OFFSET];
        Ok(self.mem.write_slice(&zeros, self.base)?)
    }

    /// Reads the exchange header.
    pub fn header(&self) -> Result<ArsExchangeHdr, ScrubError> {
        self.read_at(0)
    }

    /// Reads the current scan state.
    pub fn scan_state(&self) -> Result<ScanState, ScrubError> {
        Ok(ScanState::from_raw(self.header()?.extended_status.get()))
    }

    /// Reads the status report.
    pub fn report(&self) -> Result<ArsStatusReport, ScrubError> {
        self.read_at(ARS_REPORT_OFFSET)
    }

    /// Writes the status report. Not visible to pollers until published.
    pub fn write_report(&self, report: &ArsStatusReport) -> Result<(), ScrubError> {
        self.write_at(ARS_REPORT_OFFSET, report)
    }

    /// Reads the Start-ARS request payload.
    pub fn start_request(&self) -> Result<ArsStartRequest, ScrubError> {
        self.read_at(ARS_AUX_OFFSET)
    }

    /// Reads the Clear-Error request payload.
    pub fn clear_request(&self) -> Result<ClearErrorRequest, ScrubError> {
        self.read_at(ARS_AUX_OFFSET)
    }

    /// Reads the Translate-SPA request payload.
    pub fn translate_request(&self) -> Result<TranslateSpaRequest, ScrubError> {
        self.read_at(ARS_AUX_OFFSET)
    }

    /// Writes a small output payload and records its length in the header.
    pub fn write_output<T: IntoBytes + Immutable>(&self, out: &T) -> Result<(), ScrubError> {
        self.write_at(ARS_AUX_OFFSET, out)?;
        self.set_output_length(size_of::<T>())
    }

    /// Records the number of valid output bytes in the header.
    pub fn set_output_length(&self, len: usize) -> Result<(), ScrubError> {
        // Outputs are always a few hundred bytes at most.
        self.write_at(OUTPUT_LENGTH_OFFSET, &U32::new(len as u32))
    }

    /// Publishes an operation outcome.
    ///
    /// Every output byte must already be in place. The fence orders those
    /// stores ahead of the status pair, which is written as one 4-byte store
    /// so a poller can never pair a fresh status with a stale scan state.
    pub fn publish(&self, status: ArsStatus, state: ScanState) -> Result<(), ScrubError> {
        let mut pair = [0u8; 4];
        pair[..2].copy_from_slice(&(status as u16).to_le_bytes());
        pair[2..].copy_from_slice(&(state as u16).to_le_bytes());
        fence(Ordering::Release);
        Ok(self.mem.write_slice(&pair, self.addr(STATUS_OFFSET)?)?)
    }

    /// Caller side: posts a function code, ready for a doorbell ring.
    pub fn post_function(&self, function: u32) -> Result<(), ScrubError> {
        self.write_at(FUNCTION_OFFSET, &U32::new(function))
    }

    /// Caller side: posts a Start-ARS request.
    pub fn post_start(&self, req: &ArsStartRequest) -> Result<(), ScrubError> {
        self.write_at(ARS_AUX_OFFSET, req)?;
        self.post_function(FUNC_START_ARS)
    }

    /// Caller side: posts a Clear-Error request.
    pub fn post_clear(&self, req: &ClearErrorRequest) -> Result<(), ScrubError> {
        self.write_at(ARS_AUX_OFFSET, req)?;
        self.post_function(FUNC_CLEAR_ERROR)
    }

    /// Caller side: posts a Translate-SPA request.
    pub fn post_translate(&self, req: &TranslateSpaRequest) -> Result<(), ScrubError> {
        self.write_at(ARS_AUX_OFFSET, req)?;
        self.post_function(FUNC_TRANSLATE_SPA)
    }

    /// Caller side: reads back a small output payload.
    pub fn read_output<T: FromBytes + IntoBytes>(&self) -> Result<T, ScrubError> {
        self.read_at(ARS_AUX_OFFSET)
    }

    /// Caller side: reads the command status halfword.
    pub fn status(&self) -> Result<u16, ScrubError> {
        Ok(self.header()?.status.get())
    }

    fn addr(&self, offset: usize) -> Result<GuestAddress, ScrubError> {
        self.base
            .checked_add(usize_to_u64(offset))
            .ok_or(ScrubError::ExchangeBounds)
    }

    fn read_at<T: FromBytes + IntoBytes>(&self, offset: usize) -> Result<T, ScrubError> {
        let mut val = T::new_zeroed();
        self.mem.read_slice(val.as_mut_bytes(), self.addr(offset)?)?;
        Ok(val)
    }

    fn write_at<T: IntoBytes + Immutable>(&self, offset: usize, val: &T) -> Result<(), ScrubError> {
        Ok(self.mem.write_slice(val.as_bytes(), self.addr(offset)?)?)
    }
}
