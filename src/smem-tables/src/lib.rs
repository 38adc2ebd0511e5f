// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binary layouts for the shared descriptor region (SMEM) that the firmware
//! exports to the host OS.
//!
//! Every structure in this crate is `#[repr(C, packed)]` with little-endian
//! fields so that writing it with [`IntoBytes`](zerocopy::IntoBytes) produces
//! exactly the bytes the host-side drivers expect, independent of the build
//! architecture.

use vm_memory::{GuestAddress, GuestMemory, GuestMemoryError};

pub mod ars;
pub mod info;

pub use ars::{ArsExchangeHdr, ArsRecord};
pub use info::{MemRegionDesc, NvdimmDesc, PlatformInfo, SmemHeader};

/// Total size of the shared descriptor region.
pub const SMEM_SIZE: usize = 4096;

/// Offset of the ARS exchange block within the shared region.
pub const ARS_EXCHANGE_OFFSET: usize = 0xC00;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum SmemError {
    /// System memory error: {0}
    Memory(#[from] GuestMemoryError),
    /// Invalid system address
    InvalidAddress,
    /// Table capacity exceeded
    Capacity,
    /// Region descriptors must be added sorted by base and non-overlapping
    Unsorted,
    /// NVDIMM descriptor references a region that does not exist
    BadRegionIndex,
}

pub type Result<T> = std::result::Result<T, SmemError>;

/// A trait for functionality around SMEM descriptor tables.
pub trait Table {
    /// Get the length of the table
    fn len(&self) -> usize;

    /// Return true if the table is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the table into system memory
    fn write_to_mem<M: GuestMemory>(&mut self, mem: &M, address: GuestAddress) -> Result<()>;
}
