// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! System physical memory as the firmware sees it.
//!
//! The memory map is a set of disjoint physical ranges backed by anonymous
//! mmap. Firmware subsystems access it exclusively through the
//! [`vm_memory::Bytes`] and [`vm_memory::GuestMemory`] traits so that the
//! scrub engine and the shared-region code never care what actually backs a
//! range.

use vm_memory::{Error as VmMemoryError, GuestAddress, GuestMemoryMmap};

pub use vm_memory::{Address, Bytes, GuestMemory, GuestMemoryError};

/// Type of the firmware view of system memory.
pub type SysMemory = GuestMemoryMmap<()>;

/// Errors associated with building the system memory map.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MemoryError {
    /// Cannot create system memory map: {0}
    VmMemory(#[from] VmMemoryError),
    /// No memory ranges configured
    Empty,
}

/// Maps one anonymous region per configured physical range.
///
/// Ranges must be disjoint and sorted by base address.
pub fn anonymous(
    ranges: impl Iterator<Item = (GuestAddress, usize)>,
) -> Result<SysMemory, MemoryError> {
    let ranges = ranges.collect::<Vec<_>>();
    if ranges.is_empty() {
        return Err(MemoryError::Empty);
    }
    SysMemory::from_ranges(&ranges).map_err(MemoryError::VmMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous() {
        let err = anonymous([].into_iter()).unwrap_err();
        assert!(matches!(err, MemoryError::Empty));

        let mem = anonymous(
            [
                (GuestAddress(0), 0x1000usize),
                (GuestAddress(0x10000), 0x2000usize),
            ]
            .into_iter(),
        )
        .unwrap();
        assert_eq!(mem.num_regions(), 2);

        // Writes land in the right region and unmapped holes error out.
        mem.write_obj(0x1122_3344u32, GuestAddress(0x10000)).unwrap();
        assert_eq!(
            mem.read_obj::<u32>(GuestAddress(0x10000)).unwrap(),
            0x1122_3344
        );
        mem.read_obj::<u32>(GuestAddress(0x8000)).unwrap_err();

        // Overlapping ranges are rejected by the backend.
        anonymous([(GuestAddress(0), 0x2000usize), (GuestAddress(0x1000), 0x1000usize)].into_iter())
            .unwrap_err();
    }
}
