// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::mem::size_of;

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Result, SmemError, Table};

/// Signature the host OS uses to recognize the shared region.
pub const SMEM_SIGNATURE: [u8; 4] = *b"UEFI";
/// Layout revision written into the header.
pub const SMEM_REVISION: u32 = 1;

/// Maximum number of memory region descriptors.
pub const MAX_MEM_REGIONS: usize = 16;
/// Maximum number of NVDIMM descriptors.
pub const MAX_NVDIMMS: usize = 16;

/// Offset of the region descriptor array within the shared region.
pub const REGION_TABLE_OFFSET: usize = 32;
/// Offset of the NVDIMM descriptor array within the shared region.
pub const NVDIMM_TABLE_OFFSET: usize = REGION_TABLE_OFFSET + MAX_MEM_REGIONS * 24;

/// Header flag: at least one NVDIMM was discovered.
pub const SMEM_NVDIMM_PRESENT: u32 = 1 << 0;
/// Header flag: the platform services Address Range Scrub requests.
pub const SMEM_SCRUB_CAPABLE: u32 = 1 << 1;

/// Region flag: the region is backed by NVDIMM media.
pub const REGION_NVDIMM_BACKED: u8 = 1 << 0;

/// Header at the base of the shared descriptor region.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SmemHeader {
    pub revision: U32,
    pub signature: [u8; 4],
    pub flags: U32,
    pub region_count: U32,
    pub nvdimm_count: U32,
    reserved: [u8; 12],
}

impl SmemHeader {
    fn new(revision: u32) -> Self {
        SmemHeader {
            revision: U32::new(revision),
            signature: SMEM_SIGNATURE,
            flags: U32::ZERO,
            region_count: U32::ZERO,
            nvdimm_count: U32::ZERO,
            reserved: [0; 12],
        }
    }

    /// Read a header back from system memory.
    pub fn read_from_mem<M: GuestMemory>(mem: &M, address: GuestAddress) -> Result<Self> {
        let mut buf = [0u8; size_of::<SmemHeader>()];
        mem.read_slice(&mut buf, address)?;
        SmemHeader::read_from_bytes(&buf).map_err(|_| SmemError::InvalidAddress)
    }

    pub fn is_valid(&self) -> bool {
        self.signature == SMEM_SIGNATURE
    }
}

/// Physical memory range owned by one memory controller channel.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MemRegionDesc {
    pub socket: u8,
    pub mc: u8,
    pub channel: u8,
    pub flags: u8,
    reserved: U32,
    pub base: U64,
    pub length: U64,
}

impl MemRegionDesc {
    pub fn new(socket: u8, mc: u8, channel: u8, flags: u8, base: u64, length: u64) -> Self {
        MemRegionDesc {
            socket,
            mc,
            channel,
            flags,
            reserved: U32::ZERO,
            base: U64::new(base),
            length: U64::new(length),
        }
    }

    pub fn is_nvdimm_backed(&self) -> bool {
        self.flags & REGION_NVDIMM_BACKED != 0
    }

    /// First address past the end of the region.
    pub fn end(&self) -> u64 {
        self.base.get().saturating_add(self.length.get())
    }
}

/// Identity of one discovered NVDIMM.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct NvdimmDesc {
    pub vendor: U16,
    pub device: U16,
    pub revision: u8,
    pub serial: [u8; 4],
    pub region: u8,
    reserved: [u8; 6],
}

impl NvdimmDesc {
    pub fn new(vendor: u16, device: u16, revision: u8, serial: [u8; 4], region: u8) -> Self {
        NvdimmDesc {
            vendor: U16::new(vendor),
            device: U16::new(device),
            revision,
            serial,
            region,
            reserved: [0; 6],
        }
    }
}

/// Platform description published to the host OS.
///
/// Collects the header and the two descriptor arrays and writes them as one
/// table at the base of the shared region. Regions must be added in ascending
/// base order and may not overlap; NVDIMM descriptors back-reference regions
/// by index.
#[derive(Debug)]
pub struct PlatformInfo {
    header: SmemHeader,
    regions: Vec<MemRegionDesc>,
    nvdimms: Vec<NvdimmDesc>,
}

impl PlatformInfo {
    pub fn new(revision: u32) -> Self {
        PlatformInfo {
            header: SmemHeader::new(revision),
            regions: Vec::new(),
            nvdimms: Vec::new(),
        }
    }

    pub fn add_region(&mut self, desc: MemRegionDesc) -> Result<()> {
        if self.regions.len() == MAX_MEM_REGIONS {
            return Err(SmemError::Capacity);
        }
        if let Some(prev) = self.regions.last() {
            if desc.base.get() < prev.end() {
                return Err(SmemError::Unsorted);
            }
        }
        self.regions.push(desc);
        // Capacity is checked above, so the count always fits.
        self.header.region_count = U32::new(self.regions.len() as u32);
        Ok(())
    }

    pub fn add_nvdimm(&mut self, desc: NvdimmDesc) -> Result<()> {
        if self.nvdimms.len() == MAX_NVDIMMS {
            return Err(SmemError::Capacity);
        }
        if usize::from(desc.region) >= self.regions.len() {
            return Err(SmemError::BadRegionIndex);
        }
        self.nvdimms.push(desc);
        self.header.nvdimm_count = U32::new(self.nvdimms.len() as u32);
        self.header.flags = U32::new(self.header.flags.get() | SMEM_NVDIMM_PRESENT);
        Ok(())
    }

    pub fn set_scrub_capable(&mut self) {
        self.header.flags = U32::new(self.header.flags.get() | SMEM_SCRUB_CAPABLE);
    }

    pub fn header(&self) -> &SmemHeader {
        &self.header
    }

    pub fn regions(&self) -> &[MemRegionDesc] {
        &self.regions
    }

    pub fn nvdimms(&self) -> &[NvdimmDesc] {
        &self.nvdimms
    }
}

impl Table for PlatformInfo {
    fn len(&self) -> usize {
        NVDIMM_TABLE_OFFSET + MAX_NVDIMMS * size_of::<NvdimmDesc>()
    }

    fn write_to_mem<M: GuestMemory>(&mut self, mem: &M, address: GuestAddress) -> Result<()> {
        mem.write_slice(self.header.as_bytes(), address)?;

        let mut desc_addr = address
            .checked_add(REGION_TABLE_OFFSET as u64)
            .ok_or(SmemError::InvalidAddress)?;
        for desc in &self.regions {
            mem.write_slice(desc.as_bytes(), desc_addr)?;
            desc_addr = desc_addr
                .checked_add(size_of::<MemRegionDesc>() as u64)
                .ok_or(SmemError::InvalidAddress)?;
        }

        let mut desc_addr = address
            .checked_add(NVDIMM_TABLE_OFFSET as u64)
            .ok_or(SmemError::InvalidAddress)?;
        for desc in &self.nvdimms {
            mem.write_slice(desc.as_bytes(), desc_addr)?;
            desc_addr = desc_addr
                .checked_add(size_of::<NvdimmDesc>() as u64)
                .ok_or(SmemError::InvalidAddress)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use vm_memory::GuestMemoryMmap;

    use super::*;

    fn test_mem() -> GuestMemoryMmap<()> {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), crate::SMEM_SIZE)]).unwrap()
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(size_of::<SmemHeader>(), 32);
        assert_eq!(offset_of!(SmemHeader, revision), 0);
        assert_eq!(offset_of!(SmemHeader, signature), 4);
        assert_eq!(offset_of!(SmemHeader, flags), 8);
        assert_eq!(offset_of!(SmemHeader, region_count), 12);
        assert_eq!(offset_of!(SmemHeader, nvdimm_count), 16);
    }

    #[test]
    fn test_descriptor_layouts() {
        assert_eq!(size_of::<MemRegionDesc>(), 24);
        assert_eq!(offset_of!(MemRegionDesc, base), 8);
        assert_eq!(offset_of!(MemRegionDesc, length), 16);

        assert_eq!(size_of::<NvdimmDesc>(), 16);
        assert_eq!(offset_of!(NvdimmDesc, vendor), 0);
        assert_eq!(offset_of!(NvdimmDesc, serial), 5);
        assert_eq!(offset_of!(NvdimmDesc, region), 9);

        assert_eq!(REGION_TABLE_OFFSET, 32);
        assert_eq!(NVDIMM_TABLE_OFFSET, 416);
    }

    #[test]
    fn test_regions_must_be_sorted() {
        let mut info = PlatformInfo::new(SMEM_REVISION);
        info.add_region(MemRegionDesc::new(0, 0, 0, 0, 0x1000, 0x1000))
            .unwrap();
        // Overlapping the previous region is rejected.
        let err = info
            .add_region(MemRegionDesc::new(0, 0, 1, 0, 0x1800, 0x1000))
            .unwrap_err();
        assert!(matches!(err, SmemError::Unsorted));
        // Out of order is rejected too.
        let err = info
            .add_region(MemRegionDesc::new(0, 0, 1, 0, 0x0, 0x1000))
            .unwrap_err();
        assert!(matches!(err, SmemError::Unsorted));
        // Exactly adjacent is fine.
        info.add_region(MemRegionDesc::new(0, 0, 1, 0, 0x2000, 0x1000))
            .unwrap();
        assert_eq!(info.header().region_count.get(), 2);
    }

    #[test]
    fn test_region_capacity() {
        let mut info = PlatformInfo::new(SMEM_REVISION);
        for i in 0..MAX_MEM_REGIONS {
            info.add_region(MemRegionDesc::new(0, 0, 0, 0, i as u64 * 0x1000, 0x1000))
                .unwrap();
        }
        let err = info
            .add_region(MemRegionDesc::new(0, 0, 0, 0, 0x100000, 0x1000))
            .unwrap_err();
        assert!(matches!(err, SmemError::Capacity));
    }

    #[test]
    fn test_nvdimm_region_back_reference() {
        let mut info = PlatformInfo::new(SMEM_REVISION);
        let err = info
            .add_nvdimm(NvdimmDesc::new(0x1234, 0x1, 1, *b"0001", 0))
            .unwrap_err();
        assert!(matches!(err, SmemError::BadRegionIndex));

        info.add_region(MemRegionDesc::new(0, 0, 0, REGION_NVDIMM_BACKED, 0, 0x1000))
            .unwrap();
        info.add_nvdimm(NvdimmDesc::new(0x1234, 0x1, 1, *b"0001", 0))
            .unwrap();
        assert_eq!(info.header().nvdimm_count.get(), 1);
        assert_eq!(info.header().flags.get() & SMEM_NVDIMM_PRESENT, SMEM_NVDIMM_PRESENT);
    }

    #[test]
    fn test_write_and_read_back() {
        let mem = test_mem();
        let mut info = PlatformInfo::new(SMEM_REVISION);
        info.add_region(MemRegionDesc::new(1, 0, 2, REGION_NVDIMM_BACKED, 0x4000, 0x2000))
            .unwrap();
        info.add_nvdimm(NvdimmDesc::new(0x2c80, 0x4e32, 2, *b"A001", 0))
            .unwrap();
        info.set_scrub_capable();
        info.write_to_mem(&mem, GuestAddress(0)).unwrap();

        let header = SmemHeader::read_from_mem(&mem, GuestAddress(0)).unwrap();
        assert!(header.is_valid());
        assert_eq!(header.revision.get(), SMEM_REVISION);
        assert_eq!(header.flags.get(), SMEM_NVDIMM_PRESENT | SMEM_SCRUB_CAPABLE);

        // The signature must land at byte 4 exactly.
        let mut sig = [0u8; 4];
        mem.read_slice(&mut sig, GuestAddress(4)).unwrap();
        assert_eq!(&sig, b"UEFI");

        let mut raw = [0u8; 24];
        mem.read_slice(&mut raw, GuestAddress(REGION_TABLE_OFFSET as u64))
            .unwrap();
        let desc = MemRegionDesc::read_from_bytes(&raw).unwrap();
        assert_eq!(desc.base.get(), 0x4000);
        assert_eq!(desc.end(), 0x6000);
        assert!(desc.is_nvdimm_backed());
    }
}
