// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Platform description consumed by the firmware at boot.
//!
//! The description is a JSON document listing the physical memory ranges, the
//! NVDIMM population and a few timing knobs. It is parsed up front and
//! validated as a whole before anything is mapped or any device is touched.

use serde::{Deserialize, Serialize};
use smem_tables::SMEM_SIZE;
use smem_tables::info::{MAX_MEM_REGIONS, MAX_NVDIMMS};

/// Errors associated with an invalid platform description.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PlatformConfigError {
    /// Cannot parse the platform description: {0}
    Parse(#[from] serde_json::Error),
    /// No memory regions configured
    NoRegions,
    /// Too many memory regions configured (max {MAX_MEM_REGIONS})
    TooManyRegions,
    /// Too many NVDIMMs configured (max {MAX_NVDIMMS})
    TooManyNvdimms,
    /// Memory region {0} has zero length
    EmptyRegion(usize),
    /// Memory region {0} is not 4 KiB aligned
    UnalignedRegion(usize),
    /// Memory region {0} wraps the physical address space
    RegionOverflow(usize),
    /// Memory regions must be sorted by base address and non-overlapping
    RegionOrder,
    /// NVDIMM {0} references memory region {1} which does not exist
    BadRegionIndex(usize, usize),
    /// NVDIMM {0} references memory region {1} which is not persistent
    VolatileRegion(usize, usize),
    /// Shared region address {0:#x} is not 4 KiB aligned
    SmemAlignment(u64),
    /// Shared region at {0:#x} is not covered by any configured memory region
    SmemPlacement(u64),
}

/// Description of one contiguous physical memory range.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Base physical address of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Socket the range is attached to.
    #[serde(default)]
    pub socket: u8,
    /// Memory controller within the socket.
    #[serde(default)]
    pub mc: u8,
    /// Channel within the memory controller.
    #[serde(default)]
    pub channel: u8,
    /// Whether the range is backed by persistent media.
    #[serde(default)]
    pub persistent: bool,
}

impl RegionConfig {
    /// First address past the range, saturating at the top of the space.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Description of one NVDIMM and the range it backs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvdimmConfig {
    /// JEDEC vendor id of the module controller.
    pub vendor: u16,
    /// Controller device id.
    pub device: u16,
    /// Controller revision.
    #[serde(default)]
    pub revision: u8,
    /// Module serial number.
    pub serial: u32,
    /// Index into the `regions` list of the range this module backs.
    pub region: usize,
}

/// Timing knobs for the NVDIMM command engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvdimmTuning {
    /// Wall-clock duration of one polling tick, in microseconds.
    ///
    /// Timeout budgets are always accounted in nominal ticks; this only
    /// changes how long the engine actually sleeps between polls, so a
    /// simulated platform can run faster than real time.
    #[serde(default = "NvdimmTuning::default_tick_us")]
    pub tick_us: u64,
}

impl NvdimmTuning {
    fn default_tick_us() -> u64 {
        crate::devices::nvdimm::POLL_TICK_MS * 1000
    }
}

impl Default for NvdimmTuning {
    fn default() -> Self {
        Self {
            tick_us: Self::default_tick_us(),
        }
    }
}

/// Timing knobs for the scrub engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrubTuning {
    /// Down-counter interval between block probes, in microseconds.
    #[serde(default = "ScrubTuning::default_scan_interval_us")]
    pub scan_interval_us: u64,
}

impl ScrubTuning {
    fn default_scan_interval_us() -> u64 {
        crate::scrub::SCAN_INTERVAL_US
    }
}

impl Default for ScrubTuning {
    fn default() -> Self {
        Self {
            scan_interval_us: Self::default_scan_interval_us(),
        }
    }
}

/// Full platform description.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    /// Instance id stamped into every log line.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Physical address of the 4 KiB shared descriptor region.
    pub smem_addr: u64,
    /// Physical memory ranges, sorted by base address.
    pub regions: Vec<RegionConfig>,
    /// NVDIMM population.
    #[serde(default)]
    pub nvdimms: Vec<NvdimmConfig>,
    /// Command engine timing.
    #[serde(default)]
    pub nvdimm_tuning: NvdimmTuning,
    /// Scrub engine timing.
    #[serde(default)]
    pub scrub_tuning: ScrubTuning,
}

impl PlatformConfig {
    /// Parses a platform description from its JSON form.
    ///
    /// The result is validated; an `Ok` config can be built without further
    /// checks.
    pub fn from_json(json: &str) -> Result<Self, PlatformConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PlatformConfigError> {
        if self.regions.is_empty() {
            return Err(PlatformConfigError::NoRegions);
        }
        if self.regions.len() > MAX_MEM_REGIONS {
            return Err(PlatformConfigError::TooManyRegions);
        }
        if self.nvdimms.len() > MAX_NVDIMMS {
            return Err(PlatformConfigError::TooManyNvdimms);
        }
        let mut prev_end = 0u64;
        for (idx, region) in self.regions.iter().enumerate() {
            if region.length == 0 {
                return Err(PlatformConfigError::EmptyRegion(idx));
            }
            if region.base % SMEM_SIZE as u64 != 0 || region.length % SMEM_SIZE as u64 != 0 {
                return Err(PlatformConfigError::UnalignedRegion(idx));
            }
            if region.base.checked_add(region.length).is_none() {
                return Err(PlatformConfigError::RegionOverflow(idx));
            }
            if idx > 0 && region.base < prev_end {
                return Err(PlatformConfigError::RegionOrder);
            }
            prev_end = region.end();
        }
        for (idx, dimm) in self.nvdimms.iter().enumerate() {
            let region = self
                .regions
                .get(dimm.region)
                .ok_or(PlatformConfigError::BadRegionIndex(idx, dimm.region))?;
            if !region.persistent {
                return Err(PlatformConfigError::VolatileRegion(idx, dimm.region));
            }
        }
        if self.smem_addr % SMEM_SIZE as u64 != 0 {
            return Err(PlatformConfigError::SmemAlignment(self.smem_addr));
        }
        let smem_end = self.smem_addr.saturating_add(SMEM_SIZE as u64);
        if !self
            .regions
            .iter()
            .any(|r| r.base <= self.smem_addr && smem_end <= r.end())
        {
            return Err(PlatformConfigError::SmemPlacement(self.smem_addr));
        }
        Ok(())
    }
}
