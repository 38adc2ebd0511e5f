// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enables pre-boot setup and the boot itself: map system memory, sweep the
//! NVDIMM population through restore and arm, publish the shared descriptor
//! region and attach the scrub engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_manager::SubscriberOps;
use smem_tables::info::{
    MemRegionDesc, NvdimmDesc, PlatformInfo, REGION_NVDIMM_BACKED, SMEM_REVISION,
};
use smem_tables::{SmemError, Table};
use vm_memory::GuestAddress;
use vmm_sys_util::eventfd::EventFd;

use crate::EventManager;
use crate::devices::nvdimm::{NvdimmCtrl, RegisterAccess};
use crate::fw_config::PlatformConfig;
use crate::logger::{IncMetric, METRICS, StoreMetric, error, info, warn};
use crate::mem::{self, MemoryError, SysMemory};
use crate::scrub::{ArsEngine, ArsExchange, MemScrubPort, ScrubError, ScrubRegion};
use crate::utils::time::{ClockType, get_time_us};
use crate::utils::u64_to_usize;

/// Errors associated with bringing the platform up.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StartError {
    /// Cannot map system memory: {0}
    Memory(#[from] MemoryError),
    /// Cannot publish the shared descriptor region: {0}
    Smem(#[from] SmemError),
}

/// Control line to the platform watchdog.
///
/// The watchdog backs the arm guarantee: once any module is armed, a hang
/// must end in a reset so the armed modules get to save their contents.
pub trait WatchdogCtl {
    /// Starts the watchdog.
    fn enable(&mut self) -> Result<(), std::io::Error>;
}

/// Outcome of the boot-time workflow sweep for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimmBootState {
    /// Restored and armed; contents are valid and writes are protected.
    Armed,
    /// Restored but not armed; contents are valid, new writes are at risk.
    Unarmed,
    /// Restore failed; contents must be treated as suspect.
    RestoreFailed,
    /// The module never answered probing; it is not published to the host.
    Dead,
}

/// Handle to the scrub engine after it was handed to the event loop.
#[derive(Debug)]
pub struct ScrubHandle {
    /// The engine itself, shared with the event loop.
    pub engine: Arc<Mutex<ArsEngine<MemScrubPort>>>,
    /// Interrupt line callers ring after posting a function.
    pub doorbell: EventFd,
}

/// A booted platform.
#[derive(Debug)]
pub struct Platform<T, W> {
    /// System memory map.
    pub mem: SysMemory,
    /// Command engine over the NVDIMM register transport.
    pub nvdimm_ctrl: NvdimmCtrl<T>,
    /// The platform watchdog, armed when any module is.
    pub watchdog: W,
    /// Per-module sweep outcome, indexed like the configured population.
    pub dimm_states: Vec<DimmBootState>,
    /// Scrub engine handle, absent when the engine could not be attached.
    pub scrub: Option<ScrubHandle>,
}

/// Boots the platform described by `config`.
///
/// Memory is mapped first, then every configured module is probed and taken
/// through restore and arm. The shared descriptor region is published once
/// the population is known, and the scrub engine is registered with the
/// event loop last. No module failure is fatal: a failed workflow degrades
/// that module, and a module that does not answer at all is left out of the
/// published tables entirely.
pub fn build_platform<T, W>(
    config: &PlatformConfig,
    transport: T,
    mut watchdog: W,
    event_manager: &mut EventManager,
) -> Result<Platform<T, W>, StartError>
where
    T: RegisterAccess,
    W: WatchdogCtl,
{
    let boot_start_us = get_time_us(ClockType::Monotonic);

    let mem = mem::anonymous(
        config
            .regions
            .iter()
            .map(|r| (GuestAddress(r.base), u64_to_usize(r.length))),
    )?;

    let mut info = PlatformInfo::new(SMEM_REVISION);
    for region in &config.regions {
        let flags = if region.persistent {
            REGION_NVDIMM_BACKED
        } else {
            0
        };
        info.add_region(MemRegionDesc::new(
            region.socket,
            region.mc,
            region.channel,
            flags,
            region.base,
            region.length,
        ))?;
    }

    let mut nvdimm_ctrl = NvdimmCtrl::new(
        transport,
        Duration::from_micros(config.nvdimm_tuning.tick_us),
    );
    let dimm_states = run_persistence_sweep(&mut nvdimm_ctrl, config, &mut info)?;

    if dimm_states.contains(&DimmBootState::Armed) {
        match watchdog.enable() {
            Ok(()) => {
                METRICS.boot.watchdog_enables.inc();
                info!("platform watchdog enabled");
            }
            Err(err) => {
                // Armed modules will not be saved on a hang; the platform
                // still boots.
                METRICS.boot.watchdog_fails.inc();
                error!("cannot enable the platform watchdog: {err}");
            }
        }
    }

    let smem_addr = GuestAddress(config.smem_addr);
    info.write_to_mem(&mem, smem_addr)?;

    let scrub = match attach_scrub_engine(&mem, config, &dimm_states, event_manager) {
        Ok(handle) => {
            info.set_scrub_capable();
            info.write_to_mem(&mem, smem_addr)?;
            Some(handle)
        }
        Err(err) => {
            // The platform still boots; the host sees the capability bit
            // clear and NVDIMM-backed memory stays accessible.
            warn!("ars: scrub engine not attached: {err}");
            None
        }
    };

    METRICS
        .boot
        .boot_time_us
        .store(get_time_us(ClockType::Monotonic).saturating_sub(boot_start_us));
    info!("platform boot complete");

    Ok(Platform {
        mem,
        nvdimm_ctrl,
        watchdog,
        dimm_states,
        scrub,
    })
}

/// Takes every configured module through identity probe, restore and arm,
/// recording each one in the shared descriptor tables as it goes.
fn run_persistence_sweep<T: RegisterAccess>(
    ctrl: &mut NvdimmCtrl<T>,
    config: &PlatformConfig,
    info: &mut PlatformInfo,
) -> Result<Vec<DimmBootState>, StartError> {
    let mut states = Vec::with_capacity(config.nvdimms.len());
    for (idx, dimm) in config.nvdimms.iter().enumerate() {
        let identity = match ctrl.identity(idx) {
            Ok(identity) => identity,
            Err(err) => {
                METRICS.boot.probe_fails.inc();
                error!("nvdimm{idx}: module does not answer, leaving it unpublished: {err}");
                states.push(DimmBootState::Dead);
                continue;
            }
        };
        METRICS.boot.dimms_probed.inc();
        info!(
            "nvdimm{idx}: probed {:04x}:{:04x} rev {} serial {:02x?}",
            identity.vendor, identity.device, identity.revision, identity.serial
        );
        if identity.vendor != dimm.vendor
            || identity.device != dimm.device
            || u32::from_le_bytes(identity.serial) != dimm.serial
        {
            warn!(
                "nvdimm{idx}: module differs from the configured one ({:04x}:{:04x} serial {:#010x})",
                dimm.vendor, dimm.device, dimm.serial
            );
        }
        // Region indices are validated against MAX_MEM_REGIONS, which fits
        // a u8.
        info.add_nvdimm(NvdimmDesc::new(
            identity.vendor,
            identity.device,
            identity.revision,
            identity.serial,
            dimm.region as u8,
        ))?;

        let state = match ctrl.restore(idx) {
            Ok(()) => {
                METRICS.boot.dimms_restored.inc();
                match ctrl.arm(idx) {
                    Ok(()) => {
                        METRICS.boot.dimms_armed.inc();
                        DimmBootState::Armed
                    }
                    Err(_) => {
                        METRICS.boot.arm_fails.inc();
                        DimmBootState::Unarmed
                    }
                }
            }
            Err(_) => {
                METRICS.boot.restore_fails.inc();
                warn!("nvdimm{idx}: exposing contents as suspect, module not armed");
                DimmBootState::RestoreFailed
            }
        };
        states.push(state);
    }
    Ok(states)
}

/// The scrub surface: every persistent region someone can answer for,
/// reported under the handle of the module backing it.
///
/// Handles are indices into the published descriptor table, which skips dead
/// modules, so they are the configured order compressed past any gaps. A
/// region backed only by a dead module is not scrubbed; a fault there could
/// not be attributed to anything the host can see.
fn scrub_regions(config: &PlatformConfig, states: &[DimmBootState]) -> Vec<ScrubRegion> {
    let mut handles = Vec::with_capacity(states.len());
    let mut published = 0u32;
    for state in states {
        if *state == DimmBootState::Dead {
            handles.push(None);
        } else {
            handles.push(Some(published));
            published += 1;
        }
    }

    config
        .regions
        .iter()
        .enumerate()
        .filter(|(_, region)| region.persistent)
        .filter_map(|(idx, region)| {
            let dimm_idx = config.nvdimms.iter().position(|d| d.region == idx)?;
            let handle = handles.get(dimm_idx).copied().flatten()?;
            Some(ScrubRegion {
                base: region.base,
                len: region.length,
                handle,
            })
        })
        .collect()
}

fn attach_scrub_engine(
    mem: &SysMemory,
    config: &PlatformConfig,
    states: &[DimmBootState],
    event_manager: &mut EventManager,
) -> Result<ScrubHandle, ScrubError> {
    let exchange = ArsExchange::new(mem.clone(), GuestAddress(config.smem_addr))?;
    exchange.reset()?;
    let engine = ArsEngine::new(
        exchange,
        scrub_regions(config, states),
        MemScrubPort::new(mem.clone()),
        Duration::from_micros(config.scrub_tuning.scan_interval_us),
    )?;
    let doorbell = engine.doorbell().try_clone().map_err(ScrubError::EventFd)?;
    let engine = Arc::new(Mutex::new(engine));
    event_manager.add_subscriber(engine.clone());
    Ok(ScrubHandle { engine, doorbell })
}
