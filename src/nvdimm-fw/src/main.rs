// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, read_to_string};
use std::panic;
use std::path::PathBuf;

use clap::Parser;
use nvfw::EventManager;
use nvfw::builder::{ScrubHandle, StartError, build_platform};
use nvfw::fw_config::{PlatformConfig, PlatformConfigError, RegionConfig};
use nvfw::logger::{
    FwLineWriter, INSTANCE_ID, LOGGER, LevelFilter, LoggerConfig, LoggerInitError,
    LoggerUpdateError, METRICS, MetricsError, error, info, warn,
};
use nvfw::mem::SysMemory;
use nvfw::scrub::{ArsExchange, ScrubError};
use nvfw::sim::{SimBus, SimDimm, SimWatchdog};
use smem_tables::ars::{
    ARS_TYPE_PERSISTENT, ArsCapabilities, ArsStartRequest, ArsStatus, FUNC_QUERY_CAPS, ScanState,
};
use vm_memory::GuestAddress;
use zerocopy::little_endian::{U16, U64};

const EXIT_CODE_ERROR: i32 = 1;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Failed to operate file: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("Invalid platform description: {0}")]
    Config(#[from] PlatformConfigError),
    #[error("Failed to initialize logging: {0}")]
    Logger(#[from] LoggerInitError),
    #[error("Failed to configure logging: {0}")]
    LoggerUpdate(#[from] LoggerUpdateError),
    #[error("Failed to initialize metrics: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Failed to run the event loop: {0}")]
    EventLoop(event_manager::Error),
    #[error("Failed to boot the platform: {0}")]
    Boot(#[from] StartError),
    #[error("Failed to drive the scrub exchange: {0}")]
    Scrub(#[from] ScrubError),
    #[error("Self-test finished with status {0:#06x}")]
    SelfTest(u16),
}

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path of the platform description file.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,
    /// Path of the file used as output for logs; stdout when absent.
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,
    /// Level of the log messages.
    #[arg(long, value_name = "LEVEL")]
    level: Option<LevelFilter>,
    /// Path of the file metrics are flushed to on exit.
    #[arg(long, value_name = "PATH")]
    metrics_path: Option<PathBuf>,
    /// Physical addresses to plant media faults at before the self-test.
    #[arg(long, value_name = "PA")]
    fault: Vec<u64>,
}

fn run(cli: Cli) -> Result<(), Error> {
    let config = PlatformConfig::from_json(&read_to_string(cli.config)?)?;

    if let Some(id) = &config.instance_id {
        // First write wins; there is nothing to race with this early.
        let _ = INSTANCE_ID.set(id.clone());
    }
    LOGGER.init()?;
    LOGGER.update(LoggerConfig {
        log_path: cli.log_path,
        level: cli.level,
        show_level: Some(true),
        show_log_origin: Some(false),
        module: None,
    })?;
    if let Some(path) = cli.metrics_path {
        METRICS.init(FwLineWriter::new(File::create(path)?))?;
    }

    // The release profile aborts on panic; this hook runs first and salvages
    // the metrics.
    panic::set_hook(Box::new(|info| {
        error!("nvdimm-fw {info}");
        if let Err(err) = METRICS.write() {
            error!("Failed to write metrics while panicking: {err}");
        }
    }));

    let mut event_manager = EventManager::new().map_err(Error::EventLoop)?;
    let bus = SimBus::new(config.nvdimms.iter().map(SimDimm::new).collect());
    let mut platform = build_platform(&config, bus, SimWatchdog::default(), &mut event_manager)?;

    for (idx, state) in platform.dimm_states.iter().enumerate() {
        info!("nvdimm{idx}: {state:?}");
    }

    match platform.scrub.take() {
        Some(scrub) => {
            for pa in &cli.fault {
                scrub
                    .engine
                    .lock()
                    .expect("Poisoned lock")
                    .port_mut()
                    .inject_fault(*pa);
            }
            run_self_test(&config, &platform.mem, &scrub, &mut event_manager)?;
        }
        None => warn!("ars: engine unavailable, skipping the media self-test"),
    }

    if let Err(err) = METRICS.write() {
        warn!("Failed to flush metrics: {err}");
    }
    Ok(())
}

/// Scans every persistent range once and reports what the media looks like.
fn run_self_test(
    config: &PlatformConfig,
    mem: &SysMemory,
    scrub: &ScrubHandle,
    event_manager: &mut EventManager,
) -> Result<(), Error> {
    let caller = ArsExchange::new(mem.clone(), GuestAddress(config.smem_addr))?;

    caller.post_function(FUNC_QUERY_CAPS)?;
    scrub.doorbell.write(1)?;
    event_manager.run_with_timeout(100).map_err(Error::EventLoop)?;
    let caps: ArsCapabilities = caller.read_output()?;
    info!(
        "ars: capabilities: query size {}, clear unit {}",
        caps.max_query_size.get(),
        caps.clear_unit.get()
    );

    let persistent: Vec<&RegionConfig> = config.regions.iter().filter(|r| r.persistent).collect();
    let (Some(first), Some(last)) = (persistent.first(), persistent.last()) else {
        info!("ars: no persistent ranges configured, nothing to scan");
        return Ok(());
    };
    let start_pa = first.base;
    let start_len = last.end() - first.base;

    caller.post_start(&ArsStartRequest {
        start_pa: U64::new(start_pa),
        start_len: U64::new(start_len),
        ars_type: U16::new(ARS_TYPE_PERSISTENT),
    })?;
    scrub.doorbell.write(1)?;
    let state = loop {
        event_manager.run_with_timeout(100).map_err(Error::EventLoop)?;
        let state = caller.scan_state()?;
        if state != ScanState::InProgress {
            break state;
        }
    };

    let status = caller.status()?;
    if status != ArsStatus::Success as u16 {
        return Err(Error::SelfTest(status));
    }
    let report = caller.report()?;
    let count = report.record_count.get() as usize;
    info!(
        "ars: self-test scanned {start_pa:#x}..{:#x}, {count} error records",
        start_pa + start_len
    );
    for record in &report.records[..count] {
        info!(
            "ars: nvdimm{}: {} bad bytes at {:#x}",
            record.handle.get(),
            record.len.get(),
            record.pa.get()
        );
    }
    if state == ScanState::PrematurelyStopped {
        info!(
            "ars: scan stopped early, resume at {:#x} with {} bytes left",
            report.restart_pa.get(),
            report.restart_len.get()
        );
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(EXIT_CODE_ERROR);
    }
}
