// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The restore/arm/abort command engine.
//!
//! Each workflow is a bounded polling loop over the module control registers:
//! wait for the controller to go idle, clear stale completion bits, decode the
//! module's own timeout field, then strobe the command once per tick until
//! both the workflow's in-progress bit and the generic busy bit drop. The
//! per-tick strobe is deliberate; a busy controller silently drops commands,
//! and its busy bit keeps the loop alive until a later strobe lands. A
//! workflow that exhausts its budget is aborted and the final completion
//! register decides the outcome.
//!
//! The engine runs once, serially, at early boot. Blocking the boot thread
//! for up to the capped timeouts is acceptable there and nowhere else.

use std::thread;
use std::time::Duration;

use super::metrics::METRICS;
use super::regs::{
    ABORT_STATUS, ABORT_TIMEOUT0, ABORT_TIMEOUT1, ARM_STATUS, ARM_TIMEOUT0, ARM_TIMEOUT1,
    DEVICE_ID0, DEVICE_ID1, FUNC_CMD, FuncCmd, MODULE_STATUS, ModuleStatus, RESTORE_STATUS,
    RESTORE_TIMEOUT0, RESTORE_TIMEOUT1, REVISION_ID, SERIAL0, VENDOR_ID0, VENDOR_ID1,
    WorkflowStatus, decode_timeout_ms,
};
use super::{
    IDLE_TIMEOUT_MS, MAX_ABORT_TIMEOUT_MS, MAX_ARM_TIMEOUT_MS, MAX_RESTORE_TIMEOUT_MS,
    NvdimmError, POLL_TICK_MS, TransportError,
};
use crate::logger::{IncMetric, error, warn};

/// Dense index of an NVDIMM on the platform.
pub type DimmIndex = usize;

/// Byte transport to NVDIMM control registers.
///
/// Implementations address modules by dense index. A failed access carries no
/// detail beyond the failing direction; the engine never retries one.
pub trait RegisterAccess {
    /// Reads one control register byte.
    fn read_register(&mut self, dimm: DimmIndex, reg: u8) -> Result<u8, TransportError>;
    /// Writes one control register byte.
    fn write_register(&mut self, dimm: DimmIndex, reg: u8, value: u8)
    -> Result<(), TransportError>;
}

/// Raw identity bytes from a module's register page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvdimmIdentity {
    /// JEDEC vendor id.
    pub vendor: u16,
    /// Controller device id.
    pub device: u16,
    /// Controller revision.
    pub revision: u8,
    /// Module serial number.
    pub serial: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workflow {
    Restore,
    Arm,
    Abort,
}

impl Workflow {
    const fn name(self) -> &'static str {
        match self {
            Self::Restore => "restore",
            Self::Arm => "arm",
            Self::Abort => "abort",
        }
    }

    const fn command(self) -> FuncCmd {
        match self {
            Self::Restore => FuncCmd::START_RESTORE,
            Self::Arm => FuncCmd::START_ARM,
            Self::Abort => FuncCmd::ABORT,
        }
    }

    const fn in_progress(self) -> ModuleStatus {
        match self {
            Self::Restore => ModuleStatus::RESTORE_IN_PROGRESS,
            Self::Arm => ModuleStatus::ARM_IN_PROGRESS,
            Self::Abort => ModuleStatus::ABORT_IN_PROGRESS,
        }
    }

    const fn status_reg(self) -> u8 {
        match self {
            Self::Restore => RESTORE_STATUS,
            Self::Arm => ARM_STATUS,
            Self::Abort => ABORT_STATUS,
        }
    }

    const fn timeout_regs(self) -> (u8, u8) {
        match self {
            Self::Restore => (RESTORE_TIMEOUT0, RESTORE_TIMEOUT1),
            Self::Arm => (ARM_TIMEOUT0, ARM_TIMEOUT1),
            Self::Abort => (ABORT_TIMEOUT0, ABORT_TIMEOUT1),
        }
    }

    const fn timeout_cap_ms(self) -> u64 {
        match self {
            Self::Restore => MAX_RESTORE_TIMEOUT_MS,
            Self::Arm => MAX_ARM_TIMEOUT_MS,
            Self::Abort => MAX_ABORT_TIMEOUT_MS,
        }
    }

    const fn failure(self, status: u8) -> NvdimmError {
        match self {
            Self::Restore => NvdimmError::RestoreFailed(status),
            Self::Arm => NvdimmError::ArmFailed(status),
            Self::Abort => NvdimmError::AbortFailed(status),
        }
    }
}

/// NVDIMM command engine over a register transport.
#[derive(Debug)]
pub struct NvdimmCtrl<T> {
    transport: T,
    tick_sleep: Duration,
}

impl<T: RegisterAccess> NvdimmCtrl<T> {
    /// Creates an engine over `transport`.
    ///
    /// `tick_sleep` is how long the engine really sleeps per polling tick.
    /// Budgets are always accounted in nominal ticks, so a shorter sleep runs
    /// the same loop faster than real time; tests pass `Duration::ZERO`.
    pub fn new(transport: T, tick_sleep: Duration) -> Self {
        Self {
            transport,
            tick_sleep,
        }
    }

    /// The underlying register transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Restores module contents from the energy-backed image.
    pub fn restore(&mut self, dimm: DimmIndex) -> Result<(), NvdimmError> {
        METRICS.restore_count.inc();
        self.run_workflow(dimm, Workflow::Restore)
            .inspect_err(|err| {
                METRICS.restore_fails.inc();
                error!("nvdimm{dimm}: restore failed: {err}");
            })
    }

    /// Arms the module to save its contents on power loss.
    pub fn arm(&mut self, dimm: DimmIndex) -> Result<(), NvdimmError> {
        METRICS.arm_count.inc();
        self.run_workflow(dimm, Workflow::Arm).inspect_err(|err| {
            METRICS.arm_fails.inc();
            error!("nvdimm{dimm}: arm failed: {err}");
        })
    }

    /// Aborts whatever workflow the module is running.
    pub fn abort(&mut self, dimm: DimmIndex) -> Result<(), NvdimmError> {
        METRICS.abort_count.inc();
        self.run_abort(dimm).inspect_err(|err| {
            METRICS.abort_fails.inc();
            error!("nvdimm{dimm}: abort failed: {err}");
        })
    }

    /// Reads the module identity bytes.
    pub fn identity(&mut self, dimm: DimmIndex) -> Result<NvdimmIdentity, NvdimmError> {
        let vendor =
            u16::from_le_bytes([self.read(dimm, VENDOR_ID0)?, self.read(dimm, VENDOR_ID1)?]);
        let device =
            u16::from_le_bytes([self.read(dimm, DEVICE_ID0)?, self.read(dimm, DEVICE_ID1)?]);
        let revision = self.read(dimm, REVISION_ID)?;
        let mut serial = [0u8; 4];
        for offset in 0..4u8 {
            serial[usize::from(offset)] = self.read(dimm, SERIAL0 + offset)?;
        }
        Ok(NvdimmIdentity {
            vendor,
            device,
            revision,
            serial,
        })
    }

    fn run_workflow(&mut self, dimm: DimmIndex, workflow: Workflow) -> Result<(), NvdimmError> {
        self.wait_idle(dimm)?;
        if self.drive(dimm, workflow)? {
            METRICS.workflow_timeouts.inc();
            warn!(
                "nvdimm{dimm}: {} still in progress after its timeout, aborting",
                workflow.name()
            );
            self.run_abort(dimm)?;
        }
        self.completion(dimm, workflow)
    }

    // Abort skips the idle gate; it exists to interrupt a stuck workflow.
    fn run_abort(&mut self, dimm: DimmIndex) -> Result<(), NvdimmError> {
        if self.drive(dimm, Workflow::Abort)? {
            METRICS.workflow_timeouts.inc();
        }
        self.completion(dimm, Workflow::Abort)
    }

    /// Clears stale completion bits, then strobes the workflow command once
    /// per tick until the module reports neither the workflow nor any other
    /// operation in progress, or the budget runs out.
    ///
    /// The generic busy bit is part of the exit condition on purpose: a busy
    /// module drops strobes, and exiting on the workflow bit alone would read
    /// that as an instant, successless completion instead of re-issuing.
    ///
    /// Returns whether the budget ran out. The caller still reads the
    /// completion register afterwards; a workflow finishing right on the
    /// deadline is a success.
    fn drive(&mut self, dimm: DimmIndex, workflow: Workflow) -> Result<bool, NvdimmError> {
        self.write(dimm, workflow.status_reg(), WorkflowStatus::all().bits())?;

        let (lo_reg, hi_reg) = workflow.timeout_regs();
        let lo = self.read(dimm, lo_reg)?;
        let hi = self.read(dimm, hi_reg)?;
        let timeout_ms = decode_timeout_ms(lo, hi).min(workflow.timeout_cap_ms());
        let mut ticks = timeout_ms.div_ceil(POLL_TICK_MS).max(1);

        loop {
            self.write(dimm, FUNC_CMD, workflow.command().bits())?;
            METRICS.commands_issued.inc();
            self.tick();
            let status = ModuleStatus::from_bits_retain(self.read(dimm, MODULE_STATUS)?);
            if !status.intersects(workflow.in_progress() | ModuleStatus::OP_IN_PROGRESS) {
                return Ok(false);
            }
            ticks -= 1;
            if ticks == 0 {
                return Ok(true);
            }
        }
    }

    fn completion(&mut self, dimm: DimmIndex, workflow: Workflow) -> Result<(), NvdimmError> {
        let bits = self.read(dimm, workflow.status_reg())?;
        if WorkflowStatus::from_bits_retain(bits).contains(WorkflowStatus::SUCCESS) {
            Ok(())
        } else {
            Err(workflow.failure(bits))
        }
    }

    fn wait_idle(&mut self, dimm: DimmIndex) -> Result<(), NvdimmError> {
        let mut ticks = IDLE_TIMEOUT_MS.div_ceil(POLL_TICK_MS).max(1);
        loop {
            let status = ModuleStatus::from_bits_retain(self.read(dimm, MODULE_STATUS)?);
            if !status.contains(ModuleStatus::OP_IN_PROGRESS) {
                return Ok(());
            }
            ticks -= 1;
            if ticks == 0 {
                return Err(NvdimmError::NotIdle);
            }
            self.tick();
        }
    }

    fn read(&mut self, dimm: DimmIndex, reg: u8) -> Result<u8, TransportError> {
        self.transport
            .read_register(dimm, reg)
            .inspect_err(|_| METRICS.transport_errors.inc())
    }

    fn write(&mut self, dimm: DimmIndex, reg: u8, value: u8) -> Result<(), TransportError> {
        self.transport
            .write_register(dimm, reg, value)
            .inspect_err(|_| METRICS.transport_errors.inc())
    }

    fn tick(&self) {
        if !self.tick_sleep.is_zero() {
            thread::sleep(self.tick_sleep);
        }
    }
}
