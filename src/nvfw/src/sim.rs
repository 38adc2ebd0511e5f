// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Simulated platform hardware backing the demo binary and the integration
//! tests: a bank of NVDIMM register files with adjustable completion latency
//! and strobe dropping, and a watchdog stand-in.

use crate::builder::WatchdogCtl;
use crate::devices::nvdimm::regs::{
    ABORT_STATUS, ABORT_TIMEOUT0, ARM_STATUS, ARM_TIMEOUT0, ARM_TIMEOUT1, DEVICE_ID0, DEVICE_ID1,
    FUNC_CMD, FuncCmd, MODULE_STATUS, ModuleStatus, RESTORE_STATUS, RESTORE_TIMEOUT0,
    RESTORE_TIMEOUT1, REVISION_ID, SERIAL0, TIMEOUT_UNIT_SECONDS, VENDOR_ID0, VENDOR_ID1,
    WorkflowStatus,
};
use crate::devices::nvdimm::{DimmIndex, RegisterAccess, TransportError};
use crate::fw_config::NvdimmConfig;

const REG_FILE_SIZE: usize = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimWorkflow {
    Restore,
    Arm,
}

/// One simulated module: a register file plus a completion countdown.
///
/// A started workflow stays in progress for a configurable number of status
/// polls, then latches its completion bits, so the command engine's whole
/// polling loop gets exercised. The module can also eat leading command
/// strobes while reporting itself busy, the way real controllers drop
/// commands mid-housekeeping.
#[derive(Debug)]
pub struct SimDimm {
    regs: [u8; REG_FILE_SIZE],
    /// Status polls a restore stays in progress for.
    pub restore_polls: u32,
    /// Status polls an arm stays in progress for.
    pub arm_polls: u32,
    /// Command strobes eaten while the module reports generic busy.
    pub dropped_strobes: u32,
    /// Finish restores with the error bit instead of success.
    pub fail_restore: bool,
    /// Finish arms with the error bit instead of success.
    pub fail_arm: bool,
    running: Option<(SimWorkflow, u32)>,
}

impl SimDimm {
    /// A module presenting the configured identity, with sub-second
    /// completion latencies and its timeout fields at sensible defaults
    /// (restore 20 s, arm 10 s, abort 5 s).
    pub fn new(config: &NvdimmConfig) -> Self {
        let mut regs = [0u8; REG_FILE_SIZE];
        let [vendor_lo, vendor_hi] = config.vendor.to_le_bytes();
        regs[usize::from(VENDOR_ID0)] = vendor_lo;
        regs[usize::from(VENDOR_ID1)] = vendor_hi;
        let [device_lo, device_hi] = config.device.to_le_bytes();
        regs[usize::from(DEVICE_ID0)] = device_lo;
        regs[usize::from(DEVICE_ID1)] = device_hi;
        regs[usize::from(REVISION_ID)] = config.revision;
        regs[usize::from(SERIAL0)..usize::from(SERIAL0) + 4]
            .copy_from_slice(&config.serial.to_le_bytes());
        regs[usize::from(RESTORE_TIMEOUT0)] = 20;
        regs[usize::from(RESTORE_TIMEOUT1)] = TIMEOUT_UNIT_SECONDS;
        regs[usize::from(ARM_TIMEOUT0)] = 10;
        regs[usize::from(ARM_TIMEOUT1)] = TIMEOUT_UNIT_SECONDS;
        regs[usize::from(ABORT_TIMEOUT0)] = 50; // 5 s in 100 ms units
        SimDimm {
            regs,
            restore_polls: 2,
            arm_polls: 1,
            dropped_strobes: 0,
            fail_restore: false,
            fail_arm: false,
            running: None,
        }
    }

    fn read(&mut self, reg: u8) -> u8 {
        if reg == MODULE_STATUS {
            self.step();
        }
        self.regs.get(usize::from(reg)).copied().unwrap_or(0)
    }

    fn write(&mut self, reg: u8, value: u8) {
        match reg {
            FUNC_CMD => self.command(value),
            // Write-one-to-clear completion registers.
            RESTORE_STATUS | ARM_STATUS | ABORT_STATUS => {
                self.regs[usize::from(reg)] &= !value;
            }
            _ => {
                if let Some(slot) = self.regs.get_mut(usize::from(reg)) {
                    *slot = value;
                }
            }
        }
    }

    /// One status poll passes; a running workflow gets one poll closer to
    /// completion.
    fn step(&mut self) {
        if let Some((workflow, polls_left)) = self.running {
            if polls_left == 0 {
                self.complete(workflow);
            } else {
                self.running = Some((workflow, polls_left - 1));
            }
        }
    }

    fn command(&mut self, value: u8) {
        let cmd = FuncCmd::from_bits_retain(value);
        if cmd.contains(FuncCmd::ABORT) {
            // Aborts land immediately, whatever the module was doing.
            self.running = None;
            self.regs[usize::from(MODULE_STATUS)] = 0;
            self.regs[usize::from(ABORT_STATUS)] |= WorkflowStatus::SUCCESS.bits();
            return;
        }
        if self.running.is_some() {
            // Commands are ignored while an operation runs.
            return;
        }
        if self.dropped_strobes > 0 {
            self.dropped_strobes -= 1;
            self.regs[usize::from(MODULE_STATUS)] = ModuleStatus::OP_IN_PROGRESS.bits();
            return;
        }
        if cmd.contains(FuncCmd::START_RESTORE) {
            self.start(SimWorkflow::Restore, self.restore_polls);
        } else if cmd.contains(FuncCmd::START_ARM) {
            self.start(SimWorkflow::Arm, self.arm_polls);
        }
    }

    fn start(&mut self, workflow: SimWorkflow, polls: u32) {
        let busy = match workflow {
            SimWorkflow::Restore => {
                ModuleStatus::OP_IN_PROGRESS | ModuleStatus::RESTORE_IN_PROGRESS
            }
            SimWorkflow::Arm => ModuleStatus::OP_IN_PROGRESS | ModuleStatus::ARM_IN_PROGRESS,
        };
        self.regs[usize::from(MODULE_STATUS)] = busy.bits();
        self.running = Some((workflow, polls));
    }

    fn complete(&mut self, workflow: SimWorkflow) {
        self.running = None;
        self.regs[usize::from(MODULE_STATUS)] = 0;
        let (status_reg, failed) = match workflow {
            SimWorkflow::Restore => (RESTORE_STATUS, self.fail_restore),
            SimWorkflow::Arm => (ARM_STATUS, self.fail_arm),
        };
        let bits = if failed {
            WorkflowStatus::ERROR
        } else {
            WorkflowStatus::SUCCESS
        };
        self.regs[usize::from(status_reg)] |= bits.bits();
    }
}

/// Register transport over a bank of simulated modules.
#[derive(Debug, Default)]
pub struct SimBus {
    dimms: Vec<SimDimm>,
}

impl SimBus {
    /// A bus answering for `dimms`, indexed in order.
    pub fn new(dimms: Vec<SimDimm>) -> Self {
        SimBus { dimms }
    }

    /// The module at `dimm`, to adjust its knobs.
    pub fn dimm_mut(&mut self, dimm: DimmIndex) -> Option<&mut SimDimm> {
        self.dimms.get_mut(dimm)
    }
}

impl RegisterAccess for SimBus {
    fn read_register(&mut self, dimm: DimmIndex, reg: u8) -> Result<u8, TransportError> {
        self.dimms
            .get_mut(dimm)
            .map(|d| d.read(reg))
            .ok_or(TransportError::Read(dimm, reg))
    }

    fn write_register(
        &mut self,
        dimm: DimmIndex,
        reg: u8,
        value: u8,
    ) -> Result<(), TransportError> {
        self.dimms
            .get_mut(dimm)
            .map(|d| d.write(reg, value))
            .ok_or(TransportError::Write(dimm, reg))
    }
}

/// Platform watchdog stand-in; remembers whether it was started.
#[derive(Debug, Default)]
pub struct SimWatchdog {
    enabled: bool,
}

impl SimWatchdog {
    /// Whether the watchdog was started.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl WatchdogCtl for SimWatchdog {
    fn enable(&mut self) -> Result<(), std::io::Error> {
        self.enabled = true;
        Ok(())
    }
}
