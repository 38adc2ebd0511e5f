// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Probe access to the memory under scrub.
//!
//! Uncorrectable errors do not fail the access that hits them; the hardware
//! raises an asynchronous fault signal some time later. The port models that:
//! probes never return errors, they only arm a latch the engine observes
//! after the down-counter interval has given the signal time to resolve.

use std::collections::BTreeSet;

use vm_memory::{Bytes, GuestAddress};

use super::{CACHE_LINE_SIZE, SCRUB_BLOCK_SIZE, ScrubError};
use crate::mem::SysMemory;
use crate::utils::{align_down, u64_to_usize};

/// Hardware access used by the scrub engine.
pub trait ScrubPort {
    /// Clears the latched fault signal.
    fn clear_fault(&mut self);

    /// Returns whether the fault signal latched since the last clear.
    fn fault_latched(&self) -> bool;

    /// Posted-read probe across `[pa, pa + len)`.
    ///
    /// Issues the reads back to back with a single synchronizing barrier at
    /// the end; any fault shows up in the latch, never in a return value.
    fn probe(&mut self, pa: u64, len: u64);

    /// Reads the single cache line containing `pa`, with a full barrier on
    /// both sides so the fault signal is attributable to exactly this line.
    fn read_line(&mut self, pa: u64);

    /// Zero-fills `[pa, pa + len)` and cleans the cache over it.
    fn clear_range(&mut self, pa: u64, len: u64) -> Result<(), ScrubError>;
}

/// Scrub port over the anonymous system memory map.
///
/// Faults are injected per cache line; a probe touching an injected line
/// latches the signal the way a real uncorrectable access would. Reads of
/// unmapped addresses latch it too.
#[derive(Debug)]
pub struct MemScrubPort {
    mem: SysMemory,
    faults: BTreeSet<u64>,
    latch: bool,
}

impl MemScrubPort {
    /// Creates a port over `mem` with no injected faults.
    pub fn new(mem: SysMemory) -> Self {
        Self {
            mem,
            faults: BTreeSet::new(),
            latch: false,
        }
    }

    /// Marks the cache line containing `pa` as uncorrectable.
    pub fn inject_fault(&mut self, pa: u64) {
        self.faults.insert(align_down(pa, CACHE_LINE_SIZE));
    }

    fn line_faults(&self, line: u64) -> bool {
        self.faults.contains(&line) || self.mem.read_obj::<u8>(GuestAddress(line)).is_err()
    }
}

impl ScrubPort for MemScrubPort {
    fn clear_fault(&mut self) {
        self.latch = false;
    }

    fn fault_latched(&self) -> bool {
        self.latch
    }

    fn probe(&mut self, pa: u64, len: u64) {
        let end = pa.saturating_add(len);
        let mut line = align_down(pa, CACHE_LINE_SIZE);
        while line < end {
            if self.line_faults(line) {
                self.latch = true;
            }
            line += CACHE_LINE_SIZE;
        }
    }

    fn read_line(&mut self, pa: u64) {
        if self.line_faults(align_down(pa, CACHE_LINE_SIZE)) {
            self.latch = true;
        }
    }

    fn clear_range(&mut self, pa: u64, len: u64) -> Result<(), ScrubError> {
        const ZEROS: [u8; u64_to_usize(SCRUB_BLOCK_SIZE)] = [0; u64_to_usize(SCRUB_BLOCK_SIZE)];
        let mut addr = pa;
        let mut left = len;
        while left > 0 {
            let chunk = left.min(SCRUB_BLOCK_SIZE);
            self.mem
                .write_slice(&ZEROS[..u64_to_usize(chunk)], GuestAddress(addr))?;
            addr = addr.saturating_add(chunk);
            left -= chunk;
        }
        // Rewriting the media heals the lines.
        let end = pa.saturating_add(len);
        self.faults.retain(|&line| line < pa || line >= end);
        Ok(())
    }
}
