// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The scrub state machine.
//!
//! A scan is a sequence of short wakeups. The dispatch wakeup validates the
//! request, clips it to NVDIMM-backed memory, probes the first block and arms
//! the down-counter. Every continuation wakeup harvests the probe outcome,
//! walks the block line by line when the fault signal latched, advances the
//! restart cursor and probes the next block. The exchange block carries the
//! whole scan state between wakeups; nothing here blocks, and nothing here
//! returns an error to a caller, because there is no caller to return to.

use std::fmt;
use std::time::Duration;

use smem_tables::ars::{
    ARS_FLAG_OVERFLOW, ARS_REPORT_OFFSET, ARS_TYPE_PERSISTENT, ArsCapabilities, ArsRecord,
    ArsStatus, ArsStatusReport, ClearErrorResult, FUNC_CLEAR_ERROR, FUNC_QUERY_CAPS,
    FUNC_QUERY_STATUS, FUNC_START_ARS, FUNC_TRANSLATE_SPA, MAX_ARS_RECORDS, ScanState,
    TranslateSpaResult,
};
use timerfd::{ClockId, SetTimeFlags, TimerFd, TimerState};
use vmm_sys_util::eventfd::EventFd;
use zerocopy::FromZeros;
use zerocopy::little_endian::{U16, U32, U64};

use super::exchange::ArsExchange;
use super::metrics::METRICS;
use super::port::ScrubPort;
use super::{CACHE_LINE_SIZE, SCRUB_BLOCK_SIZE, ScrubError, report_scrub_event_fail};
use crate::logger::{IncMetric, error, info, warn};

/// One NVDIMM-backed span the scrubber may visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubRegion {
    /// Base physical address.
    pub base: u64,
    /// Length in bytes.
    pub len: u64,
    /// Handle recorded against faults found here.
    pub handle: u32,
}

impl ScrubRegion {
    fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    fn contains(&self, pa: u64) -> bool {
        self.base <= pa && pa < self.end()
    }
}

/// The Address Range Scrub engine.
///
/// Owns the two wakeup sources and the exchange block view. `regions` is the
/// scrub surface, sorted by base; faults outside it are not our problem.
pub struct ArsEngine<P> {
    pub(crate) doorbell: EventFd,
    pub(crate) timer: TimerFd,
    scan_interval: Duration,
    exchange: ArsExchange,
    regions: Vec<ScrubRegion>,
    port: P,
}

// TimerFd carries no Debug impl; leave the timer out.
impl<P: fmt::Debug> fmt::Debug for ArsEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArsEngine")
            .field("doorbell", &self.doorbell)
            .field("scan_interval", &self.scan_interval)
            .field("exchange", &self.exchange)
            .field("regions", &self.regions)
            .field("port", &self.port)
            .finish()
    }
}

impl<P: ScrubPort> ArsEngine<P> {
    /// Creates an engine over `exchange` scrubbing `regions` through `port`.
    pub fn new(
        exchange: ArsExchange,
        regions: Vec<ScrubRegion>,
        port: P,
        scan_interval: Duration,
    ) -> Result<Self, ScrubError> {
        Ok(Self {
            doorbell: EventFd::new(libc::EFD_NONBLOCK).map_err(ScrubError::EventFd)?,
            timer: TimerFd::new_custom(ClockId::Monotonic, true, true)
                .map_err(ScrubError::Timer)?,
            scan_interval,
            exchange,
            regions,
            port,
        })
    }

    /// The software interrupt line callers ring after posting a function.
    pub fn doorbell(&self) -> &EventFd {
        &self.doorbell
    }

    /// The exchange block view.
    pub fn exchange(&self) -> &ArsExchange {
        &self.exchange
    }

    /// Access to the scrub port, mainly to inject faults on simulated
    /// platforms.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Services the software interrupt: consumes the edge, then runs the
    /// posted function.
    pub(crate) fn process_dispatch(&mut self) {
        if let Err(err) = self.doorbell.read() {
            report_scrub_event_fail(ScrubError::EventFd(err));
            return;
        }
        METRICS.dispatch_count.inc();
        if let Err(err) = self.dispatch() {
            report_scrub_event_fail(err);
            if let Err(err) = self
                .exchange
                .publish(ArsStatus::HardwareError, ScanState::PrematurelyStopped)
            {
                error!("ars: cannot publish dispatch failure: {err}");
            }
        }
    }

    /// Services the down-counter: disarms it, then advances the scan.
    pub(crate) fn process_continuation(&mut self) {
        // Disarm and consume before touching shared state; a one-shot that
        // fired cannot re-fire, but a spurious wakeup can.
        self.timer
            .set_state(TimerState::Disarmed, SetTimeFlags::Default);
        self.timer.read();
        METRICS.continuation_count.inc();
        if let Err(err) = self.continue_scan() {
            report_scrub_event_fail(err);
            if let Err(err) = self
                .exchange
                .publish(ArsStatus::HardwareError, ScanState::PrematurelyStopped)
            {
                error!("ars: cannot publish scan failure: {err}");
            }
        }
    }

    fn dispatch(&mut self) -> Result<(), ScrubError> {
        match self.exchange.header()?.function.get() {
            FUNC_QUERY_CAPS => self.query_capabilities(),
            FUNC_START_ARS => self.start_scan(),
            FUNC_QUERY_STATUS => self.query_status(),
            FUNC_CLEAR_ERROR => self.clear_error(),
            FUNC_TRANSLATE_SPA => self.translate_spa(),
            other => {
                METRICS.unknown_function_count.inc();
                warn!("ars: unknown function {other}");
                let state = self.exchange.scan_state()?;
                self.exchange.publish(ArsStatus::UnknownFunction, state)
            }
        }
    }

    fn query_capabilities(&mut self) -> Result<(), ScrubError> {
        METRICS.query_caps_count.inc();
        let caps = ArsCapabilities {
            // Header plus report, the largest answer Query-Status produces.
            max_query_size: U32::new((ARS_REPORT_OFFSET + size_of::<ArsStatusReport>()) as u32),
            clear_unit: U32::new(CACHE_LINE_SIZE as u32),
        };
        self.exchange.write_output(&caps)?;
        let state = self.exchange.scan_state()?;
        self.exchange.publish(ArsStatus::Success, state)
    }

    fn query_status(&mut self) -> Result<(), ScrubError> {
        METRICS.query_status_count.inc();
        // The report is maintained in place; answering means restating its
        // length and the current state.
        self.exchange.set_output_length(size_of::<ArsStatusReport>())?;
        let state = self.exchange.scan_state()?;
        self.exchange.publish(ArsStatus::Success, state)
    }

    fn start_scan(&mut self) -> Result<(), ScrubError> {
        METRICS.start_count.inc();
        let state = self.exchange.scan_state()?;
        if state == ScanState::InProgress {
            METRICS.busy_rejections.inc();
            warn!("ars: start request rejected, a scan is in progress");
            return self.exchange.publish(ArsStatus::Busy, ScanState::InProgress);
        }

        let req = self.exchange.start_request()?;
        let (pa, len, ars_type) = (req.start_pa.get(), req.start_len.get(), req.ars_type.get());
        if ars_type & ARS_TYPE_PERSISTENT == 0
            || pa % CACHE_LINE_SIZE != 0
            || len % CACHE_LINE_SIZE != 0
            || pa.checked_add(len).is_none()
        {
            return self.exchange.publish(ArsStatus::InvalidParams, state);
        }
        let end = pa + len;

        let mut report = ArsStatusReport::new_zeroed();
        report.start_pa = U64::new(pa);
        report.start_len = U64::new(len);
        report.ars_type = U16::new(ars_type);

        // Clip to the first NVDIMM-backed region the request touches.
        let Some(cursor) = self.clip(pa, len) else {
            // Nothing to scrub is a valid terminal outcome.
            report.restart_pa = U64::new(end);
            self.exchange.write_report(&report)?;
            METRICS.scans_completed.inc();
            info!("ars: request {pa:#x}+{len:#x} misses NVDIMM-backed memory");
            return self.exchange.publish(ArsStatus::Success, ScanState::Complete);
        };
        report.restart_pa = U64::new(cursor);
        report.restart_len = U64::new(end - cursor);
        self.exchange.write_report(&report)?;

        info!("ars: scan started over {pa:#x}+{len:#x}");
        // Probe the first block; the continuation harvests the outcome once
        // the down-counter gives the fault signal time to resolve.
        self.probe_block(cursor, end - cursor);
        self.arm_timer();
        self.exchange.publish(ArsStatus::Success, ScanState::InProgress)
    }

    fn continue_scan(&mut self) -> Result<(), ScrubError> {
        // Stale or duplicate fire after the scan reached a terminal state.
        if self.exchange.scan_state()? != ScanState::InProgress {
            METRICS.spurious_continuations.inc();
            return Ok(());
        }

        let mut report = self.exchange.report()?;
        let cursor = report.restart_pa.get();
        let remaining = report.restart_len.get();

        let Some(region) = self.regions.iter().find(|r| r.contains(cursor)).copied() else {
            // Only an external scribble over the block gets us here.
            warn!("ars: restart cursor {cursor:#x} left NVDIMM-backed memory, stopping");
            METRICS.scans_stopped.inc();
            return self
                .exchange
                .publish(ArsStatus::HardwareError, ScanState::PrematurelyStopped);
        };
        let len = SCRUB_BLOCK_SIZE.min(remaining).min(region.end() - cursor);

        // Harvest the probe outcome for the in-flight block.
        let mut dropped = false;
        if self.port.fault_latched() {
            dropped = self.localize_faults(&mut report, region.handle, cursor, len);
        }
        if dropped {
            report.flags = U16::new(report.flags.get() | ARS_FLAG_OVERFLOW);
            // The resume point stays at this block; its faults were only
            // partially recorded.
            self.exchange.write_report(&report)?;
            METRICS.scans_stopped.inc();
            warn!("ars: error record array overflowed at {cursor:#x}, stopping");
            return self
                .exchange
                .publish(ArsStatus::Success, ScanState::PrematurelyStopped);
        }

        let next = cursor.saturating_add(len);
        let remaining = remaining.saturating_sub(len);
        let end = next.saturating_add(remaining);
        let full = report.record_count.get() as usize == MAX_ARS_RECORDS;

        // Where does the scan go next, if anywhere?
        let resume = if remaining == 0 {
            None
        } else {
            self.clip(next, remaining)
        };
        match resume {
            None => {
                // Everything reachable has been covered.
                report.restart_pa = U64::new(end);
                report.restart_len = U64::ZERO;
                self.exchange.write_report(&report)?;
                METRICS.scans_completed.inc();
                let records = report.record_count.get();
                info!("ars: scan complete, {records} error records");
                self.exchange.publish(ArsStatus::Success, ScanState::Complete)
            }
            Some(_) if full => {
                // No room to record further faults trustworthily.
                report.restart_pa = U64::new(next);
                report.restart_len = U64::new(remaining);
                self.exchange.write_report(&report)?;
                METRICS.scans_stopped.inc();
                warn!("ars: error record array full, stopping at {next:#x}");
                self.exchange
                    .publish(ArsStatus::Success, ScanState::PrematurelyStopped)
            }
            Some(clipped) => {
                report.restart_pa = U64::new(clipped);
                report.restart_len = U64::new(end - clipped);
                self.exchange.write_report(&report)?;
                self.probe_block(clipped, end - clipped);
                self.arm_timer();
                self.exchange.publish(ArsStatus::Success, ScanState::InProgress)
            }
        }
    }

    fn clear_error(&mut self) -> Result<(), ScrubError> {
        METRICS.clear_error_count.inc();
        let state = self.exchange.scan_state()?;
        if state == ScanState::InProgress {
            METRICS.busy_rejections.inc();
            warn!("ars: clear request rejected, a scan is in progress");
            return self.exchange.publish(ArsStatus::Busy, ScanState::InProgress);
        }

        let req = self.exchange.clear_request()?;
        let (pa, len) = (req.pa.get(), req.len.get());
        if len == 0
            || pa % CACHE_LINE_SIZE != 0
            || len % CACHE_LINE_SIZE != 0
            || pa.checked_add(len).is_none()
            || !self.covered_by_regions(pa, len)
        {
            return self.exchange.publish(ArsStatus::InvalidParams, state);
        }

        if let Err(err) = self.port.clear_range(pa, len) {
            error!("ars: clear of {pa:#x}+{len:#x} failed: {err}");
            return self.exchange.publish(ArsStatus::HardwareError, state);
        }
        self.exchange.write_output(&ClearErrorResult {
            cleared_length: U64::new(len),
        })?;
        info!("ars: cleared {len:#x} bytes at {pa:#x}");
        // Synchronous completion; no continuation hand-off.
        self.exchange.publish(ArsStatus::Success, ScanState::Complete)
    }

    fn translate_spa(&mut self) -> Result<(), ScrubError> {
        METRICS.translate_count.inc();
        let state = self.exchange.scan_state()?;
        let pa = self.exchange.translate_request()?.pa.get();
        let Some(region) = self.regions.iter().find(|r| r.contains(pa)) else {
            return self.exchange.publish(ArsStatus::InvalidParams, state);
        };
        self.exchange.write_output(&TranslateSpaResult {
            translated_len: U64::new(region.end() - pa),
            handle: U32::new(region.handle),
            reserved: U32::ZERO,
            dpa: U64::new(pa - region.base),
        })?;
        self.exchange.publish(ArsStatus::Success, state)
    }

    /// First address at or after `cursor` that is NVDIMM-backed and still
    /// within `cursor + remaining`.
    fn clip(&self, cursor: u64, remaining: u64) -> Option<u64> {
        let end = cursor.saturating_add(remaining);
        self.regions.iter().find_map(|r| {
            let lo = cursor.max(r.base);
            (lo < end && lo < r.end()).then_some(lo)
        })
    }

    /// Whether `[pa, pa + len)` lies entirely within NVDIMM-backed memory.
    fn covered_by_regions(&self, pa: u64, len: u64) -> bool {
        let end = pa.saturating_add(len);
        let mut cursor = pa;
        for region in &self.regions {
            if region.end() <= cursor {
                continue;
            }
            if region.base > cursor {
                return false;
            }
            cursor = region.end().min(end);
            if cursor == end {
                return true;
            }
        }
        false
    }

    fn probe_block(&mut self, cursor: u64, remaining: u64) {
        let region_end = self
            .regions
            .iter()
            .find(|r| r.contains(cursor))
            .map_or(cursor, ScrubRegion::end);
        let len = SCRUB_BLOCK_SIZE.min(remaining).min(region_end - cursor);
        self.port.clear_fault();
        self.port.probe(cursor, len);
        METRICS.blocks_scanned.inc();
    }

    /// Walks the in-flight block one line at a time to find which lines
    /// raised the signal. Returns whether any record had to be dropped.
    fn localize_faults(
        &mut self,
        report: &mut ArsStatusReport,
        handle: u32,
        block_pa: u64,
        block_len: u64,
    ) -> bool {
        let mut dropped = false;
        let mut line = block_pa;
        while line < block_pa.saturating_add(block_len) {
            self.port.clear_fault();
            self.port.read_line(line);
            if self.port.fault_latched() {
                METRICS.faulty_lines.inc();
                dropped |= !append_record(report, handle, line, CACHE_LINE_SIZE);
            }
            line += CACHE_LINE_SIZE;
        }
        dropped
    }

    fn arm_timer(&mut self) {
        self.timer.set_state(
            TimerState::Oneshot(self.scan_interval),
            SetTimeFlags::Default,
        );
    }
}

/// Appends a faulty line, coalescing with the previous record when it is
/// byte-contiguous and owned by the same module. Returns false when the line
/// had to be dropped because the array is full.
fn append_record(report: &mut ArsStatusReport, handle: u32, pa: u64, len: u64) -> bool {
    let count = report.record_count.get() as usize;
    if count > 0 {
        let last = &mut report.records[count - 1];
        if last.handle.get() == handle && last.pa.get().saturating_add(last.len.get()) == pa {
            last.len = U64::new(last.len.get() + len);
            METRICS.records_merged.inc();
            return true;
        }
    }
    if count >= MAX_ARS_RECORDS {
        METRICS.record_overflows.inc();
        return false;
    }
    report.records[count] = ArsRecord {
        handle: U32::new(handle),
        reserved: U32::ZERO,
        pa: U64::new(pa),
        len: U64::new(len),
    };
    report.record_count = U32::new((count + 1) as u32);
    true
}

#[cfg(test)]
mod tests {
    use smem_tables::Table;
    use smem_tables::ars::ArsStartRequest;
    use smem_tables::info::{PlatformInfo, SMEM_REVISION};
    use vm_memory::{Bytes, GuestAddress};
    use zerocopy::IntoBytes;

    use super::*;
    use crate::mem::SysMemory;
    use crate::scrub::SCAN_INTERVAL_US;
    use crate::scrub::port::MemScrubPort;

    const NV_BASE: u64 = 0x100000;
    const BLOCK: u64 = SCRUB_BLOCK_SIZE;
    const LINE: u64 = CACHE_LINE_SIZE;

    /// Engine over a fresh memory map, an independent caller-side view of
    /// the same exchange block, and the backing memory itself.
    fn test_setup(regions: &[ScrubRegion]) -> (ArsEngine<MemScrubPort>, ArsExchange, SysMemory) {
        let mem = SysMemory::from_ranges(&[
            (GuestAddress(0), smem_tables::SMEM_SIZE),
            (GuestAddress(NV_BASE), 0x40000),
        ])
        .unwrap();
        PlatformInfo::new(SMEM_REVISION)
            .write_to_mem(&mem, GuestAddress(0))
            .unwrap();
        let exchange = ArsExchange::new(mem.clone(), GuestAddress(0)).unwrap();
        exchange.reset().unwrap();
        let caller = ArsExchange::new(mem.clone(), GuestAddress(0)).unwrap();
        let engine = ArsEngine::new(
            exchange,
            regions.to_vec(),
            MemScrubPort::new(mem.clone()),
            Duration::from_micros(SCAN_INTERVAL_US),
        )
        .unwrap();
        (engine, caller, mem)
    }

    fn one_region() -> Vec<ScrubRegion> {
        vec![ScrubRegion {
            base: NV_BASE,
            len: 0x40000,
            handle: 7,
        }]
    }

    fn ring(engine: &mut ArsEngine<MemScrubPort>) {
        engine.doorbell().write(1).unwrap();
        engine.process_dispatch();
    }

    fn start(engine: &mut ArsEngine<MemScrubPort>, pa: u64, len: u64) {
        engine
            .exchange()
            .post_start(&ArsStartRequest {
                start_pa: U64::new(pa),
                start_len: U64::new(len),
                ars_type: U16::new(ARS_TYPE_PERSISTENT),
            })
            .unwrap();
        ring(engine);
    }

    /// Runs continuations until the scan leaves `InProgress`.
    fn run_scan(engine: &mut ArsEngine<MemScrubPort>) -> ScanState {
        for _ in 0..1000 {
            if engine.exchange().scan_state().unwrap() != ScanState::InProgress {
                break;
            }
            engine.process_continuation();
        }
        engine.exchange().scan_state().unwrap()
    }

    #[test]
    fn continuation_is_noop_when_not_in_progress() {
        let (mut engine, caller, _) = test_setup(&one_region());

        // A terminal block with some content in it.
        let mut report = ArsStatusReport::new_zeroed();
        report.start_pa = U64::new(NV_BASE);
        report.record_count = U32::new(1);
        report.records[0] = ArsRecord {
            handle: U32::new(7),
            reserved: U32::ZERO,
            pa: U64::new(NV_BASE),
            len: U64::new(LINE),
        };
        engine.exchange().write_report(&report).unwrap();
        engine
            .exchange()
            .publish(ArsStatus::Success, ScanState::Complete)
            .unwrap();

        let before_hdr = caller.header().unwrap();
        let before = caller.report().unwrap();
        engine.process_continuation();
        let after_hdr = caller.header().unwrap();
        let after = caller.report().unwrap();

        assert_eq!(before_hdr.as_bytes(), after_hdr.as_bytes());
        assert_eq!(before.as_bytes(), after.as_bytes());
    }

    #[test]
    fn restart_cursor_is_monotonic() {
        // Two NVDIMM regions with a hole between them.
        let regions = vec![
            ScrubRegion {
                base: NV_BASE,
                len: BLOCK,
                handle: 0,
            },
            ScrubRegion {
                base: NV_BASE + 2 * BLOCK,
                len: BLOCK,
                handle: 1,
            },
        ];
        let (mut engine, caller, _) = test_setup(&regions);

        start(&mut engine, NV_BASE, 3 * BLOCK);
        let mut cursors = vec![caller.report().unwrap().restart_pa.get()];
        while caller.scan_state().unwrap() == ScanState::InProgress {
            engine.process_continuation();
            cursors.push(caller.report().unwrap().restart_pa.get());
        }

        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        for pair in cursors.windows(2) {
            assert!(pair[0] <= pair[1], "cursor went backwards: {cursors:#x?}");
        }
        // The hole was skipped in one step, everything else block by block.
        assert_eq!(
            cursors,
            vec![NV_BASE, NV_BASE + 2 * BLOCK, NV_BASE + 3 * BLOCK]
        );
    }

    #[test]
    fn scan_covers_range_exactly() {
        let (mut engine, caller, _) = test_setup(&one_region());

        // Unaligned-to-block but line-aligned start; tail shorter than a
        // block.
        let start_pa = NV_BASE + 0x800;
        let len = 2 * BLOCK + 0x800;
        start(&mut engine, start_pa, len);

        let mut covered = Vec::new();
        let mut cursor = caller.report().unwrap().restart_pa.get();
        while caller.scan_state().unwrap() == ScanState::InProgress {
            engine.process_continuation();
            let next = caller.report().unwrap().restart_pa.get();
            covered.push((cursor, next));
            cursor = next;
        }

        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        // No gaps, no overlaps, exact bounds.
        assert_eq!(covered.first().unwrap().0, start_pa);
        assert_eq!(covered.last().unwrap().1, start_pa + len);
        for pair in covered.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        // Steps advance by at most one block.
        for (lo, hi) in &covered {
            assert!(hi - lo <= BLOCK);
        }

        let report = caller.report().unwrap();
        assert_eq!(report.restart_pa.get(), start_pa + len);
        assert_eq!(report.restart_len.get(), 0);
    }

    #[test]
    fn two_block_scan_with_single_fault() {
        let (mut engine, caller, _) = test_setup(&one_region());
        engine.port_mut().inject_fault(NV_BASE + LINE);

        start(&mut engine, NV_BASE, 2 * BLOCK);
        assert_eq!(caller.scan_state().unwrap(), ScanState::InProgress);
        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        assert_eq!(caller.report().unwrap().restart_pa.get(), NV_BASE);

        // Block 1 processed: one record, cursor advanced, still in progress.
        engine.process_continuation();
        let report = caller.report().unwrap();
        assert_eq!(caller.scan_state().unwrap(), ScanState::InProgress);
        assert_eq!(report.record_count.get(), 1);
        assert_eq!(report.records[0].handle.get(), 7);
        assert_eq!(report.records[0].pa.get(), NV_BASE + LINE);
        assert_eq!(report.records[0].len.get(), LINE);
        assert_eq!(report.restart_pa.get(), NV_BASE + BLOCK);

        // Block 2 processed: complete, count unchanged.
        engine.process_continuation();
        let report = caller.report().unwrap();
        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        assert_eq!(report.record_count.get(), 1);
    }

    #[test]
    fn adjacent_lines_merge() {
        let (mut engine, caller, _) = test_setup(&one_region());
        // Two adjacent lines within block 1, plus a cross-block pair around
        // the block 1 / block 2 boundary.
        engine.port_mut().inject_fault(NV_BASE + 3 * LINE);
        engine.port_mut().inject_fault(NV_BASE + 4 * LINE);
        engine.port_mut().inject_fault(NV_BASE + BLOCK - LINE);
        engine.port_mut().inject_fault(NV_BASE + BLOCK);

        start(&mut engine, NV_BASE, 2 * BLOCK);
        assert_eq!(run_scan(&mut engine), ScanState::Complete);

        let report = caller.report().unwrap();
        assert_eq!(report.record_count.get(), 2);
        assert_eq!(report.records[0].pa.get(), NV_BASE + 3 * LINE);
        assert_eq!(report.records[0].len.get(), 2 * LINE);
        // The boundary pair merged across the block step.
        assert_eq!(report.records[1].pa.get(), NV_BASE + BLOCK - LINE);
        assert_eq!(report.records[1].len.get(), 2 * LINE);
    }

    #[test]
    fn distinct_handles_do_not_merge() {
        // Two back-to-back regions owned by different modules.
        let regions = vec![
            ScrubRegion {
                base: NV_BASE,
                len: BLOCK,
                handle: 0,
            },
            ScrubRegion {
                base: NV_BASE + BLOCK,
                len: BLOCK,
                handle: 1,
            },
        ];
        let (mut engine, caller, _) = test_setup(&regions);
        engine.port_mut().inject_fault(NV_BASE + BLOCK - LINE);
        engine.port_mut().inject_fault(NV_BASE + BLOCK);

        start(&mut engine, NV_BASE, 2 * BLOCK);
        assert_eq!(run_scan(&mut engine), ScanState::Complete);

        let report = caller.report().unwrap();
        // Byte-contiguous but different handles: two records.
        assert_eq!(report.record_count.get(), 2);
        assert_eq!(report.records[0].handle.get(), 0);
        assert_eq!(report.records[0].len.get(), LINE);
        assert_eq!(report.records[1].handle.get(), 1);
        assert_eq!(report.records[1].pa.get(), NV_BASE + BLOCK);
    }

    #[test]
    fn record_capacity_stops_scan() {
        let (mut engine, caller, _) = test_setup(&one_region());
        // 31 isolated faulty lines in block 1, two more in block 2; the 33rd
        // record does not fit.
        for i in 0..31 {
            engine.port_mut().inject_fault(NV_BASE + 2 * i * LINE);
        }
        engine.port_mut().inject_fault(NV_BASE + BLOCK);
        engine.port_mut().inject_fault(NV_BASE + BLOCK + 2 * LINE);

        start(&mut engine, NV_BASE, 2 * BLOCK);
        let state = run_scan(&mut engine);

        assert_eq!(state, ScanState::PrematurelyStopped);
        let report = caller.report().unwrap();
        assert_eq!(report.record_count.get(), MAX_ARS_RECORDS as u32);
        assert_eq!(report.flags.get() & ARS_FLAG_OVERFLOW, ARS_FLAG_OVERFLOW);
        // Entry 31 is the first fault of block 2, intact.
        assert_eq!(report.records[31].pa.get(), NV_BASE + BLOCK);
        assert_eq!(report.records[31].len.get(), LINE);
        // The resume point stays at the partially recorded block.
        assert_eq!(report.restart_pa.get(), NV_BASE + BLOCK);
        assert_eq!(report.restart_len.get(), BLOCK);
    }

    #[test]
    fn full_record_array_stops_before_next_block() {
        let (mut engine, caller, _) = test_setup(&one_region());
        // Exactly 32 isolated faulty lines in block 1 and more range ahead.
        for i in 0..32 {
            engine.port_mut().inject_fault(NV_BASE + 2 * i * LINE);
        }

        start(&mut engine, NV_BASE, 2 * BLOCK);
        let state = run_scan(&mut engine);

        assert_eq!(state, ScanState::PrematurelyStopped);
        let report = caller.report().unwrap();
        assert_eq!(report.record_count.get(), MAX_ARS_RECORDS as u32);
        // Nothing was dropped, so no overflow flag; block 1 is fully
        // recorded and the resume point is block 2.
        assert_eq!(report.flags.get() & ARS_FLAG_OVERFLOW, 0);
        assert_eq!(report.restart_pa.get(), NV_BASE + BLOCK);
        assert_eq!(report.restart_len.get(), BLOCK);
    }

    #[test]
    fn start_while_in_progress_is_rejected() {
        let (mut engine, caller, _) = test_setup(&one_region());

        start(&mut engine, NV_BASE, 4 * BLOCK);
        assert_eq!(caller.scan_state().unwrap(), ScanState::InProgress);

        // A second start request while scanning.
        start(&mut engine, NV_BASE + BLOCK, BLOCK);
        assert_eq!(caller.status().unwrap(), ArsStatus::Busy as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::InProgress);
        // The running scan is untouched.
        assert_eq!(caller.report().unwrap().start_len.get(), 4 * BLOCK);

        assert_eq!(run_scan(&mut engine), ScanState::Complete);

        // From a terminal state a new start is accepted.
        start(&mut engine, NV_BASE + BLOCK, BLOCK);
        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::InProgress);
        assert_eq!(caller.report().unwrap().start_pa.get(), NV_BASE + BLOCK);
        assert_eq!(run_scan(&mut engine), ScanState::Complete);
    }

    #[test]
    fn scan_missing_all_regions_completes_immediately() {
        let (mut engine, caller, _) = test_setup(&one_region());

        // Entirely below NVDIMM-backed memory.
        start(&mut engine, 0x40000, 2 * BLOCK);
        let report = caller.report().unwrap();
        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        assert_eq!(report.record_count.get(), 0);
        assert_eq!(report.start_pa.get(), 0x40000);
        assert_eq!(report.restart_pa.get(), 0x40000 + 2 * BLOCK);
        assert_eq!(report.restart_len.get(), 0);
    }

    #[test]
    fn start_request_validation() {
        let (mut engine, caller, _) = test_setup(&one_region());

        // Missing the persistent type bit.
        engine
            .exchange()
            .post_start(&ArsStartRequest {
                start_pa: U64::new(NV_BASE),
                start_len: U64::new(BLOCK),
                ars_type: U16::new(0),
            })
            .unwrap();
        ring(&mut engine);
        assert_eq!(caller.status().unwrap(), ArsStatus::InvalidParams as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::NoArs);

        // Line-unaligned start address.
        engine
            .exchange()
            .post_start(&ArsStartRequest {
                start_pa: U64::new(NV_BASE + 3),
                start_len: U64::new(BLOCK),
                ars_type: U16::new(ARS_TYPE_PERSISTENT),
            })
            .unwrap();
        ring(&mut engine);
        assert_eq!(caller.status().unwrap(), ArsStatus::InvalidParams as u16);
    }

    #[test]
    fn clear_error_zeroes_range() {
        let (mut engine, caller, mem) = test_setup(&one_region());

        // Dirty the range and fault one line in it.
        let pa = NV_BASE + BLOCK;
        let len = 4 * LINE;
        mem.write_slice(&[0xAB; 4 * LINE as usize], GuestAddress(pa))
            .unwrap();
        engine.port_mut().inject_fault(pa + LINE);

        engine
            .exchange()
            .post_clear(&smem_tables::ars::ClearErrorRequest {
                pa: U64::new(pa),
                len: U64::new(len),
            })
            .unwrap();
        ring(&mut engine);

        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        let result: ClearErrorResult = caller.read_output().unwrap();
        assert_eq!(result.cleared_length.get(), len);

        // The range reads back zero and no longer faults.
        let mut readback = [0xFFu8; 4 * LINE as usize];
        mem.read_slice(&mut readback, GuestAddress(pa)).unwrap();
        assert!(readback.iter().all(|b| *b == 0));
        engine.port_mut().probe(pa, len);
        assert!(!engine.port_mut().fault_latched());

        // Invalid requests are rejected.
        for (bad_pa, bad_len) in [
            (pa + 3, len),  // unaligned address
            (pa, 0),        // empty
            (0x40000, len), // outside NVDIMM-backed memory
        ] {
            engine
                .exchange()
                .post_clear(&smem_tables::ars::ClearErrorRequest {
                    pa: U64::new(bad_pa),
                    len: U64::new(bad_len),
                })
                .unwrap();
            ring(&mut engine);
            assert_eq!(caller.status().unwrap(), ArsStatus::InvalidParams as u16);
        }
    }

    #[test]
    fn query_capabilities_reports_limits() {
        let (mut engine, caller, _) = test_setup(&one_region());
        caller.post_function(FUNC_QUERY_CAPS).unwrap();
        ring(&mut engine);

        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        let caps: ArsCapabilities = caller.read_output().unwrap();
        assert_eq!(
            caps.max_query_size.get() as usize,
            ARS_REPORT_OFFSET + size_of::<ArsStatusReport>()
        );
        assert_eq!(u64::from(caps.clear_unit.get()), CACHE_LINE_SIZE);
        assert_eq!(
            caller.header().unwrap().output_length.get() as usize,
            size_of::<ArsCapabilities>()
        );
        // Scan state is untouched.
        assert_eq!(caller.scan_state().unwrap(), ScanState::NoArs);
    }

    #[test]
    fn translate_spa_resolves_handle() {
        let regions = vec![
            ScrubRegion {
                base: NV_BASE,
                len: BLOCK,
                handle: 3,
            },
            ScrubRegion {
                base: NV_BASE + 4 * BLOCK,
                len: 2 * BLOCK,
                handle: 9,
            },
        ];
        let (mut engine, caller, _) = test_setup(&regions);

        caller
            .post_translate(&smem_tables::ars::TranslateSpaRequest {
                pa: U64::new(NV_BASE + 4 * BLOCK + 0x80),
            })
            .unwrap();
        ring(&mut engine);

        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        let result: TranslateSpaResult = caller.read_output().unwrap();
        assert_eq!(result.handle.get(), 9);
        assert_eq!(result.dpa.get(), 0x80);
        assert_eq!(result.translated_len.get(), 2 * BLOCK - 0x80);

        // An address in a hole does not translate.
        caller
            .post_translate(&smem_tables::ars::TranslateSpaRequest {
                pa: U64::new(NV_BASE + 2 * BLOCK),
            })
            .unwrap();
        ring(&mut engine);
        assert_eq!(caller.status().unwrap(), ArsStatus::InvalidParams as u16);
    }

    #[test]
    fn unknown_function_is_reported() {
        let (mut engine, caller, _) = test_setup(&one_region());
        caller.post_function(0xDEAD).unwrap();
        ring(&mut engine);

        assert_eq!(caller.status().unwrap(), ArsStatus::UnknownFunction as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::NoArs);
    }

    #[test]
    fn query_status_restates_report() {
        let (mut engine, caller, _) = test_setup(&one_region());
        engine.port_mut().inject_fault(NV_BASE);
        start(&mut engine, NV_BASE, BLOCK);
        assert_eq!(run_scan(&mut engine), ScanState::Complete);

        caller.post_function(FUNC_QUERY_STATUS).unwrap();
        ring(&mut engine);
        assert_eq!(caller.status().unwrap(), ArsStatus::Success as u16);
        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        assert_eq!(
            caller.header().unwrap().output_length.get() as usize,
            size_of::<ArsStatusReport>()
        );
        assert_eq!(caller.report().unwrap().record_count.get(), 1);
    }
}
