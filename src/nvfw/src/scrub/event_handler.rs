// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wires the scrub engine's two wakeup sources into the event loop.

use event_manager::{EventOps, EventSet, Events, MutEventSubscriber};

use super::engine::ArsEngine;
use super::port::ScrubPort;
use crate::logger::{error, warn};

impl<P: ScrubPort> ArsEngine<P> {
    const PROCESS_DISPATCH: u32 = 0;
    const PROCESS_CONTINUATION: u32 = 1;

    fn register_dispatch_event(&self, ops: &mut EventOps) {
        if let Err(err) = ops.add(Events::with_data(
            &self.doorbell,
            Self::PROCESS_DISPATCH,
            EventSet::IN,
        )) {
            error!("ars: failed to register dispatch event: {err}");
        }
    }

    fn register_continuation_event(&self, ops: &mut EventOps) {
        if let Err(err) = ops.add(Events::with_data(
            &self.timer,
            Self::PROCESS_CONTINUATION,
            EventSet::IN,
        )) {
            error!("ars: failed to register continuation event: {err}");
        }
    }
}

impl<P: ScrubPort> MutEventSubscriber for ArsEngine<P> {
    fn process(&mut self, events: Events, _ops: &mut EventOps) {
        let event_set = events.event_set();
        if event_set != EventSet::IN {
            warn!("ars: spurious event set {event_set:?}");
            return;
        }
        match events.data() {
            Self::PROCESS_DISPATCH => self.process_dispatch(),
            Self::PROCESS_CONTINUATION => self.process_continuation(),
            unknown => warn!("ars: spurious event with data {unknown}"),
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        self.register_dispatch_event(ops);
        self.register_continuation_event(ops);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use event_manager::SubscriberOps;
    use smem_tables::Table;
    use smem_tables::ars::{ARS_TYPE_PERSISTENT, ArsStartRequest, ScanState};
    use smem_tables::info::{PlatformInfo, SMEM_REVISION};
    use vm_memory::GuestAddress;
    use zerocopy::little_endian::{U16, U64};

    use super::*;
    use crate::EventManager;
    use crate::mem::SysMemory;
    use crate::scrub::{
        ArsExchange, CACHE_LINE_SIZE, MemScrubPort, SCAN_INTERVAL_US, SCRUB_BLOCK_SIZE,
        ScrubRegion,
    };

    #[test]
    fn event_loop_scan_completes() {
        const NV_BASE: u64 = 0x100000;

        let mem = SysMemory::from_ranges(&[
            (GuestAddress(0), smem_tables::SMEM_SIZE),
            (GuestAddress(NV_BASE), 0x4000),
        ])
        .unwrap();
        PlatformInfo::new(SMEM_REVISION)
            .write_to_mem(&mem, GuestAddress(0))
            .unwrap();
        let exchange = ArsExchange::new(mem.clone(), GuestAddress(0)).unwrap();
        exchange.reset().unwrap();
        let caller = ArsExchange::new(mem.clone(), GuestAddress(0)).unwrap();

        let regions = vec![ScrubRegion {
            base: NV_BASE,
            len: 0x4000,
            handle: 11,
        }];
        let mut engine = ArsEngine::new(
            exchange,
            regions,
            MemScrubPort::new(mem.clone()),
            Duration::from_micros(SCAN_INTERVAL_US),
        )
        .unwrap();
        engine.port_mut().inject_fault(NV_BASE + CACHE_LINE_SIZE);
        let doorbell = engine.doorbell().try_clone().unwrap();

        let mut event_manager = EventManager::new().unwrap();
        event_manager.add_subscriber(Arc::new(Mutex::new(engine)));

        // Ring the doorbell and let the event loop drive the scan end to
        // end, dispatch and continuations alike.
        caller
            .post_start(&ArsStartRequest {
                start_pa: U64::new(NV_BASE),
                start_len: U64::new(2 * SCRUB_BLOCK_SIZE),
                ars_type: U16::new(ARS_TYPE_PERSISTENT),
            })
            .unwrap();
        doorbell.write(1).unwrap();

        for _ in 0..100 {
            event_manager.run_with_timeout(50).unwrap();
            if caller.scan_state().unwrap() != ScanState::InProgress {
                break;
            }
        }

        assert_eq!(caller.scan_state().unwrap(), ScanState::Complete);
        let report = caller.report().unwrap();
        assert_eq!(report.record_count.get(), 1);
        assert_eq!(report.records[0].handle.get(), 11);
        assert_eq!(report.records[0].pa.get(), NV_BASE + CACHE_LINE_SIZE);
        assert_eq!(report.restart_pa.get(), NV_BASE + 2 * SCRUB_BLOCK_SIZE);
    }
}
